use std::{
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    sync::Mutex,
};
use super::{DiskError, Result};

// A contiguous part of a piece stored in a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {

    // Index of the file in descriptor order.
    pub file_idx: usize,

    // Where the span starts within the file.
    pub file_offset: u64,

    // Where the span starts within the piece.
    pub piece_offset: usize,

    pub len: usize,

}

// Walks the files in order, cutting them at piece boundaries.
// A piece may straddle several files and a file may cover many pieces.
pub fn map_pieces(file_lens: &[u64], piece_len: usize) -> Vec<Vec<Span>> {
    let mut pieces: Vec<Vec<Span>> = Vec::new();
    // Bytes already mapped into the last piece.
    let mut cursor = piece_len;

    for (file_idx, &file_len) in file_lens.iter().enumerate() {
        let mut file_offset = 0;
        while file_offset < file_len {
            if cursor == piece_len {
                pieces.push(Vec::new());
                cursor = 0;
            }
            let len = (file_len - file_offset).min((piece_len - cursor) as u64) as usize;
            if let Some(spans) = pieces.last_mut() {
                spans.push(Span { file_idx, file_offset, piece_offset: cursor, len });
            }
            file_offset += len as u64;
            cursor += len;
        }
    }

    pieces
}

// Reads each span into its place in the piece, bytes past the end of a
// short file are left zeroed.
pub fn read_spans(spans: &[Span], piece_len: usize, files: &[Mutex<File>]) -> Result<Vec<u8>> {
    let mut buf = vec![0; piece_len];

    for span in spans {
        let mut f = files[span.file_idx].lock()?;
        f.seek(SeekFrom::Start(span.file_offset))?;

        let dest = &mut buf[span.piece_offset..span.piece_offset + span.len];
        let mut filled = 0;
        while filled < dest.len() {
            match f.read(&mut dest[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(buf)
}

pub fn write_spans(spans: &[Span], data: &[u8], files: &[Mutex<File>]) -> Result<()> {
    let expected: usize = spans.iter().map(|s| s.len).sum();
    if expected != data.len() {
        return Err(DiskError::IoSizeError { expected, actual: data.len() });
    }

    for span in spans {
        let mut f = files[span.file_idx].lock()?;
        f.seek(SeekFrom::Start(span.file_offset))?;
        f.write_all(&data[span.piece_offset..span.piece_offset + span.len])?;
    }

    Ok(())
}

use std::{
    collections::VecDeque,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};
use crate::{
    metainfo::{self, Info, MetaInfo, MetaInfoError},
    verify,
};

#[derive(thiserror::Error, Debug)]
pub enum BuildError {

    #[error("error accessing {path:?}: {source}")]
    IoError {
        path: PathBuf,
        source: io::Error,
    },

    #[error("{0:?} is neither a file nor a directory")]
    NotFileOrDir(PathBuf),

    #[error("{0:?} has no usable name")]
    InvalidName(PathBuf),

    #[error("nothing to share, content is empty")]
    EmptyContent,

    #[error("files changed size while hashing, expected {expected} bytes, read {actual}")]
    SizeChanged {
        expected: u64,
        actual: u64,
    },

    #[error("bencode error: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid metainfo: {0}")]
    MetaInfoError(#[from] MetaInfoError),
}

type Result<T> = std::result::Result<T, BuildError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BuildError + '_ {
    move |source| BuildError::IoError { path: path.to_path_buf(), source }
}

// A file found on the walk.
#[derive(Debug)]
struct Entry {

    // Where to read it from.
    full_path: PathBuf,

    // Components relative to the root directory.
    path: Vec<String>,

    length: u64,

}

// Creates the descriptor of a file, or of every file under a directory.
// Directories are walked breadth first with entries in name order.
pub fn build<P: AsRef<Path>>(path: P, piece_len: usize) -> Result<MetaInfo> {

    let path = path.as_ref();
    let root = std::fs::canonicalize(path).map_err(io_err(path))?;
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BuildError::InvalidName(path.to_path_buf()))?
        .to_string();

    let meta = std::fs::metadata(&root).map_err(io_err(&root))?;
    let (entries, single) = if meta.is_file() {
        let entry = Entry { full_path: root.clone(), path: vec![name.clone()], length: meta.len() };
        (vec![entry], true)
    } else if meta.is_dir() {
        (walk(&root)?, false)
    } else {
        return Err(BuildError::NotFileOrDir(root));
    };

    let total_len: u64 = entries.iter().map(|e| e.length).sum();
    if total_len == 0 {
        return Err(BuildError::EmptyContent);
    }
    tracing::info!("hashing {} files, {} bytes", entries.len(), total_len);

    let mut chunks = PieceChunks::new(entries.iter().map(|e| e.full_path.clone()).collect(), piece_len);
    let pieces = chunks.by_ref().try_fold(Vec::new(), |mut pieces, chunk| {
        pieces.extend_from_slice(&verify::hash_piece(&chunk?));
        Ok::<_, BuildError>(pieces)
    })?;
    if chunks.read != total_len {
        return Err(BuildError::SizeChanged { expected: total_len, actual: chunks.read });
    }

    let (length, files) = if single {
        (Some(total_len), None)
    } else {
        let files = entries
            .into_iter()
            .map(|e| metainfo::File { length: e.length, path: e.path })
            .collect();
        (None, Some(files))
    };
    let info = Info {
        files,
        length,
        name,
        piece_length: piece_len as u64,
        pieces,
    };

    let mut metainfo = MetaInfo::from_info_bytes(serde_bencode::to_bytes(&info)?)?;
    metainfo.created_by = Some(format!("rill/{}", env!("CARGO_PKG_VERSION")));
    metainfo.creation_date = Some(chrono::Utc::now().timestamp());
    tracing::info!("created {} with info hash {}", metainfo.name(), metainfo.info_hash_hex());
    Ok(metainfo)
}

fn walk(root: &Path) -> Result<Vec<Entry>> {

    let mut entries = Vec::new();
    let mut dirs = VecDeque::from([(root.to_path_buf(), Vec::<String>::new())]);

    while let Some((dir, prefix)) = dirs.pop_front() {
        let mut children = std::fs::read_dir(&dir)
            .map_err(io_err(&dir))?
            .map(|e| e.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(io_err(&dir))?;
        children.sort();

        for child in children {
            let Some(component) = child.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                return Err(BuildError::InvalidName(child));
            };
            let mut path = prefix.clone();
            path.push(component);

            let meta = std::fs::metadata(&child).map_err(io_err(&child))?;
            if meta.is_file() {
                entries.push(Entry { full_path: child, path, length: meta.len() });
            } else if meta.is_dir() {
                dirs.push_back((child, path));
            } else {
                tracing::debug!("skipping {:?}", child);
            }
        }
    }

    Ok(entries)
}

// Content of a list of files cut at piece boundaries, read lazily. Only the
// last chunk may be short, and the sequence ends at the first error.
struct PieceChunks {

    paths: std::vec::IntoIter<PathBuf>,

    current: Option<(PathBuf, File)>,

    piece_len: usize,

    // Bytes handed out so far.
    read: u64,

    done: bool,

}

impl PieceChunks {
    fn new(paths: Vec<PathBuf>, piece_len: usize) -> Self {
        Self {
            paths: paths.into_iter(),
            current: None,
            piece_len,
            read: 0,
            done: false,
        }
    }
}

impl Iterator for PieceChunks {

    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = vec![0; self.piece_len];
        let mut filled = 0;
        while filled < self.piece_len {
            if self.current.is_none() {
                let Some(path) = self.paths.next() else {
                    break;
                };
                match File::open(&path) {
                    Ok(file) => self.current = Some((path, file)),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(io_err(&path)(e)));
                    },
                }
            }
            let Some((path, file)) = self.current.as_mut() else {
                break;
            };

            match file.read(&mut buf[filled..]) {
                Ok(0) => self.current = None,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => {
                    self.done = true;
                    return Some(Err(io_err(path)(e)));
                },
            }
        }

        if filled == 0 {
            self.done = true;
            return None;
        }
        buf.truncate(filled);
        self.read += filled as u64;
        Some(Ok(buf))
    }
}

use std::path::Path;
use bytes::Bytes;
use serde_derive::{Deserialize, Serialize};
use crate::{de, verify, ID};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("malformed bencode: {0}")]
    ScanError(#[from] de::ScanError),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("metainfo has no info dictionary")]
    MissingInfo,

    #[error("invalid pieces length, must be a non-zero multiple of 20")]
    InvalidPiecesLength,

    #[error("piece length must be greater than 0")]
    InvalidPieceLength,

    #[error("info must contain exactly one of length or files")]
    AmbiguousLayout,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("invalid path component: {0:?}")]
    InvalidPathComponent(String),

    #[error("total length of files overflows")]
    LengthOverflow,

    #[error("torrent describes {expected} pieces but has {actual} hashes")]
    PiecesMismatch {
        expected: u64,
        actual: u64,
    },

    #[error("info hash does not match")]
    InfoHashMismatch,
}

type Result<T> = std::result::Result<T, MetaInfoError>;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct File {

    // Length of the file in bytes.
    pub length: u64,

    // One or more path components, the last being the file name.
    pub path: Vec<String>,

}

// Fields are declared in bencode key order.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Info {

    // A list of dictionaries, one for each file (multi file mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    // Length of the file in bytes (single file mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    // File name, or root directory name in multi file mode.
    pub name: String,

    // Number of bytes in each piece.
    #[serde(rename = "piece length")]
    pub piece_length: u64,

    // Concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

}

// Optional keys of the outer dictionary, the info dict is extracted raw.
#[derive(Deserialize)]
struct Envelope {

    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,

    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,

    #[serde(default)]
    comment: Option<String>,

}

#[derive(Clone)]
pub struct MetaInfo {

    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,

    // The info dict exactly as it was serialized, served over ut_metadata.
    pub info_raw: Bytes,

    // sha1 hash of info_raw.
    pub info_hash: ID,

    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    pub creation_date: Option<i64>,

    // (optional) name and version of the program used to create the .torrent.
    pub created_by: Option<String>,

    // (optional) free-form textual comments of the author.
    pub comment: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<Path>>(path: P) -> Result<MetaInfo> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }

        let metainfo = MetaInfo::from_bytes(&std::fs::read(path)?)?;
        tracing::debug!("metainfo loaded: {:#?}", metainfo);
        Ok(metainfo)
    }

    // Parses a whole .torrent file.
    pub fn from_bytes(buf: &[u8]) -> Result<MetaInfo> {
        let info_raw = de::dict_value(buf, b"info")?.ok_or(MetaInfoError::MissingInfo)?;
        let envelope: Envelope = serde_bencode::from_bytes(buf)?;

        let mut metainfo = MetaInfo::from_info_bytes(info_raw.to_vec())?;
        metainfo.creation_date = envelope.creation_date;
        metainfo.created_by = envelope.created_by;
        metainfo.comment = envelope.comment;
        Ok(metainfo)
    }

    // Builds metainfo from a raw info dict, as received through metadata exchange.
    pub fn from_info_bytes(info_raw: Vec<u8>) -> Result<MetaInfo> {
        // Reject trailing bytes so the hash covers exactly one dictionary.
        if de::value_len(&info_raw)? != info_raw.len() {
            return Err(MetaInfoError::ScanError(de::ScanError::InvalidToken(info_raw.len())));
        }
        let info: Info = serde_bencode::from_bytes(&info_raw)?;
        let metainfo = MetaInfo {
            info,
            info_hash: verify::hash_info(&info_raw),
            info_raw: Bytes::from(info_raw),
            creation_date: None,
            created_by: None,
            comment: None,
        };
        metainfo.validate()?;
        Ok(metainfo)
    }

    pub fn validate(&self) -> Result<()> {
        let info = &self.info;

        if info.pieces.is_empty() || info.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if info.piece_length == 0 {
            return Err(MetaInfoError::InvalidPieceLength);
        }
        validate_component(&info.name)?;

        match (&info.length, &info.files) {
            (Some(_), None) => {},
            (None, Some(files)) if !files.is_empty() => {
                for file in files {
                    if file.path.is_empty() {
                        return Err(MetaInfoError::FileEmptyPath);
                    }
                    file.path.iter().try_for_each(|c| validate_component(c))?;
                }
            },
            _ => return Err(MetaInfoError::AmbiguousLayout),
        }

        let total = match &info.files {
            Some(files) => files.iter().try_fold(0u64, |total, f| total.checked_add(f.length)),
            None => info.length,
        }.ok_or(MetaInfoError::LengthOverflow)?;
        let expected = total.div_ceil(info.piece_length);
        let actual = self.num_pieces() as u64;
        if expected != actual {
            return Err(MetaInfoError::PiecesMismatch { expected, actual });
        }

        Ok(())
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    // Length of a given piece, only the last may be shorter.
    pub fn piece_size(&self, idx: usize) -> usize {
        let piece_len = self.info.piece_length;
        let start = idx as u64 * piece_len;
        (self.total_len().saturating_sub(start)).min(piece_len) as usize
    }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    // Files in descriptor order, single file mode yields one file named after the torrent.
    pub fn files(&self) -> Vec<File> {
        match &self.info.files {
            Some(files) => files.clone(),
            None => vec![File {
                length: self.info.length.unwrap_or(0),
                path: vec![self.info.name.clone()],
            }],
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // The .torrent file contents, { info: <raw info> } plus optional creator keys.
    pub fn to_torrent_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.info_raw.len() + 64);
        buf.push(b'd');
        if let Some(created_by) = &self.created_by {
            buf.extend_from_slice(b"10:created by");
            buf.extend_from_slice(format!("{}:", created_by.len()).as_bytes());
            buf.extend_from_slice(created_by.as_bytes());
        }
        if let Some(date) = self.creation_date {
            buf.extend_from_slice(format!("13:creation datei{}e", date).as_bytes());
        }
        buf.extend_from_slice(b"4:info");
        buf.extend_from_slice(&self.info_raw);
        buf.push(b'e');
        buf
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::DateTime::from_timestamp(v, 0)
                .map(|date| date.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }
}

fn validate_component(component: &str) -> Result<()> {
    if component.is_empty()
    || component == "."
    || component == ".."
    || component.contains(['/', '\\'])
    {
        return Err(MetaInfoError::InvalidPathComponent(component.to_string()));
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    for next in ["KiB", "MiB", "GiB", "TiB"] {
        if size <= 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = next;
    }
    format!("{:.2} {}", size, unit)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("creation_date", &self.creation_date_fmt())
            .field("created_by", &self.created_by)
            .field("comment", &self.comment)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .finish()
    }
}

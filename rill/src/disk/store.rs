use std::{
    collections::BTreeSet,
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use lru::LruCache;
use crate::{metainfo::MetaInfo, verify, Bitfield, ID};
use super::{piece::{self, Span}, DiskError, Result};

// Owns the file handles of a torrent and maps pieces onto them.
pub struct Store {

    // <dir>/<name>, the file itself or the root directory.
    root: PathBuf,

    piece_len: usize,

    total_len: u64,

    piece_hashes: Vec<ID>,

    // Spans of each piece, computed once.
    pieces: Vec<Vec<Span>>,

    files: Vec<Mutex<File>>,

    // Peers often request several blocks of one piece, so whole pieces are cached.
    read_cache: Mutex<LruCache<usize, Arc<Vec<u8>>>>,

    // Existing data is only worth checking if it was there before we opened it.
    verify_existing: bool,

}

impl Store {

    // Creates the file tree (if missing) and computes the piece layout.
    pub fn materialize(
        metainfo: &MetaInfo,
        dir: &Path,
        truncate: bool,
        cache_size: usize,
    ) -> Result<Store> {
        let root = dir.join(metainfo.name());
        let root_existed = root.exists();
        let paths = file_paths(metainfo, &root);

        // Create each unique parent directory once.
        let parents: BTreeSet<&Path> = paths.iter().filter_map(|p| p.parent()).collect();
        for parent in parents {
            if !parent.is_dir() {
                tracing::info!("creating directory: {:?}", parent);
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut handles = Vec::with_capacity(paths.len());
        for path in &paths {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(truncate)
                .open(path)?;
            tracing::debug!("opened file: {:?}", path);
            handles.push(Mutex::new(file));
        }

        Store::new(metainfo, root, handles, root_existed && !truncate, cache_size)
    }

    // Opens an existing file tree read only, creating nothing. Every file
    // must be there, their content is checked by check_existing.
    pub fn open_existing(metainfo: &MetaInfo, dir: &Path, cache_size: usize) -> Result<Store> {
        let root = dir.join(metainfo.name());
        let handles = file_paths(metainfo, &root)
            .into_iter()
            .map(|path| match File::open(&path) {
                Ok(file) => {
                    tracing::debug!("opened file: {:?}", path);
                    Ok(Mutex::new(file))
                },
                Err(source) => Err(DiskError::OpenError { path, source }),
            })
            .collect::<Result<Vec<_>>>()?;

        Store::new(metainfo, root, handles, true, cache_size)
    }

    fn new(
        metainfo: &MetaInfo,
        root: PathBuf,
        files: Vec<Mutex<File>>,
        verify_existing: bool,
        cache_size: usize,
    ) -> Result<Store> {
        let file_lens: Vec<u64> = metainfo.files().iter().map(|f| f.length).collect();
        let pieces = piece::map_pieces(&file_lens, metainfo.piece_len());
        if pieces.len() != metainfo.num_pieces() {
            return Err(DiskError::IoSizeError {
                expected: metainfo.num_pieces(),
                actual: pieces.len(),
            });
        }

        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Ok(Store {
            root,
            piece_len: metainfo.piece_len(),
            total_len: metainfo.total_len(),
            piece_hashes: metainfo.piece_hashes(),
            pieces,
            files,
            read_cache: Mutex::new(LruCache::new(cache_size)),
            verify_existing,
        })
    }

    pub fn root(&self) -> &Path { &self.root }

    pub fn num_pieces(&self) -> usize { self.pieces.len() }

    pub fn spans(&self, idx: usize) -> Option<&[Span]> {
        self.pieces.get(idx).map(Vec::as_slice)
    }

    pub fn piece_hash(&self, idx: usize) -> Option<&ID> {
        self.piece_hashes.get(idx)
    }

    pub fn piece_size(&self, idx: usize) -> usize {
        let start = (idx * self.piece_len) as u64;
        (self.total_len.saturating_sub(start)).min(self.piece_len as u64) as usize
    }

    pub fn read_piece(&self, idx: usize) -> Result<Vec<u8>> {
        let spans = self.spans(idx).ok_or(DiskError::InvalidPiece(idx))?;
        piece::read_spans(spans, self.piece_size(idx), &self.files)
    }

    pub fn write_piece(&self, idx: usize, data: &[u8]) -> Result<()> {
        let spans = self.spans(idx).ok_or(DiskError::InvalidPiece(idx))?;
        piece::write_spans(spans, data, &self.files)?;
        self.read_cache.lock()?.pop(&idx);
        Ok(())
    }

    // Reads a piece for serving, going through the cache.
    pub fn read_cached(&self, idx: usize) -> Result<Arc<Vec<u8>>> {
        if let Some(piece) = self.read_cache.lock()?.get(&idx) {
            tracing::trace!("cache hit for piece {}", idx);
            return Ok(Arc::clone(piece));
        }
        let piece = Arc::new(self.read_piece(idx)?);
        self.read_cache.lock()?.put(idx, Arc::clone(&piece));
        Ok(piece)
    }

    // Hashes every piece on disk, returning which ones are already present.
    pub fn check_existing(&self) -> Bitfield {
        let mut bitfield = Bitfield::repeat(false, self.num_pieces());
        if !self.verify_existing {
            return bitfield;
        }

        for idx in 0..self.num_pieces() {
            match self.read_piece(idx) {
                Ok(data) => {
                    if verify::verify_piece(&data, &self.piece_hashes[idx]) {
                        bitfield.set(idx, true);
                    }
                },
                Err(e) => tracing::warn!("failed to read piece {}: {}", idx, e),
            }
        }

        tracing::info!("{}/{} pieces present on disk", bitfield.count_ones(), self.num_pieces());
        bitfield
    }
}

// Where each file of the torrent lives, in descriptor order.
fn file_paths(metainfo: &MetaInfo, root: &Path) -> Vec<PathBuf> {
    if metainfo.is_multi_file() {
        metainfo
            .files()
            .iter()
            .map(|f| f.path.iter().fold(root.to_path_buf(), |p, c| p.join(c)))
            .collect()
    } else {
        vec![root.to_path_buf()]
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("num_pieces", &self.pieces.len())
            .field("num_files", &self.files.len())
            .finish()
    }
}

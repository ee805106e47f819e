use std::path::Path;
use crate::{
    metainfo::{File, Info, MetaInfo},
    verify,
    Bitfield,
};
use super::{piece::map_pieces, Span, Store};

// Builds a multi file metainfo over the given file contents.
fn multi_file(name: &str, contents: &[(&str, Vec<u8>)], piece_len: usize) -> MetaInfo {
    let all: Vec<u8> = contents.iter().flat_map(|(_, c)| c.iter().copied()).collect();
    let pieces = all.chunks(piece_len).flat_map(verify::hash_piece).collect();
    let info = Info {
        files: Some(contents.iter().map(|(path, c)| File {
            length: c.len() as u64,
            path: path.split('/').map(String::from).collect(),
        }).collect()),
        length: None,
        name: name.to_string(),
        piece_length: piece_len as u64,
        pieces,
    };
    MetaInfo::from_info_bytes(serde_bencode::to_bytes(&info).unwrap()).unwrap()
}

fn write_tree(dir: &Path, name: &str, contents: &[(&str, Vec<u8>)]) {
    for (path, data) in contents {
        let path = dir.join(name).join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }
}

fn sample() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("a.bin", (0..5000u32).map(|i| i as u8).collect()),
        ("sub/b.bin", vec![7; 3000]),
        ("sub/deeper/c.bin", (0..9000u32).map(|i| (i * 3) as u8).collect()),
    ]
}

#[test]
fn test_map_pieces_straddles_files() {
    let pieces = map_pieces(&[5, 3, 10], 4);
    assert_eq!(pieces.len(), 5);
    assert_eq!(pieces[0], vec![Span { file_idx: 0, file_offset: 0, piece_offset: 0, len: 4 }]);
    assert_eq!(pieces[1], vec![
        Span { file_idx: 0, file_offset: 4, piece_offset: 0, len: 1 },
        Span { file_idx: 1, file_offset: 0, piece_offset: 1, len: 3 },
    ]);
    assert_eq!(pieces[2], vec![Span { file_idx: 2, file_offset: 0, piece_offset: 0, len: 4 }]);
    assert_eq!(pieces[4], vec![Span { file_idx: 2, file_offset: 8, piece_offset: 0, len: 2 }]);
}

#[test]
fn test_map_pieces_skips_empty_files() {
    let pieces = map_pieces(&[0, 4, 0], 4);
    assert_eq!(pieces, vec![vec![Span { file_idx: 1, file_offset: 0, piece_offset: 0, len: 4 }]]);
}

#[test]
fn test_write_read_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let contents = sample();
    let all: Vec<u8> = contents.iter().flat_map(|(_, c)| c.iter().copied()).collect();
    let metainfo = multi_file("tree", &contents, 4096);

    let store = Store::materialize(&metainfo, tmp.path(), false, 4).unwrap();
    assert!(tmp.path().join("tree/sub/deeper").is_dir());
    assert_eq!(store.num_pieces(), 5);

    for (idx, chunk) in all.chunks(4096).enumerate() {
        store.write_piece(idx, chunk).unwrap();
    }
    for (idx, chunk) in all.chunks(4096).enumerate() {
        assert_eq!(store.read_piece(idx).unwrap(), chunk);
    }
    // Piece 1 straddles a.bin and sub/b.bin.
    assert_eq!(store.spans(1).unwrap().len(), 2);

    for (path, data) in &contents {
        assert_eq!(&std::fs::read(tmp.path().join("tree").join(path)).unwrap(), data);
    }
}

#[test]
fn test_check_existing_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let contents = sample();
    write_tree(tmp.path(), "tree", &contents);
    let metainfo = multi_file("tree", &contents, 4096);

    let first = Store::materialize(&metainfo, tmp.path(), false, 4).unwrap().check_existing();
    let second = Store::materialize(&metainfo, tmp.path(), false, 4).unwrap().check_existing();
    assert_eq!(first, Bitfield::repeat(true, 5));
    assert_eq!(first, second);
}

#[test]
fn test_check_existing_detects_corruption() {
    let tmp = tempfile::tempdir().unwrap();
    let mut contents = sample();
    let metainfo = multi_file("tree", &contents, 4096);
    // Corrupt a byte of c.bin inside the last piece, and truncate b.bin.
    contents[2].1[8500] ^= 0xff;
    contents[1].1.truncate(100);
    write_tree(tmp.path(), "tree", &contents);

    let bitfield = Store::materialize(&metainfo, tmp.path(), false, 4).unwrap().check_existing();
    // Piece 1 covers b.bin, piece 4 holds the corrupted byte.
    let expected: Vec<bool> = vec![true, false, true, true, false];
    assert_eq!(bitfield.iter().by_vals().collect::<Vec<_>>(), expected);
}

#[test]
fn test_fresh_and_truncated_trees_skip_verification() {
    let tmp = tempfile::tempdir().unwrap();
    let contents = sample();
    let metainfo = multi_file("tree", &contents, 4096);

    // Root did not exist, nothing is checked and short files read as zeroes.
    let store = Store::materialize(&metainfo, tmp.path(), false, 4).unwrap();
    assert_eq!(store.check_existing(), Bitfield::repeat(false, 5));
    assert_eq!(store.read_piece(4).unwrap(), vec![0; store.piece_size(4)]);
    drop(store);

    write_tree(tmp.path(), "tree", &contents);
    let store = Store::materialize(&metainfo, tmp.path(), true, 4).unwrap();
    assert_eq!(store.check_existing(), Bitfield::repeat(false, 5));
    assert_eq!(std::fs::metadata(tmp.path().join("tree/a.bin")).unwrap().len(), 0);
}

#[test]
fn test_open_existing_creates_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let contents = sample();
    let metainfo = multi_file("tree", &contents, 4096);

    let err = Store::open_existing(&metainfo, tmp.path(), 4).unwrap_err();
    assert!(matches!(err, super::DiskError::OpenError { .. }));
    assert!(!tmp.path().join("tree").exists());

    write_tree(tmp.path(), "tree", &contents);
    let store = Store::open_existing(&metainfo, tmp.path(), 4).unwrap();
    assert_eq!(store.check_existing(), Bitfield::repeat(true, 5));
    assert_eq!(store.read_piece(0).unwrap(), &contents[0].1[..4096]);
}

#[test]
fn test_write_evicts_cached_piece() {
    let tmp = tempfile::tempdir().unwrap();
    let contents = sample();
    let metainfo = multi_file("tree", &contents, 4096);
    let store = Store::materialize(&metainfo, tmp.path(), false, 4).unwrap();

    assert_eq!(*store.read_cached(0).unwrap(), vec![0; 4096]);
    store.write_piece(0, &contents[0].1[..4096]).unwrap();
    assert_eq!(&store.read_cached(0).unwrap()[..], &contents[0].1[..4096]);
}

#[tokio::test]
async fn test_async_wrappers() {
    let tmp = tempfile::tempdir().unwrap();
    let contents = sample();
    let metainfo = multi_file("tree", &contents, 4096);
    let store = std::sync::Arc::new(Store::materialize(&metainfo, tmp.path(), false, 4).unwrap());

    super::write_piece(store.clone(), 3, vec![9; 4096]).await.unwrap();
    assert_eq!(*super::read_cached(store.clone(), 3).await.unwrap(), vec![9; 4096]);
    assert!(super::write_piece(store.clone(), 9, vec![0; 10]).await.is_err());
}

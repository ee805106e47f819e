use std::{net::SocketAddr, sync::Arc, time::Duration};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::codec::Framed;
use crate::{
    block::{BlockData, BlockInfo},
    config::{generate_client_id, Config},
    disk::Store,
    metainfo::{Info, MetaInfo},
    picker::PieceTable,
    torrent::{TorrentCommand, TorrentContext, TorrentData, TorrentRx},
    verify,
    Bitfield,
    BLOCK_SIZE,
    ID,
};
use super::{handshake::HANDSHAKE_LEN, *};

const PIECE_LEN: usize = 16_384;
const REMOTE_ID: ID = *b"-XX0000-remotepeer01";
const REMOTE_METADATA_ID: u8 = 3;

type Remote = Framed<TcpStream, MessageCodec>;

struct Fixture {
    _dir: tempfile::TempDir,
    content: Vec<u8>,
    data: Arc<TorrentData>,
}

// Two pieces, the second one short.
fn fixture() -> Fixture {
    fixture_with(20_000, PIECE_LEN)
}

fn fixture_with(len: u32, piece_len: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    let pieces = content.chunks(piece_len).flat_map(verify::hash_piece).collect();
    let info = Info {
        files: None,
        length: Some(content.len() as u64),
        name: "data.bin".to_string(),
        piece_length: piece_len as u64,
        pieces,
    };
    let metainfo = MetaInfo::from_info_bytes(serde_bencode::to_bytes(&info).unwrap()).unwrap();
    let store = Arc::new(Store::materialize(&metainfo, dir.path(), false, 4).unwrap());
    Fixture { _dir: dir, content, data: Arc::new(TorrentData { metainfo, store }) }
}

struct Harness {
    ctx: Arc<TorrentContext>,
    torrent_rx: TorrentRx,
    // Dropping the sender would end sessions still waiting for metadata.
    _metadata_tx: watch::Sender<Option<Arc<TorrentData>>>,
}

fn test_config() -> Config {
    Config {
        client_id: generate_client_id(),
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        block_timeout: Duration::from_secs(5),
        retry_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

fn harness(info_hash: ID, data: Option<Arc<TorrentData>>, own: Bitfield) -> Harness {
    harness_with(info_hash, data, own, test_config())
}

fn harness_with(info_hash: ID, data: Option<Arc<TorrentData>>, own: Bitfield, config: Config) -> Harness {
    let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
    let (metadata_tx, metadata_rx) = watch::channel(data);
    let ctx = Arc::new(TorrentContext {
        info_hash,
        client_id: config.client_id,
        config,
        torrent_tx,
        pieces: Mutex::new(PieceTable::new(own)),
        metadata_rx,
    });
    Harness { ctx, torrent_rx, _metadata_tx: metadata_tx }
}

// Starts an outbound session towards a listener we play the remote on.
async fn connect(ctx: Arc<TorrentContext>) -> (TcpListener, PeerTx, JoinHandle<Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address: SocketAddr = listener.local_addr().unwrap();
    let (mut session, peer_tx) = PeerSession::new(address, ctx);
    let handle = tokio::spawn(async move { session.start_session(None).await });
    (listener, peer_tx, handle)
}

async fn accept(listener: &TcpListener, handshake: Handshake) -> Remote {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = [0; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await.unwrap();
    stream.write_all(&handshake.to_bytes()).await.unwrap();
    Framed::new(stream, MessageCodec)
}

async fn recv(remote: &mut Remote) -> Message {
    remote.next().await.unwrap().unwrap()
}

// Skips everything up to the next block request.
async fn recv_request(remote: &mut Remote) -> BlockInfo {
    loop {
        if let Message::Request(request) = recv(remote).await {
            return request;
        }
    }
}

async fn send_ext_handshake(remote: &mut Remote, metadata_size: usize) {
    remote.send(Message::Extended(ExtendedMessage::Handshake(ExtHandshake {
        metadata_id: REMOTE_METADATA_ID,
        metadata_size,
    }))).await.unwrap();
}

fn metadata(msg: MetadataMessage) -> Message {
    Message::Extended(ExtendedMessage::Metadata { id: LOCAL_METADATA_ID, msg })
}

#[tokio::test]
async fn test_missing_extension_bit_aborts() {
    let h = harness([1; 20], None, Bitfield::new());
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;

    let mut handshake = Handshake::new([1; 20], REMOTE_ID);
    handshake.reserved = [0; 8];
    let _remote = accept(&listener, handshake).await;

    let res = handle.await.unwrap();
    assert!(matches!(res, Err(PeerError::Protocol(ProtocolViolation::NoExtensionSupport))));
}

#[tokio::test]
async fn test_self_connection_rejected() {
    let h = harness([1; 20], None, Bitfield::new());
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let _remote = accept(&listener, Handshake::new([1; 20], h.ctx.client_id)).await;

    assert!(matches!(handle.await.unwrap(), Err(PeerError::SelfConnection)));
}

#[tokio::test]
async fn test_out_of_order_metadata_aborts() {
    let mut h = harness([9; 20], None, Bitfield::new());
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new([9; 20], REMOTE_ID)).await;

    // Three chunks worth of metadata.
    send_ext_handshake(&mut remote, 40_000).await;
    match recv(&mut remote).await {
        Message::Extended(ExtendedMessage::Handshake(hs)) => {
            assert_eq!(hs.metadata_id, LOCAL_METADATA_ID);
            // Nothing to offer yet.
            assert_eq!(hs.metadata_size, 0);
        },
        msg => panic!("expected extension handshake, got {}", msg),
    }

    let request = |piece| Message::Extended(ExtendedMessage::Metadata {
        id: REMOTE_METADATA_ID,
        msg: MetadataMessage::Request { piece },
    });
    assert_eq!(recv(&mut remote).await, request(0));
    remote.send(metadata(MetadataMessage::Data {
        piece: 0,
        total_size: 40_000,
        data: vec![0; crate::METADATA_PIECE_SIZE],
    })).await.unwrap();

    assert_eq!(recv(&mut remote).await, request(1));
    remote.send(metadata(MetadataMessage::Data {
        piece: 2,
        total_size: 40_000,
        data: vec![0; 40_000 - 2 * crate::METADATA_PIECE_SIZE],
    })).await.unwrap();

    let res = handle.await.unwrap();
    assert!(matches!(
        res,
        Err(PeerError::Protocol(ProtocolViolation::UnexpectedMetadataPiece { expected: 1, got: 2 }))
    ));
    assert!(matches!(h.torrent_rx.recv().await, Some(TorrentCommand::PeerDisconnected { .. })));
}

#[tokio::test]
async fn test_metadata_fetch() {
    let f = fixture();
    let info_raw = f.data.metainfo.info_raw.to_vec();
    let mut h = harness(f.data.metainfo.info_hash(), None, Bitfield::new());
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new(h.ctx.info_hash, REMOTE_ID)).await;

    send_ext_handshake(&mut remote, info_raw.len()).await;
    loop {
        if let Message::Extended(ExtendedMessage::Metadata { msg, .. }) = recv(&mut remote).await {
            assert_eq!(msg, MetadataMessage::Request { piece: 0 });
            break;
        }
    }
    remote.send(metadata(MetadataMessage::Data {
        piece: 0,
        total_size: info_raw.len(),
        data: info_raw.clone(),
    })).await.unwrap();

    match h.torrent_rx.recv().await {
        Some(TorrentCommand::MetadataReceived { info_raw: received, .. }) => assert_eq!(received, info_raw),
        cmd => panic!("expected metadata, got {:?}", cmd),
    }

    drop(remote);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_serves_metadata_in_order() {
    let f = fixture();
    let info_hash = f.data.metainfo.info_hash();
    let h = harness(info_hash, Some(f.data.clone()), Bitfield::repeat(false, 2));
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new(info_hash, REMOTE_ID)).await;

    match recv(&mut remote).await {
        Message::Extended(ExtendedMessage::Handshake(hs)) => {
            assert_eq!(hs.metadata_size, f.data.metainfo.info_raw.len());
        },
        msg => panic!("expected extension handshake, got {}", msg),
    }
    send_ext_handshake(&mut remote, 0).await;
    remote.send(metadata(MetadataMessage::Request { piece: 0 })).await.unwrap();

    loop {
        if let Message::Extended(ExtendedMessage::Metadata { id, msg }) = recv(&mut remote).await {
            assert_eq!(id, REMOTE_METADATA_ID);
            assert_eq!(msg, MetadataMessage::Data {
                piece: 0,
                total_size: f.data.metainfo.info_raw.len(),
                data: f.data.metainfo.info_raw.to_vec(),
            });
            break;
        }
    }

    // Asking for the same chunk again is out of order.
    remote.send(metadata(MetadataMessage::Request { piece: 0 })).await.unwrap();
    assert!(matches!(
        handle.await.unwrap(),
        Err(PeerError::Protocol(ProtocolViolation::UnexpectedMetadataPiece { expected: 1, got: 0 }))
    ));
}

#[tokio::test]
async fn test_unreserved_block_ignored() {
    let f = fixture();
    let info_hash = f.data.metainfo.info_hash();
    let mut h = harness(info_hash, Some(f.data.clone()), Bitfield::repeat(false, 2));
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new(info_hash, REMOTE_ID)).await;

    send_ext_handshake(&mut remote, 0).await;
    remote.send(Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000]))).await.unwrap();
    remote.send(Message::Unchoke).await.unwrap();

    let request = recv_request(&mut remote).await;
    assert_eq!(request, BlockInfo { piece_idx: 0, offset: 0, len: PIECE_LEN });
    assert!(h.ctx.pieces.lock().await.is_reserved(0));

    // Piece 1 belongs to nobody, the block changes nothing.
    remote.send(Message::Block(BlockData {
        piece_idx: 1,
        offset: 0,
        data: f.content[PIECE_LEN..].to_vec(),
    })).await.unwrap();
    remote.send(Message::Block(BlockData {
        piece_idx: 0,
        offset: 0,
        data: f.content[..PIECE_LEN].to_vec(),
    })).await.unwrap();

    match h.torrent_rx.recv().await {
        Some(TorrentCommand::PieceVerified { idx, .. }) => assert_eq!(idx, 0),
        cmd => panic!("expected verified piece, got {:?}", cmd),
    }
    assert_eq!(f.data.store.read_piece(0).unwrap(), f.content[..PIECE_LEN]);

    // The session carries on with the next piece.
    let request = recv_request(&mut remote).await;
    assert_eq!(request, BlockInfo { piece_idx: 1, offset: 0, len: 20_000 - PIECE_LEN });
    {
        let pieces = h.ctx.pieces.lock().await;
        assert!(pieces.own()[0]);
        assert!(!pieces.own()[1]);
    }

    // Closing returns the reservation.
    drop(remote);
    assert!(handle.await.unwrap().is_ok());
    assert!(!h.ctx.pieces.lock().await.is_reserved(1));
}

#[tokio::test]
async fn test_bad_piece_releases_reservation() {
    let f = fixture();
    let info_hash = f.data.metainfo.info_hash();
    let h = harness(info_hash, Some(f.data.clone()), Bitfield::repeat(false, 2));
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new(info_hash, REMOTE_ID)).await;

    send_ext_handshake(&mut remote, 0).await;
    remote.send(Message::Bitfield(Bitfield::from_vec(vec![0b1000_0000]))).await.unwrap();
    remote.send(Message::Unchoke).await.unwrap();

    let request = recv_request(&mut remote).await;
    remote.send(Message::Block(BlockData {
        piece_idx: request.piece_idx,
        offset: 0,
        data: vec![0xff; PIECE_LEN],
    })).await.unwrap();

    assert!(matches!(handle.await.unwrap(), Err(PeerError::PieceHash(0))));
    let pieces = h.ctx.pieces.lock().await;
    assert!(!pieces.is_reserved(0));
    assert!(!pieces.own()[0]);
}

#[tokio::test]
async fn test_choke_releases_reservation() {
    let f = fixture();
    let info_hash = f.data.metainfo.info_hash();
    let h = harness(info_hash, Some(f.data.clone()), Bitfield::repeat(false, 2));
    let (listener, _peer_tx, _handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new(info_hash, REMOTE_ID)).await;

    send_ext_handshake(&mut remote, 0).await;
    remote.send(Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000]))).await.unwrap();
    remote.send(Message::Unchoke).await.unwrap();
    recv_request(&mut remote).await;
    assert!(h.ctx.pieces.lock().await.is_reserved(0));

    remote.send(Message::Choke).await.unwrap();
    // Round trip so the choke has been handled.
    remote.send(Message::Extended(ExtendedMessage::Metadata {
        id: LOCAL_METADATA_ID,
        msg: MetadataMessage::Request { piece: 0 },
    })).await.unwrap();
    loop {
        if let Message::Extended(ExtendedMessage::Metadata { .. }) = recv(&mut remote).await {
            break;
        }
    }
    assert!(!h.ctx.pieces.lock().await.is_reserved(0));
}

#[tokio::test]
async fn test_serves_blocks() {
    let f = fixture();
    f.data.store.write_piece(0, &f.content[..PIECE_LEN]).unwrap();
    f.data.store.write_piece(1, &f.content[PIECE_LEN..]).unwrap();
    let info_hash = f.data.metainfo.info_hash();
    let h = harness(info_hash, Some(f.data.clone()), Bitfield::repeat(true, 2));
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new(info_hash, REMOTE_ID)).await;

    send_ext_handshake(&mut remote, 0).await;
    // Bitfield and unchoke come unprompted.
    let mut saw_bitfield = false;
    loop {
        match recv(&mut remote).await {
            Message::Bitfield(bitfield) => {
                assert_eq!(bitfield.as_raw_slice(), &[0b1100_0000]);
                saw_bitfield = true;
            },
            Message::Unchoke => break,
            _ => {},
        }
    }
    assert!(saw_bitfield);

    let request = BlockInfo { piece_idx: 1, offset: 1000, len: 2000 };
    remote.send(Message::Request(request)).await.unwrap();
    assert_eq!(recv(&mut remote).await, Message::Block(BlockData {
        piece_idx: 1,
        offset: 1000,
        data: f.content[PIECE_LEN + 1000..PIECE_LEN + 3000].to_vec(),
    }));

    // Past the end of the short last piece.
    remote.send(Message::Request(BlockInfo { piece_idx: 1, offset: 3000, len: 1000 })).await.unwrap();
    assert!(matches!(
        handle.await.unwrap(),
        Err(PeerError::Protocol(ProtocolViolation::InvalidRequest))
    ));
}

#[tokio::test]
async fn test_have_without_bitfield() {
    let f = fixture();
    let info_hash = f.data.metainfo.info_hash();
    let mut h = harness(info_hash, Some(f.data.clone()), Bitfield::repeat(false, 2));
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new(info_hash, REMOTE_ID)).await;

    // A peer with nothing yet may skip its bitfield entirely.
    send_ext_handshake(&mut remote, 0).await;
    remote.send(Message::Have { idx: 1 }).await.unwrap();
    remote.send(Message::Unchoke).await.unwrap();

    let request = recv_request(&mut remote).await;
    assert_eq!(request, BlockInfo { piece_idx: 1, offset: 0, len: 20_000 - PIECE_LEN });
    assert!(h.ctx.pieces.lock().await.is_reserved(1));

    drop(remote);
    assert!(handle.await.unwrap().is_ok());
    assert!(!h.ctx.pieces.lock().await.is_reserved(1));
    assert!(matches!(h.torrent_rx.recv().await, Some(TorrentCommand::PeerDisconnected { .. })));
}

#[tokio::test]
async fn test_early_have_bounded_by_metadata_size() {
    let mut h = harness([4; 20], None, Bitfield::new());
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new([4; 20], REMOTE_ID)).await;

    // 2000 bytes of descriptor can't describe more than 100 pieces.
    send_ext_handshake(&mut remote, 2000).await;
    remote.send(Message::Have { idx: 99 }).await.unwrap();
    remote.send(Message::Have { idx: 100 }).await.unwrap();

    assert!(matches!(
        handle.await.unwrap(),
        Err(PeerError::Protocol(ProtocolViolation::InvalidPieceIndex(100)))
    ));
    assert!(matches!(h.torrent_rx.recv().await, Some(TorrentCommand::PeerDisconnected { .. })));
}

#[tokio::test]
async fn test_request_pipeline() {
    // One piece of seven blocks, the last one short.
    let len = 6 * BLOCK_SIZE as u32 + 5000;
    let f = fixture_with(len, 8 * BLOCK_SIZE);
    let info_hash = f.data.metainfo.info_hash();
    let mut h = harness(info_hash, Some(f.data.clone()), Bitfield::repeat(false, 1));
    let pipeline_len = h.ctx.config.pipeline_len;
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new(info_hash, REMOTE_ID)).await;

    send_ext_handshake(&mut remote, 0).await;
    remote.send(Message::Bitfield(Bitfield::from_vec(vec![0b1000_0000]))).await.unwrap();
    remote.send(Message::Unchoke).await.unwrap();

    let mut offsets = Vec::new();
    for _ in 0..pipeline_len {
        offsets.push(recv_request(&mut remote).await.offset);
    }
    assert_eq!(offsets, (0..pipeline_len).map(|i| i * BLOCK_SIZE).collect::<Vec<_>>());
    // The window is full until a block comes back.
    assert!(tokio::time::timeout(Duration::from_millis(300), remote.next()).await.is_err());

    let block = |idx: usize| {
        let offset = idx * BLOCK_SIZE;
        let end = (offset + BLOCK_SIZE).min(f.content.len());
        Message::Block(BlockData { piece_idx: 0, offset, data: f.content[offset..end].to_vec() })
    };

    // Each answered block frees one slot.
    remote.send(block(0)).await.unwrap();
    assert_eq!(recv_request(&mut remote).await, BlockInfo { piece_idx: 0, offset: 5 * BLOCK_SIZE, len: BLOCK_SIZE });
    remote.send(block(1)).await.unwrap();
    assert_eq!(recv_request(&mut remote).await, BlockInfo { piece_idx: 0, offset: 6 * BLOCK_SIZE, len: 5000 });

    // Blocks can arrive in any order.
    for idx in [4, 2, 6, 3, 5] {
        remote.send(block(idx)).await.unwrap();
    }
    match h.torrent_rx.recv().await {
        Some(TorrentCommand::PieceVerified { idx, .. }) => assert_eq!(idx, 0),
        cmd => panic!("expected verified piece, got {:?}", cmd),
    }
    assert_eq!(f.data.store.read_piece(0).unwrap(), f.content);
    assert!(h.ctx.pieces.lock().await.own()[0]);

    drop(remote);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_block_timeout_releases_reservation() {
    let f = fixture();
    let info_hash = f.data.metainfo.info_hash();
    let config = Config { block_timeout: Duration::from_millis(300), ..test_config() };
    let mut h = harness_with(info_hash, Some(f.data.clone()), Bitfield::repeat(false, 2), config);
    let (listener, _peer_tx, handle) = connect(h.ctx.clone()).await;
    let mut remote = accept(&listener, Handshake::new(info_hash, REMOTE_ID)).await;

    send_ext_handshake(&mut remote, 0).await;
    remote.send(Message::Bitfield(Bitfield::from_vec(vec![0b1100_0000]))).await.unwrap();
    remote.send(Message::Unchoke).await.unwrap();
    let request = recv_request(&mut remote).await;
    assert!(h.ctx.pieces.lock().await.is_reserved(request.piece_idx));

    // The remote stays connected but never answers.
    let res = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(matches!(res, Err(PeerError::Timeout("block"))));
    assert!(!h.ctx.pieces.lock().await.is_reserved(request.piece_idx));
    assert!(matches!(h.torrent_rx.recv().await, Some(TorrentCommand::PeerDisconnected { .. })));
    drop(remote);
}

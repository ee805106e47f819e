use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    time::{self, Instant, MissedTickBehavior, Sleep},
};
use tokio_util::codec::{Framed, FramedParts};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use crate::{
    block::{self, BlockData, BlockInfo},
    disk,
    torrent::{TorrentCommand, TorrentContext, TorrentData},
    verify,
    Bitfield,
    BLOCK_SIZE,
    METADATA_PIECE_SIZE,
};
use super::{*, message::*, handshake::*, extension::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Largest block request we serve.
const MAX_REQUEST_LEN: usize = 0x20000;

// Most pieces a remote may claim before it advertises the descriptor size.
const MAX_EARLY_PIECES: usize = 0x40000;

// Bytes per piece hash in the descriptor.
const HASH_LEN: usize = 20;

// The piece this session holds the reservation for.
#[derive(Debug)]
struct PieceDownload {

    idx: usize,

    len: usize,

    // Blocks are copied in at their offset.
    data: Vec<u8>,

    received: Bitfield,

    num_received: usize,

    // Next block to request, blocks are requested in order.
    next_block: usize,

    // Requests sent but not answered.
    outstanding: usize,

}

impl PieceDownload {

    fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            data: vec![0; len],
            received: Bitfield::repeat(false, block::num_blocks(len)),
            num_received: 0,
            next_block: 0,
            outstanding: 0,
        }
    }

    fn num_blocks(&self) -> usize { self.received.len() }

    fn is_complete(&self) -> bool { self.num_received == self.num_blocks() }

    // Copies in a block we asked for and haven't seen, returns whether it was taken.
    fn add_block(&mut self, block: &BlockData) -> bool {
        if block.piece_idx != self.idx || block.offset % BLOCK_SIZE != 0 {
            return false;
        }
        let block_idx = block.offset / BLOCK_SIZE;
        if block_idx >= self.next_block
        || self.received[block_idx]
        || block.data.len() != block::block_len(self.len, block_idx)
        {
            return false;
        }

        self.data[block.offset..block.offset + block.data.len()].copy_from_slice(&block.data);
        self.received.set(block_idx, true);
        self.num_received += 1;
        self.outstanding -= 1;
        true
    }
}

// The raw info dict being fetched from the remote, chunk by chunk.
#[derive(Debug)]
struct MetadataDownload {

    size: usize,

    data: Vec<u8>,

    next_piece: u32,

}

impl MetadataDownload {

    fn num_pieces(&self) -> u32 {
        ((self.size + METADATA_PIECE_SIZE - 1) / METADATA_PIECE_SIZE) as u32
    }

    fn piece_len(&self, piece: u32) -> usize {
        METADATA_PIECE_SIZE.min(self.size - piece as usize * METADATA_PIECE_SIZE)
    }
}

// Aborts the session when the peer goes quiet.
struct FailTimer {

    sleep: Pin<Box<Sleep>>,

    duration: Duration,

    armed: bool,

}

impl FailTimer {

    fn new(duration: Duration) -> Self {
        Self {
            sleep: Box::pin(time::sleep(duration)),
            duration,
            armed: false,
        }
    }

    fn refresh(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.duration);
        self.armed = true;
    }

    fn cancel(&mut self) {
        self.armed = false;
    }
}

pub struct PeerSession {

    // The peer's IP address.
    address: SocketAddr,

    // Context is the state shared by all peers of a torrent.
    ctx: Arc<TorrentContext>,

    // Commands to the peer.
    peer_rx: PeerRx,

    // Notified when the torrent's metadata becomes known.
    metadata_rx: watch::Receiver<Option<Arc<TorrentData>>>,

    // Metadata and storage, once known.
    data: Option<Arc<TorrentData>>,

    // Bitfield of pieces the peer currently has.
    bitfield: Bitfield,

    state: SessionState,

    // The id the peer wants ut_metadata messages tagged with.
    remote_metadata_id: Option<u8>,

    download: Option<PieceDownload>,

    metadata: Option<MetadataDownload>,

    // Metadata pieces are served strictly in order, this is the next one.
    metadata_served: u32,

    timer: FailTimer,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let metadata_rx = ctx.metadata_rx.clone();
        let timer = FailTimer::new(ctx.config.block_timeout);

        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                metadata_rx,
                data: None,
                bitfield: Bitfield::new(),
                state: SessionState::default(),
                remote_metadata_id: None,
                download: None,
                metadata: None,
                metadata_served: 0,
                timer,
            },
            peer_tx,
        )
    }

    // Runs the session to completion, always releasing its piece and
    // notifying the torrent on the way out.
    #[tracing::instrument(name = "peer", skip(self, inbound_stream), fields(address = %self.address))]
    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {
        let res = self.connect_and_run(inbound_stream).await;
        self.disconnect().await;
        res
    }

    async fn connect_and_run(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        let inbound = inbound_stream.is_some();
        let stream = if let Some(stream) = inbound_stream {
            stream
        } else {
            self.state.update(|state| state.conn_state = ConnState::Connecting);
            let timeout = self.ctx.config.connect_timeout;
            let stream = time::timeout(timeout, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::Timeout("connect"))??;
            tracing::trace!("outbound connection successful");
            stream
        };

        let socket = Framed::new(stream, HandshakeCodec { info_hash: self.ctx.info_hash });
        let timeout = self.ctx.config.handshake_timeout;
        let socket = time::timeout(timeout, self.exchange_handshake(socket, inbound))
            .await
            .map_err(|_| PeerError::Timeout("handshake"))??;

        self.run(socket).await
    }

    async fn disconnect(&mut self) {
        self.state.update(|state| state.conn_state = ConnState::Closed);
        self.timer.cancel();
        self.release_piece().await;
        self.ctx.torrent_tx.send(TorrentCommand::PeerDisconnected {
            address: self.address,
        }).ok();
    }

    async fn exchange_handshake(
        &mut self,
        mut socket: Framed<TcpStream, HandshakeCodec>,
        inbound: bool,
    ) -> Result<Framed<TcpStream, MessageCodec>> {

        self.state.update(|state| state.conn_state = ConnState::Handshaking);
        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.client_id);

        if !inbound {
            tracing::debug!("send handshake");
            socket.send(handshake.clone()).await?;
        }

        // Codec validates protocol, extension bit and info hash.
        let remote = match socket.next().await {
            Some(res) => res?,
            None => return Err(PeerError::NoHandshake),
        };
        tracing::debug!("read: {:?}", remote);
        if remote.peer_id == self.ctx.client_id {
            return Err(PeerError::SelfConnection);
        }

        // Respond with handshake if connection is inbound.
        if inbound {
            tracing::debug!("send handshake");
            socket.send(handshake).await?;
        }
        tracing::info!("handshake successful, peer connected");

        // Switch codecs, keeping anything already read past the handshake.
        let parts = socket.into_parts();
        let mut new_parts = FramedParts::new::<Message>(parts.io, MessageCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        Ok(Framed::from_parts(new_parts))
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.update(|state| state.conn_state = ConnState::ExtensionHandshake);
        let (mut sink, mut stream) = socket.split();

        self.data = self.metadata_rx.borrow_and_update().clone();
        if let Some(data) = &self.data {
            // A remote with nothing to offer may skip its bitfield.
            self.bitfield.resize(data.metainfo.num_pieces(), false);
        }
        let metadata_size = self.data.as_ref().map_or(0, |data| data.metainfo.info_raw.len());
        self.send_message(&mut sink, Message::Extended(ExtendedMessage::Handshake(ExtHandshake {
            metadata_id: LOCAL_METADATA_ID,
            metadata_size,
        }))).await?;

        if self.data.is_some() {
            self.introduce(&mut sink).await?;
        }
        self.timer.refresh();

        let mut retry = time::interval(self.ctx.config.retry_interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop { tokio::select! {

            // Message from peer.
            msg = stream.next() => match msg {
                Some(msg) => self.handle_msg(&mut sink, msg?).await?,
                None => {
                    tracing::info!("connection closed by peer");
                    break;
                },
            },

            // Command from the torrent.
            Some(cmd) = self.peer_rx.recv() => match cmd {
                PeerCommand::PieceWritten(idx) => self.handle_written_piece(&mut sink, idx).await?,
                PeerCommand::Shutdown => {
                    tracing::info!("session shutdown");
                    break;
                },
            },

            // Metadata arrived, possibly through another session.
            res = self.metadata_rx.changed(), if self.data.is_none() => {
                if res.is_err() {
                    break;
                }
                let data = self.metadata_rx.borrow_and_update().clone();
                if let Some(data) = data {
                    self.on_metadata(&mut sink, data).await?;
                }
            },

            // Nothing was reservable last time, try again.
            _ = retry.tick(), if self.wants_piece() => self.request_pieces(&mut sink).await?,

            _ = &mut self.timer.sleep, if self.timer.armed => {
                return Err(PeerError::Timeout("block"));
            },

        }}

        Ok(())
    }

    // Logs a message and sends to peer.
    #[inline(always)]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::debug!("send: {}", msg);
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::debug!("read: {}", msg);

        match msg {

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = true);
                    // Requests won't be answered, let someone else have the piece.
                    self.release_piece().await;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.update(|state| state.peer_choking = false);
                    self.request_pieces(sink).await?;
                }
            },

            Message::Interested => self.state.update(|state| state.peer_interested = true),

            Message::NotInterested => self.state.update(|state| state.peer_interested = false),

            Message::Have { idx } => self.handle_have(sink, idx as usize).await?,

            Message::Bitfield(bitfield) => self.handle_bitfield(sink, bitfield).await?,

            Message::Request(request) => self.handle_request(sink, request).await?,

            Message::Block(block) => self.handle_block(sink, block).await?,

            // Requests are answered as they arrive, nothing is queued to cancel.
            Message::Cancel(_) => {},

            // No DHT node to pass the port on to.
            Message::Port { .. } => {},

            Message::Extended(ExtendedMessage::Handshake(hs)) => self.handle_ext_handshake(sink, hs).await?,

            Message::Extended(ExtendedMessage::Metadata { id, msg }) => {
                if id != LOCAL_METADATA_ID {
                    return Err(ProtocolViolation::InvalidMetadataId(id as i64).into());
                }
                self.handle_metadata(sink, msg).await?;
            },
        }

        Ok(())
    }

    // Once the torrent's layout is known: advertise our pieces, unchoke and declare interest.
    async fn introduce(&mut self, sink: &mut MessageSink) -> Result<()> {
        let own = self.ctx.pieces.lock().await.own().clone();
        self.send_message(sink, Message::Bitfield(own)).await?;
        self.send_message(sink, Message::Unchoke).await?;
        self.state.update(|state| state.choked = false);
        self.update_interest(sink).await
    }

    async fn on_metadata(&mut self, sink: &mut MessageSink, data: Arc<TorrentData>) -> Result<()> {
        // Another session may have finished the fetch first.
        self.metadata = None;

        // Pieces the peer advertised before we knew how many there are.
        let num_pieces = data.metainfo.num_pieces();
        if self.bitfield.len() > num_pieces && self.bitfield[num_pieces..].any() {
            return Err(ProtocolViolation::InvalidBitfield.into());
        }
        self.bitfield.resize(num_pieces, false);

        self.data = Some(data);
        self.introduce(sink).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {
        match &self.data {
            Some(data) => {
                if idx >= data.metainfo.num_pieces() {
                    tracing::error!("have msg with invalid idx: {}", idx);
                    return Err(ProtocolViolation::InvalidPieceIndex(idx).into());
                }
            },
            None => {
                if idx >= self.early_piece_limit() {
                    tracing::error!("have msg with invalid idx: {}", idx);
                    return Err(ProtocolViolation::InvalidPieceIndex(idx).into());
                }
                if idx >= self.bitfield.len() {
                    self.bitfield.resize(idx + 1, false);
                }
            },
        }

        match self.bitfield.get_mut(idx) {
            Some(mut bit) if !*bit => *bit = true,
            // Peer already has piece.
            _ => return Ok(()),
        }
        self.update_interest(sink).await
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, mut bitfield: Bitfield) -> Result<()> {
        let num_pieces = match &self.data {
            Some(data) => {
                let num_pieces = data.metainfo.num_pieces();
                // Exactly enough bytes, spare bits clear.
                if bitfield.len() != (num_pieces + 7) / 8 * 8 {
                    return Err(ProtocolViolation::InvalidBitfield.into());
                }
                num_pieces
            },
            None => self.early_piece_limit().min(bitfield.len()),
        };
        if bitfield[num_pieces..].any() {
            return Err(ProtocolViolation::InvalidBitfield.into());
        }
        bitfield.truncate(num_pieces);
        tracing::info!("peer has {} pieces", bitfield.count_ones());
        self.bitfield = bitfield;
        self.update_interest(sink).await
    }

    // Before the descriptor is known, the most pieces the remote may claim.
    // The descriptor holds one hash per piece, so its advertised size caps the count.
    fn early_piece_limit(&self) -> usize {
        self.metadata
            .as_ref()
            .map_or(MAX_EARLY_PIECES, |download| download.size / HASH_LEN)
    }

    async fn handle_request(&mut self, sink: &mut MessageSink, request: BlockInfo) -> Result<()> {

        self.timer.refresh();
        let Some(data) = self.data.clone() else {
            return Err(ProtocolViolation::UnexpectedMessage("request before metadata").into());
        };

        if request.piece_idx >= data.metainfo.num_pieces() {
            return Err(ProtocolViolation::InvalidPieceIndex(request.piece_idx).into());
        }
        if request.len > MAX_REQUEST_LEN
        || !request.fits(data.metainfo.piece_size(request.piece_idx))
        || !self.ctx.pieces.lock().await.own()[request.piece_idx]
        {
            tracing::error!("invalid request: {:?}", request);
            return Err(ProtocolViolation::InvalidRequest.into());
        }

        let piece = disk::read_cached(data.store.clone(), request.piece_idx).await?;
        let block = BlockData {
            piece_idx: request.piece_idx,
            offset: request.offset,
            data: piece[request.offset..request.offset + request.len].to_vec(),
        };
        self.send_message(sink, Message::Block(block)).await
    }

    async fn handle_block(&mut self, sink: &mut MessageSink, block: BlockData) -> Result<()> {

        let accepted = self.download
            .as_mut()
            .map_or(false, |download| download.add_block(&block));
        if !accepted {
            // Not for our piece, or not asked for.
            tracing::warn!("unexpected block: piece {} offset {}", block.piece_idx, block.offset);
            return Ok(());
        }
        self.timer.refresh();

        if self.download.as_ref().map_or(false, PieceDownload::is_complete) {
            if let Some(download) = self.download.take() {
                self.finish_piece(download).await?;
            }
        }

        self.request_pieces(sink).await
    }

    // Verifies and writes a completed piece, then commits it.
    async fn finish_piece(&mut self, download: PieceDownload) -> Result<()> {

        let Some(data) = self.data.clone() else {
            return Err(ProtocolViolation::UnexpectedMessage("block before metadata").into());
        };
        let idx = download.idx;

        let valid = data.store
            .piece_hash(idx)
            .map_or(false, |hash| verify::verify_piece(&download.data, hash));
        if !valid {
            self.ctx.pieces.lock().await.release(idx);
            return Err(PeerError::PieceHash(idx));
        }

        if let Err(e) = disk::write_piece(data.store.clone(), idx, download.data).await {
            self.ctx.pieces.lock().await.release(idx);
            return Err(e.into());
        }

        self.ctx.pieces.lock().await.commit(idx);
        tracing::debug!("piece {} verified and written", idx);
        self.ctx.torrent_tx.send(TorrentCommand::PieceVerified {
            address: self.address,
            idx,
        })?;
        Ok(())
    }

    // Tell the peer about pieces we finish.
    async fn handle_written_piece(&mut self, sink: &mut MessageSink, idx: usize) -> Result<()> {
        if self.bitfield.get(idx).map_or(false, |b| !*b) {
            self.send_message(sink, Message::Have { idx: idx as u32 }).await?;
        }
        self.update_interest(sink).await
    }

    async fn handle_ext_handshake(&mut self, sink: &mut MessageSink, hs: ExtHandshake) -> Result<()> {

        self.remote_metadata_id = Some(hs.metadata_id);
        if self.state.conn_state == ConnState::ExtensionHandshake {
            self.state.update(|state| state.conn_state = ConnState::Steady);
        }

        if self.data.is_none() && self.metadata.is_none() {
            if hs.metadata_size == 0 {
                return Err(ProtocolViolation::MetadataUnavailable.into());
            }
            tracing::info!("fetching {} bytes of metadata", hs.metadata_size);
            self.metadata = Some(MetadataDownload {
                size: hs.metadata_size,
                data: Vec::with_capacity(hs.metadata_size),
                next_piece: 0,
            });
            self.send_metadata(sink, MetadataMessage::Request { piece: 0 }).await?;
            self.timer.refresh();
        }

        Ok(())
    }

    async fn handle_metadata(&mut self, sink: &mut MessageSink, msg: MetadataMessage) -> Result<()> {
        match msg {

            MetadataMessage::Request { piece } => {
                let Some(data) = self.data.clone() else {
                    return Err(ProtocolViolation::MetadataUnavailable.into());
                };
                let raw = &data.metainfo.info_raw;
                if piece != self.metadata_served {
                    return Err(ProtocolViolation::UnexpectedMetadataPiece {
                        expected: self.metadata_served,
                        got: piece,
                    }.into());
                }
                let start = piece as usize * METADATA_PIECE_SIZE;
                if start >= raw.len() {
                    return Err(ProtocolViolation::InvalidMetadataPiece(piece as i64).into());
                }
                let end = (start + METADATA_PIECE_SIZE).min(raw.len());

                self.metadata_served += 1;
                self.send_metadata(sink, MetadataMessage::Data {
                    piece,
                    total_size: raw.len(),
                    data: raw[start..end].to_vec(),
                }).await
            },

            MetadataMessage::Data { piece, total_size, data } => {
                let Some(download) = self.metadata.as_mut() else {
                    // Late chunk of a fetch another session completed.
                    if self.data.is_some() {
                        return Ok(());
                    }
                    return Err(ProtocolViolation::UnexpectedMessage("metadata piece").into());
                };

                if piece != download.next_piece {
                    return Err(ProtocolViolation::UnexpectedMetadataPiece {
                        expected: download.next_piece,
                        got: piece,
                    }.into());
                }
                if total_size != download.size {
                    return Err(ProtocolViolation::InvalidMetadataSize(total_size as i64).into());
                }
                if data.len() != download.piece_len(piece) {
                    return Err(ProtocolViolation::InvalidMetadataPiece(piece as i64).into());
                }

                download.data.extend_from_slice(&data);
                download.next_piece += 1;
                let next = (download.next_piece < download.num_pieces()).then_some(download.next_piece);
                self.timer.refresh();

                match next {
                    Some(next) => self.send_metadata(sink, MetadataMessage::Request { piece: next }).await,
                    None => self.finish_metadata(),
                }
            },

            MetadataMessage::Reject { piece } => Err(ProtocolViolation::MetadataRejected(piece).into()),
        }
    }

    // Checks the assembled info dict against the info hash and hands it over.
    fn finish_metadata(&mut self) -> Result<()> {
        let Some(download) = self.metadata.take() else {
            return Ok(());
        };
        if verify::hash_info(&download.data) != self.ctx.info_hash {
            return Err(PeerError::MetadataHash);
        }
        tracing::info!("metadata received");
        self.ctx.torrent_tx.send(TorrentCommand::MetadataReceived {
            address: self.address,
            info_raw: download.data,
        })?;
        Ok(())
    }

    async fn send_metadata(&mut self, sink: &mut MessageSink, msg: MetadataMessage) -> Result<()> {
        let Some(id) = self.remote_metadata_id else {
            return Err(ProtocolViolation::UnexpectedMessage("metadata before extension handshake").into());
        };
        self.send_message(sink, Message::Extended(ExtendedMessage::Metadata { id, msg })).await
    }

    fn wants_piece(&self) -> bool {
        self.data.is_some()
        && self.download.is_none()
        && self.state.interested
        && !self.state.peer_choking
    }

    // Reserves a piece if we hold none, then fills the request pipeline.
    async fn request_pieces(&mut self, sink: &mut MessageSink) -> Result<()> {

        if self.state.peer_choking || !self.state.interested {
            return Ok(());
        }
        let Some(data) = self.data.clone() else {
            return Ok(());
        };

        if self.download.is_none() {
            let Some(idx) = self.ctx.pieces.lock().await.reserve(&self.bitfield) else {
                return Ok(());
            };
            tracing::debug!("downloading piece {}", idx);
            self.download = Some(PieceDownload::new(idx, data.metainfo.piece_size(idx)));
        }

        let pipeline_len = self.ctx.config.pipeline_len;
        let mut sent = false;
        if let Some(download) = self.download.as_mut() {
            while download.outstanding < pipeline_len && download.next_block < download.num_blocks() {
                let block_idx = download.next_block;
                let request = BlockInfo {
                    piece_idx: download.idx,
                    offset: block_idx * BLOCK_SIZE,
                    len: block::block_len(download.len, block_idx),
                };
                tracing::trace!("send: request {:?}", request);
                sink.feed(Message::Request(request)).await?;
                download.next_block += 1;
                download.outstanding += 1;
                sent = true;
            }
        }

        if sent {
            sink.flush().await?;
            self.timer.refresh();
        }
        Ok(())
    }

    // If we have BECOME interested (or not), tell the peer.
    async fn update_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        let interested = match self.data {
            Some(_) => self.ctx.pieces.lock().await.wants(&self.bitfield),
            None => false,
        };

        if interested && !self.state.interested {
            self.state.update(|state| state.interested = true);
            self.send_message(sink, Message::Interested).await?;
        } else if !interested && self.state.interested && self.download.is_none() {
            self.state.update(|state| state.interested = false);
            self.send_message(sink, Message::NotInterested).await?;
        }

        if self.wants_piece() {
            self.request_pieces(sink).await?;
        }
        Ok(())
    }

    async fn release_piece(&mut self) {
        if let Some(download) = self.download.take() {
            self.ctx.pieces.lock().await.release(download.idx);
        }
    }
}

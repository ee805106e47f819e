use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::mpsc};
use crate::{disk::DiskError, torrent::TorrentContext};

mod session;
mod message;
mod handshake;
mod extension;
pub mod state;
#[cfg(test)]
mod tests;

pub use session::PeerSession;
pub use handshake::{parse_handshake, Handshake, HandshakeCodec};
pub use message::{parse_messages, ExtendedMessage, Message, MessageCodec};
pub use extension::{ExtHandshake, MetadataMessage, LOCAL_METADATA_ID};

type Result<T, E = PeerError> = std::result::Result<T, E>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;
pub type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("piece {0} failed hash verification")]
    PieceHash(usize),

    #[error("metadata failed hash verification")]
    MetadataHash,

    #[error("disk: {0}")]
    Disk(#[from] DiskError),

    #[error("connected to ourselves")]
    SelfConnection,

    #[error("{0} timeout")]
    Timeout(&'static str),

    #[error("connection closed during handshake")]
    NoHandshake,

    #[error("channel error: {0}")]
    Channel(String),
}

// Anything the remote sent that we refuse to go along with.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake missing extension protocol bit")]
    NoExtensionSupport,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("message of {0} bytes exceeds limit")]
    MessageTooLong(usize),

    #[error("invalid message ID: {0}")]
    InvalidMessageId(u8),

    #[error("invalid length {len} for message ID {id}")]
    InvalidLength {
        id: u8,
        len: usize,
    },

    #[error("malformed extension message: {0}")]
    ExtensionDecode(String),

    #[error("invalid ut_metadata id: {0}")]
    InvalidMetadataId(i64),

    #[error("invalid metadata size: {0}")]
    InvalidMetadataSize(i64),

    #[error("invalid metadata message type: {0}")]
    InvalidMetadataType(i64),

    #[error("invalid metadata piece: {0}")]
    InvalidMetadataPiece(i64),

    #[error("expected metadata piece {expected}, got {got}")]
    UnexpectedMetadataPiece {
        expected: u32,
        got: u32,
    },

    #[error("metadata piece {0} rejected")]
    MetadataRejected(u32),

    #[error("metadata requested but unavailable")]
    MetadataUnavailable,

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(usize),

    #[error("bitfield does not match piece count")]
    InvalidBitfield,

    #[error("invalid block request")]
    InvalidRequest,

    #[error("unexpected {0}")]
    UnexpectedMessage(&'static str),
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands that can be sent to a peer.
#[derive(Debug)]
pub enum PeerCommand {

    // Tell the peer we got a piece (piece idx).
    PieceWritten(usize),

    // End the peer session safely.
    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Sends commands to the session.
    pub peer_tx: PeerTx,

    // Handle to the peer session.
    pub session_handle: tokio::task::JoinHandle<()>,

}

impl PeerHandle {

    // Spawns a session, outbound if no socket is given.
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        socket: Option<TcpStream>,
    ) -> PeerHandle {
        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            if let Err(e) = session.start_session(socket).await {
                tracing::warn!("session with {} closed: {}", address, e);
            }
        });
        PeerHandle { peer_tx, session_handle }
    }
}

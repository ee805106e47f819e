use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::mpsc;

mod block;
mod config;
mod de;
mod disk;
mod picker;
mod torrent;
mod verify;
pub mod builder;
pub mod discovery;
pub mod metainfo;
pub mod p2p;

// Most commonly used block size - 16KB.
pub const BLOCK_SIZE: usize = 0x4000;

// Chunk size of ut_metadata transfers.
pub const METADATA_PIECE_SIZE: usize = 0x4000;

// Largest frame payload we accept, also bounds advertised metadata size.
pub const MAX_FRAME_LEN: usize = 10_000_000;

// Piece length used when building descriptors - 1MB.
pub const DEFAULT_PIECE_LEN: usize = 0x100000;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20 byte SHA1 hash or peer id.
pub type ID = [u8; 20];

// Messages the users of the torrent expect to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {

    // Sent once the listener is bound.
    Listening {
        address: SocketAddr,
    },

    // Sent when a descriptor fetched from peers was written to disk.
    MetadataReceived {
        name: String,
        path: PathBuf,
    },

    // Sent after every verified piece.
    Progress {
        have: usize,
        total: usize,
    },

    // Sent when all pieces are present.
    Finished,

}

type UserTx = mpsc::UnboundedSender<UserCommand>;
pub type UserRx = mpsc::UnboundedReceiver<UserCommand>;

// Re-exports
pub use block::{BlockData, BlockInfo};
pub use config::{generate_client_id, Config};
pub use discovery::{Discovery, DiscoveryError, HttpTracker, StaticPeers};
pub use disk::{DiskError, Span, Store};
pub use metainfo::{MetaInfo, MetaInfoError};
pub use p2p::state::{ConnState, SessionState};
pub use picker::PieceTable;
pub use torrent::{Target, TorrentError};
pub use verify::{hash_info, hash_piece, verify_piece};

// Spawns the torrent task.
pub fn start_torrent(
    target: Target,
    discovery: Arc<dyn Discovery>,
    config: Config,
) -> (Handle, UserRx) {
    let (user_tx, user_rx) = mpsc::unbounded_channel();
    let (mut torrent, torrent_tx) = torrent::Torrent::new(target, discovery, config, user_tx);
    let handle = tokio::spawn(async move {
        torrent.start().await.map_err(|e| {
            tracing::error!("torrent error: {}", e);
            e
        })
    });
    (
        Handle {
            torrent_tx,
            handle,
        },
        user_rx,
    )
}

// Handle returned to the user to interact with the torrent.
pub struct Handle {

    torrent_tx: torrent::TorrentTx,

    handle: tokio::task::JoinHandle<torrent::Result<()>>,

}

impl Handle {

    // Asks the torrent to stop, a finished torrent has already stopped.
    pub fn shutdown(&self) {
        self.torrent_tx.send(torrent::TorrentCommand::Shutdown).ok();
    }

    // Waits for the torrent task, returning its start up or runtime error.
    pub async fn join(self) -> Result<(), TorrentError> {
        self.handle.await.map_err(|_| TorrentError::TorrentPanic)?
    }
}

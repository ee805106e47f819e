use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration
};
use rand::Rng;
use crate::ID;

#[derive(Debug, Clone)]
pub struct Config {

    pub client_id: ID,

    // Directory the torrent's files (and fetched .torrent files) are written to.
    pub dir: PathBuf,

    pub listen_address: SocketAddr,

    // Truncate existing files instead of verifying them.
    pub truncate: bool,

    // Only serve. Every piece must already be on disk and no file is created.
    pub seed_only: bool,

    pub announce_interval: Duration,

    // Cap on concurrent outbound sessions.
    pub max_peers: usize,

    pub connect_timeout: Duration,

    pub handshake_timeout: Duration,

    // Refreshed by every block received, block requested or metadata chunk.
    pub block_timeout: Duration,

    // Wait between attempts to reserve a piece when none is available.
    pub retry_interval: Duration,

    // Outstanding block requests per session.
    pub pipeline_len: usize,

    // Number of whole pieces kept for serving.
    pub read_cache_size: usize,

}

const CLIENT_PREFIX: &[u8; 8] = b"-RL0100-";

// Azureus style id, client prefix followed by random bytes.
pub fn generate_client_id() -> ID {
    let mut id = [0; 20];
    id[..8].copy_from_slice(CLIENT_PREFIX);
    rand::thread_rng().fill(&mut id[8..]);
    id
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: generate_client_id(),
            dir: PathBuf::from("."),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            truncate: false,
            seed_only: false,
            announce_interval: Duration::from_secs(300),
            max_peers: 50,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            block_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(1),
            pipeline_len: 5,
            read_cache_size: 64,
        }
    }
}

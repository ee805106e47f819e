use std::{
    collections::HashSet,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use crate::ID;

mod http;
pub use http::HttpTracker;

type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(thiserror::Error, Debug)]
pub enum DiscoveryError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("response error: {0}")]
    ResponseError(String),

}

// Finds peers for a torrent and tells the swarm where we listen.
#[async_trait::async_trait]
pub trait Discovery: Send + Sync {

    async fn find_peers(&self, info_hash: ID) -> Result<Vec<SocketAddr>>;

    async fn announce(&self, info_hash: ID, port: u16) -> Result<()>;

    // How often the service wants to hear from us, if it said.
    fn interval(&self) -> Option<Duration> { None }

}

// A fixed set of peers, from the command line and a bootstrap cache file.
#[derive(Debug, Default)]
pub struct StaticPeers {

    peers: Vec<SocketAddr>,

    // One ip:port per line.
    cache: Option<PathBuf>,

}

impl StaticPeers {

    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers, cache: None }
    }

    // Merges the given peers with those in the cache file, a missing file is empty.
    pub fn with_cache<P: AsRef<Path>>(peers: Vec<SocketAddr>, path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut all = peers;

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    match line.parse() {
                        Ok(address) => all.push(address),
                        Err(_) => tracing::warn!("skipping invalid cached peer: {}", line),
                    }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => return Err(e.into()),
        }

        let mut seen = HashSet::new();
        all.retain(|address| seen.insert(*address));
        tracing::debug!("{} bootstrap peers", all.len());
        Ok(Self { peers: all, cache: Some(path) })
    }

    pub fn peers(&self) -> &[SocketAddr] { &self.peers }

    // Rewrites the cache file with the known peers.
    pub fn persist(&self) -> Result<()> {
        if let Some(path) = &self.cache {
            let contents: String = self.peers
                .iter()
                .map(|address| format!("{}\n", address))
                .collect();
            std::fs::write(path, contents)?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Discovery for StaticPeers {

    async fn find_peers(&self, _info_hash: ID) -> Result<Vec<SocketAddr>> {
        Ok(self.peers.clone())
    }

    // Nobody to tell.
    async fn announce(&self, info_hash: ID, port: u16) -> Result<()> {
        tracing::debug!("static peers, not announcing {} on port {}", hex::encode(info_hash), port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_peers_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("peers.txt");
        std::fs::write(&path, "127.0.0.1:6881\n\nnot an address\n10.0.0.2:51413\n").unwrap();

        let cli: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let peers = StaticPeers::with_cache(vec![cli], &path).unwrap();
        let found = peers.find_peers([0; 20]).await.unwrap();
        assert_eq!(found, vec![cli, "10.0.0.2:51413".parse().unwrap()]);

        peers.persist().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "127.0.0.1:6881\n10.0.0.2:51413\n");
    }

    #[test]
    fn test_missing_cache_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let peers = StaticPeers::with_cache(Vec::new(), tmp.path().join("missing")).unwrap();
        assert!(peers.peers().is_empty());
    }
}

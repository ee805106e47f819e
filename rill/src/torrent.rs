use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch, Mutex},
    time::{self, Instant, MissedTickBehavior},
};
use crate::{
    config::Config,
    discovery::{Discovery, DiscoveryError},
    disk::{self, DiskError, Store},
    metainfo::{MetaInfo, MetaInfoError},
    p2p::{PeerCommand, PeerHandle},
    picker::PieceTable,
    Bitfield,
    UserCommand,
    UserTx,
    ID,
};

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("disk error: {0}")]
    DiskError(#[from] DiskError),

    #[error("metainfo error: {0}")]
    MetaInfoError(#[from] MetaInfoError),

    #[error("discovery error: {0}")]
    DiscoveryError(#[from] DiscoveryError),

    #[error("no peers found")]
    NoPeers,

    #[error("local data incomplete, {have} of {total} pieces present")]
    IncompleteData {
        have: usize,
        total: usize,
    },

    #[error("seeding needs a torrent file")]
    NoMetaInfo,

    #[error("received metadata does not match info hash")]
    MetadataMismatch,

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("torrent task panicked")]
    TorrentPanic,
}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::ChannelError(e.to_string())
    }
}

#[derive(Debug)]
pub enum TorrentCommand {

    // Sent by a session once a piece is verified, written and committed.
    PieceVerified { address: SocketAddr, idx: usize },

    // Sent by a session with an info dict matching the info hash.
    MetadataReceived { address: SocketAddr, info_raw: Vec<u8> },

    // Sent by every session on the way out.
    PeerDisconnected { address: SocketAddr },

    Shutdown,

}

// Type aliases.
pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<TorrentCommand>;
pub type TorrentRx = mpsc::UnboundedReceiver<TorrentCommand>;

// What we start from, a full descriptor or just the hash of one.
#[derive(Debug, Clone)]
pub enum Target {

    MetaInfo(MetaInfo),

    InfoHash(ID),

}

impl Target {
    pub fn info_hash(&self) -> ID {
        match self {
            Target::MetaInfo(metainfo) => metainfo.info_hash(),
            Target::InfoHash(info_hash) => *info_hash,
        }
    }
}

// Everything that only exists once the descriptor is known.
pub struct TorrentData {

    pub metainfo: MetaInfo,

    pub store: Arc<Store>,

}

impl std::fmt::Debug for TorrentData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentData")
            .field("name", &self.metainfo.name())
            .field("root", &self.store.root())
            .finish()
    }
}

// State shared with every session of the torrent.
#[derive(Debug)]
pub struct TorrentContext {

    pub info_hash: ID,

    pub client_id: ID,

    pub config: Config,

    pub torrent_tx: TorrentTx,

    // Pending, reserved and owned pieces, the one lock sessions contend on.
    // Empty until the descriptor is known.
    pub pieces: Mutex<PieceTable>,

    // None until the descriptor is known, sessions wait on changes.
    pub metadata_rx: watch::Receiver<Option<Arc<TorrentData>>>,

}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    metadata_tx: watch::Sender<Option<Arc<TorrentData>>>,

    // Descriptor given at start, processed once running.
    metainfo: Option<MetaInfo>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Peers we know about but don't have a session with.
    candidates: VecDeque<SocketAddr>,

    discovery: Arc<dyn Discovery>,

    torrent_rx: TorrentRx,

    user_tx: UserTx,

    // All data present, we only serve.
    seeding: bool,

}

impl Torrent {

    pub fn new(
        target: Target,
        discovery: Arc<dyn Discovery>,
        config: Config,
        user_tx: UserTx,
    ) -> (Torrent, TorrentTx) {

        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        let (metadata_tx, metadata_rx) = watch::channel(None);
        let info_hash = target.info_hash();
        let metainfo = match target {
            Target::MetaInfo(metainfo) => Some(metainfo),
            Target::InfoHash(_) => None,
        };

        (
            Torrent {
                ctx: Arc::new(TorrentContext {
                    info_hash,
                    client_id: config.client_id,
                    config,
                    torrent_tx: torrent_tx.clone(),
                    pieces: Mutex::new(PieceTable::new(Bitfield::new())),
                    metadata_rx,
                }),
                metadata_tx,
                metainfo,
                peers: HashMap::new(),
                candidates: VecDeque::new(),
                discovery,
                torrent_rx,
                user_tx,
                seeding: false,
            },
            torrent_tx,
        )
    }

    // Runs until the download finishes, or until shutdown when seeding.
    #[tracing::instrument(name = "torrent", skip_all, fields(info_hash = %hex::encode(self.ctx.info_hash)))]
    pub async fn start(&mut self) -> Result<()> {

        if let Some(metainfo) = self.metainfo.take() {
            self.process_metainfo(metainfo).await?;
        }
        self.seeding = self.is_complete().await;

        if self.ctx.config.seed_only && !self.seeding {
            if self.metadata_tx.borrow().is_none() {
                return Err(TorrentError::NoMetaInfo);
            }
            let pieces = self.ctx.pieces.lock().await;
            return Err(TorrentError::IncompleteData {
                have: pieces.num_have(),
                total: pieces.num_pieces(),
            });
        }

        let listener = TcpListener::bind(self.ctx.config.listen_address).await?;
        let address = listener.local_addr()?;
        tracing::info!("listening on {}", address);
        self.user_tx.send(UserCommand::Listening { address }).ok();

        if self.seeding {
            tracing::info!("all pieces present, seeding");
        } else {
            // Nobody to fetch from is fatal at start up.
            let peers = self.discovery.find_peers(self.ctx.info_hash).await?;
            if peers.is_empty() {
                return Err(TorrentError::NoPeers);
            }
            self.add_candidates(peers);
            self.connect_to_peers();
        }

        let res = self.run(listener).await;
        self.shutdown().await;
        res
    }

    async fn run(&mut self, listener: TcpListener) -> Result<()> {

        let port = listener.local_addr()?.port();
        let mut ticker = time::interval(self.announce_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Discovery already ran when fetching, seeding announces straight away.
        if !self.seeding {
            ticker.reset();
        }

        // Top level torrent loop.
        loop { tokio::select! {

            _ = ticker.tick() => {
                self.tick(port).await;
                let interval = self.announce_interval();
                if interval != ticker.period() {
                    tracing::debug!("announce interval now {:?}", interval);
                    ticker = time::interval_at(Instant::now() + interval, interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
            },

            conn = listener.accept() => match conn {
                Ok((stream, address)) => self.accept_peer(stream, address),
                Err(e) => tracing::warn!("inbound peer connection error: {}", e),
            },

            Some(cmd) = self.torrent_rx.recv() => match cmd {

                TorrentCommand::PieceVerified { address, idx } => {
                    if self.handle_piece_verified(address, idx).await {
                        break;
                    }
                },

                TorrentCommand::MetadataReceived { address, info_raw } => {
                    if self.handle_metadata(address, info_raw).await? {
                        break;
                    }
                },

                TorrentCommand::PeerDisconnected { address } => self.handle_disconnect(address),

                TorrentCommand::Shutdown => {
                    tracing::info!("torrent shutdown");
                    break;
                },
            },
        }}

        Ok(())
    }

    // Sets up storage, checks what is already on disk and publishes the
    // descriptor to the sessions.
    async fn process_metainfo(&mut self, metainfo: MetaInfo) -> Result<()> {

        tracing::info!(
            "{}: {} in {} pieces, created {}",
            metainfo.name(),
            metainfo.size_fmt(),
            metainfo.num_pieces(),
            metainfo.creation_date_fmt().unwrap_or_else(|| "unknown".to_string()),
        );

        let config = &self.ctx.config;
        let store = if config.seed_only {
            Store::open_existing(&metainfo, &config.dir, config.read_cache_size)?
        } else {
            Store::materialize(&metainfo, &config.dir, config.truncate, config.read_cache_size)?
        };
        let store = Arc::new(store);
        let own = disk::check_existing(store.clone()).await?;
        tracing::info!("{} of {} pieces already present", own.count_ones(), own.len());

        // Table first, sessions read it as soon as they see the data.
        *self.ctx.pieces.lock().await = PieceTable::new(own);
        self.metadata_tx.send_replace(Some(Arc::new(TorrentData { metainfo, store })));
        Ok(())
    }

    async fn is_complete(&self) -> bool {
        let known = self.metadata_tx.borrow().is_some();
        known && self.ctx.pieces.lock().await.is_complete()
    }

    // What the discovery service asked for, otherwise the configured interval.
    fn announce_interval(&self) -> Duration {
        self.discovery
            .interval()
            .filter(|interval| !interval.is_zero())
            .unwrap_or(self.ctx.config.announce_interval)
    }

    async fn tick(&mut self, port: u16) {
        if self.seeding {
            if let Err(e) = self.discovery.announce(self.ctx.info_hash, port).await {
                tracing::warn!("announce error: {}", e);
            }
            return;
        }

        if self.peers.len() >= self.ctx.config.max_peers || !self.candidates.is_empty() {
            return;
        }
        match self.discovery.find_peers(self.ctx.info_hash).await {
            Ok(peers) => {
                self.add_candidates(peers);
                self.connect_to_peers();
            },
            Err(e) => tracing::warn!("peer discovery error: {}", e),
        }
    }

    fn add_candidates(&mut self, peers: Vec<SocketAddr>) {
        for address in peers {
            if !self.peers.contains_key(&address) && !self.candidates.contains(&address) {
                self.candidates.push_back(address);
            }
        }
        tracing::debug!("{} candidate peers", self.candidates.len());
    }

    fn connect_to_peers(&mut self) {
        let count = self.candidates
            .len()
            .min(self.ctx.config.max_peers.saturating_sub(self.peers.len()));
        if count == 0 {
            return;
        }

        tracing::info!("connecting to {} peers", count);
        for address in self.candidates.drain(..count) {
            self.peers.insert(address, PeerHandle::start_session(address, self.ctx.clone(), None));
        }
    }

    fn accept_peer(&mut self, stream: TcpStream, address: SocketAddr) {
        if self.peers.contains_key(&address) {
            tracing::debug!("already connected to {}", address);
            return;
        }
        tracing::info!("inbound connection from {}", address);
        self.peers.insert(address, PeerHandle::start_session(address, self.ctx.clone(), Some(stream)));
    }

    // Returns whether the download is done.
    async fn handle_piece_verified(&mut self, address: SocketAddr, idx: usize) -> bool {

        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::PieceWritten(idx)).ok();
        }

        let (have, total, complete) = {
            let pieces = self.ctx.pieces.lock().await;
            (pieces.num_have(), pieces.num_pieces(), pieces.is_complete())
        };
        tracing::info!("piece {} from {} verified, {}/{} pieces", idx, address, have, total);
        self.user_tx.send(UserCommand::Progress { have, total }).ok();

        if complete && !self.seeding {
            self.finish();
            return true;
        }
        false
    }

    // Returns whether the download is done, which is possible when the data
    // was already on disk.
    async fn handle_metadata(&mut self, address: SocketAddr, info_raw: Vec<u8>) -> Result<bool> {

        if self.metadata_tx.borrow().is_some() {
            tracing::debug!("metadata from {} arrived late, ignoring", address);
            return Ok(false);
        }

        let metainfo = MetaInfo::from_info_bytes(info_raw)?;
        if metainfo.info_hash() != self.ctx.info_hash {
            return Err(TorrentError::MetadataMismatch);
        }
        tracing::info!("metadata for {} received from {}", metainfo.name(), address);

        let path: PathBuf = self.ctx.config.dir.join(format!("{}.torrent", metainfo.name()));
        tokio::fs::create_dir_all(&self.ctx.config.dir).await?;
        tokio::fs::write(&path, metainfo.to_torrent_bytes()).await?;
        tracing::info!("descriptor written to {:?}", path);

        let name = metainfo.name().to_string();
        self.process_metainfo(metainfo).await?;
        self.user_tx.send(UserCommand::MetadataReceived { name, path }).ok();

        if self.is_complete().await {
            self.finish();
            return Ok(true);
        }
        Ok(false)
    }

    fn handle_disconnect(&mut self, address: SocketAddr) {
        if self.peers.remove(&address).is_none() {
            return;
        }
        tracing::debug!("{} disconnected, {} peers left", address, self.peers.len());
        if !self.seeding {
            self.connect_to_peers();
        }
    }

    fn finish(&mut self) {
        tracing::info!("torrent download complete");
        self.user_tx.send(UserCommand::Finished).ok();
    }

    async fn shutdown(&mut self) {

        tracing::info!("disconnecting from {} peers", self.peers.len());
        for peer in self.peers.values() {
            peer.peer_tx.send(PeerCommand::Shutdown).ok();
        }

        // Sessions still connecting don't see the command until they are done.
        let wait = self.ctx.config.handshake_timeout;
        for (address, mut peer) in self.peers.drain() {
            if time::timeout(wait, &mut peer.session_handle).await.is_err() {
                tracing::debug!("aborting session with {}", address);
                peer.session_handle.abort();
            }
        }
    }
}

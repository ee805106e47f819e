use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use url::Url;
use rill::{
    builder,
    start_torrent,
    Config,
    Discovery,
    Handle,
    HttpTracker,
    MetaInfo,
    StaticPeers,
    Target,
    UserCommand,
    UserRx,
    DEFAULT_PIECE_LEN,
    ID,
};

#[derive(Parser)]
#[command(name = "rill", about = "Share and fetch files over the BitTorrent protocol")]
struct Args {

    #[arg(short, long, global = true, help = "Verbose output")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,

}

#[derive(Subcommand)]
enum Command {

    // Writes <name>.torrent for a file or directory and prints its info hash.
    Create {
        #[arg(help = "File or directory to share")]
        path: PathBuf,

        #[arg(long, default_value_t = DEFAULT_PIECE_LEN, help = "Piece length in bytes")]
        piece_length: usize,

        #[arg(long, default_value = ".", help = "Directory to write the .torrent file to")]
        out: PathBuf,
    },

    // Verifies local files against a descriptor and serves them.
    Seed {
        #[arg(help = "Path to torrent file")]
        torrent: PathBuf,

        #[arg(short, long, default_value_t = 6881, help = "Port to listen on")]
        port: u16,

        #[arg(long, help = "HTTP tracker to announce to")]
        tracker: Option<Url>,

        #[arg(long, default_value = ".", help = "Directory containing the shared files")]
        dir: PathBuf,
    },

    // Downloads from a descriptor, or from just its info hash.
    Fetch {
        #[arg(help = "Path to torrent file or 40 character hex info hash")]
        target: String,

        #[arg(short, long, default_value_t = 6881, help = "Port to listen on")]
        port: u16,

        #[arg(long = "peer", help = "Peer address to connect to, may be repeated")]
        peers: Vec<SocketAddr>,

        #[arg(long, help = "Bootstrap peer cache, one ip:port per line")]
        peers_file: Option<PathBuf>,

        #[arg(long, help = "HTTP tracker to find peers with")]
        tracker: Option<Url>,

        #[arg(long, default_value = ".", help = "Directory to download into")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {

    let args = Args::parse();

    // Set up logging.
    let level = if args.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let sub = tracing_subscriber::fmt()
        .with_max_level(level)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(sub) {
        eprintln!("failed to set up logging: {}", e);
    }

    let res = match args.command {
        Command::Create { path, piece_length, out } => create(path, piece_length, out),
        Command::Seed { torrent, port, tracker, dir } => seed(torrent, port, tracker, dir).await,
        Command::Fetch { target, port, peers, peers_file, tracker, dir } => {
            fetch(target, port, peers, peers_file, tracker, dir).await
        },
    };

    if let Err(e) = res {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn create(path: PathBuf, piece_length: usize, out: PathBuf) -> anyhow::Result<()> {
    anyhow::ensure!(piece_length > 0, "piece length must be greater than 0");

    let metainfo = builder::build(&path, piece_length)
        .with_context(|| format!("failed to create torrent from {:?}", path))?;
    let torrent_path = out.join(format!("{}.torrent", metainfo.name()));
    std::fs::write(&torrent_path, metainfo.to_torrent_bytes())
        .with_context(|| format!("error writing to {:?}", torrent_path))?;

    tracing::info!("wrote {:?}", torrent_path);
    println!("info hash => {}", metainfo.info_hash_hex());
    Ok(())
}

fn config(port: u16, dir: PathBuf) -> Config {
    Config {
        dir,
        listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
        ..Default::default()
    }
}

async fn seed(torrent: PathBuf, port: u16, tracker: Option<Url>, dir: PathBuf) -> anyhow::Result<()> {

    let metainfo = MetaInfo::new(&torrent)
        .with_context(|| format!("failed to load {:?}", torrent))?;
    let config = Config { seed_only: true, ..config(port, dir) };
    let discovery: Arc<dyn Discovery> = match tracker {
        Some(url) => Arc::new(HttpTracker::new(url, config.client_id, port)),
        None => Arc::new(StaticPeers::default()),
    };

    let (handle, rx) = start_torrent(Target::MetaInfo(metainfo), discovery, config);
    drive(handle, rx).await
}

async fn fetch(
    target: String,
    port: u16,
    peers: Vec<SocketAddr>,
    peers_file: Option<PathBuf>,
    tracker: Option<Url>,
    dir: PathBuf,
) -> anyhow::Result<()> {

    let target = parse_target(&target)?;
    let config = config(port, dir);

    let mut cache = None;
    let discovery: Arc<dyn Discovery> = match (tracker, peers_file) {
        (Some(url), _) => Arc::new(HttpTracker::new(url, config.client_id, port)),
        (None, Some(path)) => {
            let static_peers = Arc::new(
                StaticPeers::with_cache(peers, &path)
                    .with_context(|| format!("failed to read peer cache {:?}", path))?,
            );
            cache = Some(static_peers.clone());
            static_peers
        },
        (None, None) => Arc::new(StaticPeers::new(peers)),
    };

    let (handle, rx) = start_torrent(target, discovery, config);
    drive(handle, rx).await?;

    if let Some(static_peers) = cache {
        static_peers.persist().context("failed to write peer cache")?;
    }
    Ok(())
}

// A path to a .torrent file, otherwise a hex info hash.
fn parse_target(target: &str) -> anyhow::Result<Target> {
    let path = PathBuf::from(target);
    if path.extension().map_or(false, |ext| ext == "torrent") || path.is_file() {
        let metainfo = MetaInfo::new(&path)
            .with_context(|| format!("failed to load {:?}", path))?;
        return Ok(Target::MetaInfo(metainfo));
    }

    let bytes = hex::decode(target).context("target is neither a torrent file nor a hex info hash")?;
    let info_hash: ID = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("info hash must be 20 bytes"))?;
    Ok(Target::InfoHash(info_hash))
}

// Reports progress until the torrent finishes or we are interrupted.
async fn drive(handle: Handle, mut rx: UserRx) -> anyhow::Result<()> {

    loop { tokio::select! {

        cmd = rx.recv() => match cmd {
            Some(UserCommand::Listening { address }) => tracing::info!("listening on {}", address),
            Some(UserCommand::MetadataReceived { name, path }) => {
                println!("metadata for {} saved to {:?}", name, path);
            },
            Some(UserCommand::Progress { have, total }) => tracing::info!("{}/{} pieces", have, total),
            Some(UserCommand::Finished) => {
                println!("download complete");
                break;
            },
            // Torrent stopped, the error comes from join.
            None => break,
        },

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            handle.shutdown();
            break;
        },
    }}

    handle.join().await?;
    Ok(())
}

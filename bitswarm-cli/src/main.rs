use std::{path::PathBuf, sync::Arc, time::Duration};

use bitswarm::{
    FileStorage, MemoryStorage, PeerEvent, Storage, Torrent, TorrentConfig, TorrentEvent,
    TorrentInfo, TorrentView,
};
use bytes::Bytes;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use rand::{rngs::StdRng, Rng as _, SeedableRng as _};
use tokio::time::Instant;

mod sim;
use sim::{Swarm, SwarmOptions};

pub struct ByteDisplay(u64);

impl std::fmt::Display for ByteDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (n, suffix) = if self.0 > 1024 * 1024 * 1024 {
            (self.0 as f64 / (1024.0 * 1024.0 * 1024.0), "GiB")
        } else if self.0 > 1024 * 1024 {
            (self.0 as f64 / (1024.0 * 1024.0), "MiB")
        } else if self.0 > 1024 {
            (self.0 as f64 / 1024.0, "KiB")
        } else {
            (self.0 as f64, "B")
        };
        write!(f, "{n:.1} {suffix}")
    }
}

pub struct ByteRateDisplay(u64);

impl std::fmt::Display for ByteRateDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/s", ByteDisplay(self.0))
    }
}

/// Download random content from a simulated local swarm.
#[derive(Debug, Parser)]
struct Args {
    /// number of pieces
    #[clap(long, default_value_t = 64)]
    pieces: u32,

    #[clap(long, default_value_t = 256 * 1024)]
    piece_length: u32,

    /// number of honest simulated peers
    #[clap(long, default_value_t = 8)]
    peers: usize,

    /// per request latency in milliseconds
    #[clap(long, default_value_t = 20)]
    latency: u64,

    /// upload rate of every peer in bytes/sec
    #[clap(long, default_value_t = 4 * 1024 * 1024)]
    rate: u32,

    /// chance of a peer holding a piece beyond its share
    #[clap(long, default_value_t = 0.3)]
    coverage: f64,

    /// add a peer that serves corrupted blocks
    #[clap(long)]
    corrupt_peer: bool,

    /// write the content under this directory instead of keeping it in memory
    #[clap(long)]
    output: Option<PathBuf>,

    #[clap(long, default_value_t = 4)]
    unchoke_slots: usize,

    /// request timeout in seconds
    #[clap(long, default_value_t = 30)]
    request_timeout: u64,

    #[clap(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter_layer)
        .init();

    let args = Args::parse();
    run(args).await
}

async fn run(args: Args) -> Result<()> {
    if args.peers == 0 {
        return Err(eyre!("at least one peer is required"));
    }

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut content = vec![0u8; args.pieces as usize * args.piece_length as usize];
    rng.fill(content.as_mut_slice());
    let content = Bytes::from(content);
    let info = TorrentInfo::from_data("swarm.bin", args.piece_length, &content)?;

    let swarm = Swarm::generate(
        &info,
        content.clone(),
        &SwarmOptions {
            peers: args.peers,
            latency: Duration::from_millis(args.latency),
            rate: args.rate,
            coverage: args.coverage,
            corrupt_peer: args.corrupt_peer,
        },
        &mut rng,
    );

    let storage: Arc<dyn Storage> = match &args.output {
        Some(dir) => Arc::new(FileStorage::new(info.clone(), dir)),
        None => Arc::new(MemoryStorage::new(info.clone())),
    };
    let config = TorrentConfig {
        unchoke_slots: args.unchoke_slots,
        request_timeout: Duration::from_secs(args.request_timeout),
        rng_seed: args.seed,
        ..Default::default()
    };

    tracing::info!(
        pieces = info.pieces_count(),
        size = %ByteDisplay(info.total_size()),
        peers = args.peers,
        "starting download"
    );
    let (torrent, mut events) = Torrent::spawn(info.clone(), storage.clone(), config);
    for addr in swarm.addrs() {
        torrent.peer_discovered(addr);
    }

    let start = Instant::now();
    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(TorrentEvent::Connect(addr)) => match swarm.connect(addr) {
                    Some(peer) => {
                        let key = match torrent.add_peer(peer.clone()).await {
                            Some(key) => key,
                            None => continue,
                        };
                        torrent.peer_event(key, PeerEvent::Bitfield(peer.pieces().clone()));
                        torrent.peer_event(key, PeerEvent::Unchoke);
                        if peer.is_corrupt() {
                            tracing::info!(addr = %addr, "corrupt peer joined");
                        }
                    }
                    None => torrent.connect_failed(addr),
                },
                Some(TorrentEvent::PieceVerified(piece)) => tracing::debug!(piece = %piece, "piece verified"),
                Some(TorrentEvent::PieceFailed(piece)) => tracing::warn!(piece = %piece, "piece failed verification"),
                Some(TorrentEvent::Completed) => break,
                Some(TorrentEvent::Failed(reason)) => return Err(eyre!("download failed: {reason}")),
                Some(TorrentEvent::Stopped) | None => return Err(eyre!("torrent stopped before completing")),
            },
            _ = report.tick() => {
                if let Some(view) = torrent.view().await {
                    log_view(&view);
                }
            }
        }
    }

    let elapsed = start.elapsed();
    for piece in info.piece_indices() {
        let stored = storage.read_piece(piece).await?;
        let begin = piece.index() * info.piece_length() as usize;
        if stored != content.slice(begin..begin + stored.len()) {
            return Err(eyre!("{piece} does not match the original content"));
        }
    }
    tracing::info!(
        elapsed = ?elapsed,
        rate = %ByteRateDisplay((info.total_size() as f64 / elapsed.as_secs_f64().max(0.001)) as u64),
        "download complete, content verified"
    );
    torrent.stop();
    Ok(())
}

fn log_view(view: &TorrentView) {
    let unchoked = view.peers.iter().filter(|peer| peer.unchoked).count();
    let pending = view.peers.iter().map(|peer| peer.pending).sum::<usize>();
    tracing::info!(
        mode = ?view.mode,
        verified = view.summary.verified,
        partial = view.summary.partially_missing,
        missing = view.summary.completely_missing,
        peers = view.peers.len(),
        unchoked,
        pending,
        rate = %ByteRateDisplay(u64::from(view.stats.download_rate)),
        "{:.1}%",
        view.progress * 100.0
    );
}

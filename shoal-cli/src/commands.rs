//! CLI command implementations

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use shoal_core::announce::{PeerInfo, StaticPeerSource};
use shoal_core::scheduler::spawn_scheduler;
use shoal_core::storage::MemoryTorrentArchive;
use shoal_core::{
    Bitfield, Digest, NodeContext, PeerId, Result, Scheduler, ShoalConfig, ShoalError,
};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Serve a complete blob until interrupted
    Seed {
        /// Address to accept peers on
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: SocketAddr,
        /// Blob name
        #[arg(long)]
        name: String,
        /// Hex digest of the blob
        #[arg(long)]
        digest: Digest,
        /// Number of pieces in the blob
        #[arg(long, default_value = "1")]
        pieces: u32,
        /// Local peer id in hex; derived from the listen address when omitted
        #[arg(long)]
        peer_id: Option<PeerId>,
    },
    /// Connect to a seeder and report the outcome
    Fetch {
        /// Seeder's peer id in hex
        #[arg(long)]
        peer_id: PeerId,
        /// Seeder's address
        #[arg(long)]
        addr: SocketAddr,
        /// Blob name
        #[arg(long)]
        name: String,
        /// Hex digest of the blob
        #[arg(long)]
        digest: Digest,
        /// Number of pieces in the blob
        #[arg(long, default_value = "1")]
        pieces: u32,
        /// Namespace sent in the handshake
        #[arg(long, default_value = "")]
        namespace: String,
        /// How long to wait for the conn
        #[arg(long, default_value = "10")]
        wait_secs: u64,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the first configuration, scheduler or I/O failure of the command
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Seed {
            listen,
            name,
            digest,
            pieces,
            peer_id,
        } => seed(listen, name, digest, pieces, peer_id).await,
        Commands::Fetch {
            peer_id,
            addr,
            name,
            digest,
            pieces,
            namespace,
            wait_secs,
        } => {
            let target = PeerInfo::new(peer_id, addr);
            fetch(target, name, digest, pieces, namespace, Duration::from_secs(wait_secs)).await
        }
    }
}

/// Seeds a complete blob until ctrl-c.
///
/// # Errors
/// - Piece count is zero
/// - Listener cannot be bound or the torrent cannot be registered
pub async fn seed(
    listen: SocketAddr,
    name: String,
    digest: Digest,
    pieces: u32,
    peer_id: Option<PeerId>,
) -> Result<()> {
    let bitfield = bitfield_for(pieces, true)?;
    let mut config = ShoalConfig::from_env();
    config.scheduler.listen_addr = listen;

    let peer_id = peer_id.unwrap_or_else(|| PeerId::from_address(listen));
    let archive = Arc::new(MemoryTorrentArchive::new());
    let info = archive.add_torrent(&name, digest.clone(), bitfield);

    let context = NodeContext::new(peer_id, &config.bandwidth);
    let scheduler =
        spawn_scheduler(config, context, archive, Arc::new(StaticPeerSource::new())).await?;

    scheduler.download(&name, &digest).await?;

    println!("Seeding {info}");
    println!("  peer id: {peer_id}");
    println!("  listening on: {}", scheduler.listen_addr());

    tokio::signal::ctrl_c().await?;
    println!("Shutting down");
    scheduler.stop().await;

    Ok(())
}

/// Connects to one seeder, waits for the conn, and prints the blacklist.
///
/// # Errors
/// - Piece count is zero
/// - Scheduler cannot start or the torrent cannot be registered
pub async fn fetch(
    target: PeerInfo,
    name: String,
    digest: Digest,
    pieces: u32,
    namespace: String,
    wait: Duration,
) -> Result<()> {
    let bitfield = bitfield_for(pieces, false)?;
    let mut config = ShoalConfig::from_env();
    config.scheduler.namespace = namespace;

    let archive = Arc::new(MemoryTorrentArchive::new());
    let info = archive.add_torrent(&name, digest.clone(), bitfield);
    let peers = Arc::new(StaticPeerSource::new());
    peers.add_peer(info.info_hash(), target);

    let context = NodeContext::new(PeerId::generate(), &config.bandwidth);
    let scheduler = spawn_scheduler(config, context, archive, peers).await?;

    scheduler.download(&name, &digest).await?;
    println!("Connecting to {} at {} for {info}", target.peer_id, target.addr);

    let deadline = tokio::time::Instant::now() + wait;
    let mut connected = false;
    while tokio::time::Instant::now() < deadline {
        let stats = scheduler.torrent_stats(&digest).await?;
        if stats.peers.contains(&target.peer_id) {
            connected = true;
            break;
        }
        if !scheduler.blacklist_snapshot().await?.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if connected {
        println!("Connected to {}", target.peer_id);
    } else {
        println!("No conn to {} after {:?}", target.peer_id, wait);
    }
    println!("{}", report_blacklist(&scheduler).await?);

    scheduler.stop().await;
    Ok(())
}

/// Renders the scheduler's blacklist as pretty JSON.
///
/// # Errors
/// - Scheduler has stopped or the snapshot cannot be serialized
pub async fn report_blacklist(scheduler: &dyn Scheduler) -> Result<String> {
    let entries = scheduler.blacklist_snapshot().await?;
    serde_json::to_string_pretty(&entries).map_err(|e| ShoalError::Io(e.into()))
}

/// Local availability for a blob of `pieces` pieces.
fn bitfield_for(pieces: u32, complete: bool) -> Result<Bitfield> {
    if pieces == 0 {
        return Err(ShoalError::Configuration {
            reason: "a blob needs at least one piece".to_string(),
        });
    }
    Ok(if complete {
        Bitfield::full(pieces)
    } else {
        Bitfield::new(pieces)
    })
}

//! Actor implementation for the scheduler.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::SchedulerError;
use super::commands::{InternalCommand, SchedulerCommand};
use super::core::{CoreParts, SchedulerCore};
use super::handle::SchedulerHandle;
use crate::announce::PeerSource;
use crate::config::ShoalConfig;
use crate::conn::{ConnEvent, Handshaker, NodeContext};
use crate::connstate::{Clock, ConnState, SystemClock};
use crate::storage::TorrentArchive;

/// Pause after a failed accept. Errors such as EMFILE persist until
/// descriptors are released.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Binds the listener, spawns the scheduler actor and returns its handle.
///
/// The actor stops on [`SchedulerHandle::stop`] or once every handle has
/// been dropped.
///
/// # Errors
///
/// - `SchedulerError::Io` - If the listen address cannot be bound
pub async fn spawn_scheduler(
    config: ShoalConfig,
    context: NodeContext,
    archive: Arc<dyn TorrentArchive>,
    peer_source: Arc<dyn PeerSource>,
) -> Result<SchedulerHandle, SchedulerError> {
    spawn_scheduler_with_clock(config, context, archive, peer_source, Arc::new(SystemClock)).await
}

/// Like [`spawn_scheduler`] with an explicit clock for blacklist expiry.
///
/// # Errors
///
/// - `SchedulerError::Io` - If the listen address cannot be bound
pub async fn spawn_scheduler_with_clock(
    mut config: ShoalConfig,
    context: NodeContext,
    archive: Arc<dyn TorrentArchive>,
    peer_source: Arc<dyn PeerSource>,
    clock: Arc<dyn Clock>,
) -> Result<SchedulerHandle, SchedulerError> {
    config.apply_defaults();

    let listener = TcpListener::bind(config.scheduler.listen_addr).await?;
    let listen_addr = listener.local_addr()?;

    let (sender, receiver) = mpsc::channel(100);
    let (internal_sender, internal_receiver) = mpsc::unbounded_channel();
    let (event_sender, event_receiver) = mpsc::channel(config.conn.event_buffer);

    let handshaker = Handshaker::new(config.conn.clone(), context.clone(), event_sender);
    let connstate = ConnState::new(context.peer_id(), config.connstate.clone(), clock);
    let listener_task = spawn_listener(listener, handshaker.clone(), internal_sender.clone());
    let probe_timeout = config.scheduler.probe_timeout;

    let core = SchedulerCore::new(CoreParts {
        config,
        handshaker,
        connstate,
        archive,
        peer_source,
        internal: internal_sender,
        listener: listener_task,
    });

    tokio::spawn(async move {
        run_actor_loop(core, receiver, internal_receiver, event_receiver).await;
    });

    tracing::info!(
        "Scheduler for {} listening on {}",
        context.peer_id(),
        listen_addr
    );
    Ok(SchedulerHandle::new(sender, listen_addr, probe_timeout))
}

/// Accepts inbound streams and reads their handshakes on separate tasks.
fn spawn_listener(
    listener: TcpListener,
    handshaker: Handshaker,
    internal: mpsc::UnboundedSender<InternalCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some((stream, addr)) = accepted_or_backoff(listener.accept().await).await else {
                continue;
            };

            let handshaker = handshaker.clone();
            let internal = internal.clone();
            tokio::spawn(async move {
                match handshaker.accept(stream).await {
                    Ok(pending) => {
                        let _ = internal.send(InternalCommand::IncomingConn {
                            pending,
                            info: None,
                        });
                    }
                    Err(error) => {
                        tracing::debug!("Inbound handshake from {} failed: {}", addr, error);
                    }
                }
            });
        }
    })
}

async fn accepted_or_backoff<T>(result: io::Result<T>) -> Option<T> {
    match result {
        Ok(accepted) => Some(accepted),
        Err(error) => {
            tracing::warn!("Listener accept failed: {}", error);
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

/// Runs the main actor message processing loop.
///
/// Commands, delegated-task results and conn events are processed one at a
/// time, so the core needs no locking of its own.
async fn run_actor_loop(
    mut core: SchedulerCore,
    mut receiver: mpsc::Receiver<SchedulerCommand>,
    mut internal_receiver: mpsc::UnboundedReceiver<InternalCommand>,
    mut event_receiver: mpsc::Receiver<ConnEvent>,
) {
    tracing::debug!("Scheduler actor started");

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    break;
                };
                if !handle_command(&mut core, command).await {
                    break;
                }
            }
            Some(internal) = internal_receiver.recv() => {
                handle_internal(&mut core, internal).await;
            }
            Some(event) = event_receiver.recv() => {
                core.conn_event(event);
            }
        }
    }

    core.stop().await;
    tracing::debug!("Scheduler actor stopped");
}

/// Handles a single command. Returns true to continue processing, false to
/// shut down.
async fn handle_command(core: &mut SchedulerCore, command: SchedulerCommand) -> bool {
    match command {
        SchedulerCommand::Download {
            name,
            digest,
            responder,
        } => {
            core.download(name, digest, responder);
        }

        SchedulerCommand::Probe { responder } => {
            let _ = responder.send(());
        }

        SchedulerCommand::Reload { config, responder } => {
            core.reload(config);
            let _ = responder.send(());
        }

        SchedulerCommand::RemoveTorrent { digest, responder } => {
            let result = core.remove_torrent(&digest).await;
            let _ = responder.send(result);
        }

        SchedulerCommand::BlacklistSnapshot { responder } => {
            let _ = responder.send(core.blacklist_snapshot());
        }

        SchedulerCommand::TorrentStats { digest, responder } => {
            let _ = responder.send(core.torrent_stats(&digest));
        }

        SchedulerCommand::Stop { responder } => {
            tracing::debug!("Scheduler actor shutting down");
            core.stop().await;
            let _ = responder.send(());
            return false;
        }
    }

    true
}

async fn handle_internal(core: &mut SchedulerCore, command: InternalCommand) {
    match command {
        InternalCommand::DownloadReady {
            info,
            peers,
            responder,
        } => {
            core.start_download(info, peers);
            let _ = responder.send(Ok(()));
        }

        InternalCommand::IncomingConn { pending, info } => {
            core.incoming_conn(pending, info);
        }

        InternalCommand::HandshakeDone {
            peer_id,
            info_hash,
            origin,
            result,
        } => {
            core.handshake_done(peer_id, info_hash, origin, result).await;
        }
    }
}

//! Manager event loop.
//!
//! Flow:
//! 1. Validate identity, spawn the control channel writer
//! 2. Build the dispatch table (restart + ownership handlers)
//! 3. Read envelopes one at a time and dispatch them in arrival order
//! 4. Stop on termination, supervisor hang-up, or the shutdown signal
//! 5. Flush event stats and queued outbound envelopes (bounded), then return

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{DecodeError, EnvelopeCodec};
use crate::bridge::protocol::EventType;
use crate::channel::{ControlChannel, PendingReplies, run_writer};
use crate::config::ManagerConfig;
use crate::dispatch::{DispatchTable, EventHandler};
use crate::rebroadcast::Rebroadcaster;
use crate::reconcile::RestartHandler;
use crate::resources::{OwnershipHandler, ResourceRegistry};
use crate::state::{KillReason, WorkerState};
use crate::stats::EventStats;

/// Why the event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Reconciliation decided this manager must restart.
    Terminated { reason: KillReason },
    /// The supervisor closed the control channel, or it failed at the framing level.
    ChannelClosed,
    /// The external shutdown signal fired.
    Signal,
}

impl Shutdown {
    /// Process exit status: non-zero asks the host process manager for a restart.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Terminated { .. } => 1,
            Self::ChannelClosed | Self::Signal => 0,
        }
    }
}

/// Build the startup dispatch table.
pub fn dispatch_table(
    config: &ManagerConfig,
    channel: &ControlChannel,
    resources: Arc<ResourceRegistry>,
    replies: PendingReplies,
) -> DispatchTable {
    let rebroadcaster = Rebroadcaster::new(channel.clone(), resources.clone(), config.ready.clone());
    let restart: Arc<dyn EventHandler> = Arc::new(RestartHandler::new(rebroadcaster));
    let ownership: Arc<dyn EventHandler> = Arc::new(OwnershipHandler::new(resources));

    DispatchTable::new(replies)
        .with_handler(EventType::RestartClient, restart)
        .with_handler(EventType::GuildCreate, Arc::clone(&ownership))
        .with_handler(EventType::GuildDelete, ownership)
}

/// Run the manager until it terminates, the channel closes, or `shutdown` resolves.
pub async fn run_manager<R, W, F>(
    reader: R,
    writer: W,
    config: &ManagerConfig,
    resources: Arc<ResourceRegistry>,
    shutdown: F,
) -> io::Result<Shutdown>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    run_manager_with(reader, writer, config, resources, shutdown, |_, table| table).await
}

/// Like [`run_manager`], letting the caller extend the dispatch table.
///
/// `extend` sees the live [`ControlChannel`] and may keep a clone of it to
/// issue [`ControlChannel::request`]s from its own tasks. Replies to those
/// requests are resolved by this loop. Handlers installed here replace the
/// built-in ones for the same tag.
pub async fn run_manager_with<R, W, F, E>(
    reader: R,
    writer: W,
    config: &ManagerConfig,
    resources: Arc<ResourceRegistry>,
    shutdown: F,
    extend: E,
) -> io::Result<Shutdown>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
    E: FnOnce(&ControlChannel, DispatchTable) -> DispatchTable,
{
    let identity = config
        .identity()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    tracing::info!(
        cluster_id = identity.cluster_id(),
        shard_count = identity.shard_count(),
        shards = ?identity.shards(),
        "Manager starting"
    );
    let mut state = WorkerState::new(identity);

    let replies = PendingReplies::new();
    let (channel, outbound_rx) = ControlChannel::new(replies.clone());
    let writer_task = tokio::spawn(run_writer(
        outbound_rx,
        FramedWrite::new(writer, EnvelopeCodec::new()),
    ));

    let stats = load_stats(config);
    let table = extend(
        &channel,
        dispatch_table(config, &channel, Arc::clone(&resources), replies),
    );
    drop(channel);

    let mut ctrl_reader = FramedRead::new(reader, EnvelopeCodec::new());
    // interval() panics on a zero period
    let period = config.stats_flush_interval.max(Duration::from_millis(1));
    let mut flush = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                tracing::info!("Shutdown requested");
                break Shutdown::Signal;
            }

            frame = ctrl_reader.next() => {
                match frame {
                    Some(Ok(Ok(envelope))) => {
                        stats.record(envelope.kind.as_str());
                        table.dispatch(&mut state, envelope).await;
                        if let Some(reason) = state.termination_reason() {
                            break Shutdown::Terminated { reason };
                        }
                    }
                    Some(Ok(Err(DecodeError::UnknownType(tag)))) => {
                        stats.record(&tag);
                        tracing::debug!(%tag, "Dropping envelope with unknown type");
                    }
                    Some(Ok(Err(e))) => {
                        tracing::warn!(error = %e, "Discarding undecodable envelope");
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Control channel error");
                        break Shutdown::ChannelClosed;
                    }
                    None => {
                        tracing::warn!("Control channel closed (supervisor gone?)");
                        break Shutdown::ChannelClosed;
                    }
                }
            }

            _ = flush.tick(), if config.stats_path.is_some() => {
                save_stats(config, &stats);
            }
        }
    };

    save_stats(config, &stats);

    // Handlers hold the remaining senders; dropping them lets the writer drain and exit.
    drop(table);
    drain_writer(writer_task, config.writer_drain_timeout).await;

    if let Shutdown::Terminated { reason } = outcome {
        resources.clear();
        tracing::warn!(%reason, "Manager exiting for restart");
    } else {
        tracing::info!(?outcome, "Manager exiting");
    }
    Ok(outcome)
}

async fn drain_writer(mut writer_task: JoinHandle<()>, limit: Duration) {
    match tokio::time::timeout(limit, &mut writer_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Control channel writer panicked"),
        Err(_) => {
            tracing::warn!(
                timeout_ms = limit.as_millis() as u64,
                "Outbound queue did not drain (supervisor not reading?), dropping it"
            );
            writer_task.abort();
        }
    }
}

fn load_stats(config: &ManagerConfig) -> EventStats {
    let Some(path) = &config.stats_path else {
        return EventStats::new();
    };
    match EventStats::load(path) {
        Ok(stats) => stats,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to load event stats, starting fresh");
            EventStats::new()
        }
    }
}

fn save_stats(config: &ManagerConfig, stats: &EventStats) {
    if let Some(path) = &config.stats_path
        && let Err(e) = stats.save(path)
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to save event stats");
    }
}

//! Engine lifecycle: start/stop/reconnect orchestration.
//!
//! A tokio control task owns the tunnel fd, the pump thread and the block
//! log, reacts to control commands and pump events, and publishes state
//! transitions. Both file descriptors are released on every exit path
//! before `Stopped` is published.

use crate::blocklog::{self, BlockLog};
use crate::config::Config;
use crate::error::EngineError;
use crate::pump::{PumpConfig, PumpEvent, PumpHandle};
use crate::rules::RuleTable;
use crate::status::{EngineState, Status, StatusReporter};
use crate::tun::{TunBuilder, TunOptions};
use crate::upstream::{Resolver, UpstreamPool};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

const CONTROL_QUEUE_DEPTH: usize = 16;
const CONTROL_OFFER_TIMEOUT: Duration = Duration::from_secs(1);
const PUMP_JOIN_DEADLINE: Duration = Duration::from_secs(2);
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Control commands, processed strictly in arrival order.
#[derive(Debug)]
pub enum Command {
    Stop,
    /// The default underlying network went away.
    NetworkLost,
    /// A default underlying network is available (again).
    NetworkAvailable { device: Option<String> },
}

pub struct EngineOptions {
    pub config: Config,
    pub rules: Arc<RuleTable>,
    pub tun: Box<dyn TunBuilder>,
    /// Underlying link the upstream socket is bound to, when known.
    pub upstream_device: Option<String>,
    /// Resolvers inherited from the OS; used when the configured list is
    /// empty or fully disabled.
    pub system_resolvers: Vec<Resolver>,
    /// Persistence path for the block log, when block logging is on.
    pub block_log_path: Option<PathBuf>,
}

/// Handle to a running engine. Dropping it stops the engine.
pub struct Engine {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<Status>,
    task: tokio::task::JoinHandle<()>,
}

impl Engine {
    /// Validate the configuration and spawn the control task. Must be
    /// called from within a tokio runtime. An invalid configuration is
    /// refused here; no tunnel fd is created for it.
    pub fn start(options: EngineOptions) -> Result<Engine, EngineError> {
        options.config.validate()?;
        let resolvers = effective_resolvers(&options)?;

        let (reporter, status) = StatusReporter::new();
        let (commands, cmd_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        let task = tokio::spawn(run(options, resolvers, reporter, cmd_rx));
        Ok(Engine {
            commands,
            status,
            task,
        })
    }

    pub fn status(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    /// Offer a control command. The queue is bounded; a command that cannot
    /// be enqueued within the offer timeout is dropped with a warning.
    pub async fn command(&self, command: Command) {
        if let Err(e) = self
            .commands
            .send_timeout(command, CONTROL_OFFER_TIMEOUT)
            .await
        {
            tracing::warn!(error = %e, "control command dropped");
        }
    }

    /// Stop the engine and wait for `Stopped`.
    pub async fn stop(self) {
        self.command(Command::Stop).await;
        let mut status = self.status.clone();
        let _ = status
            .wait_for(|s| s.state == EngineState::Stopped)
            .await;
        let _ = self.task.await;
    }
}

fn effective_resolvers(options: &EngineOptions) -> Result<Vec<Resolver>, EngineError> {
    let configured = options.config.enabled_resolvers();
    let resolvers = if configured.is_empty() {
        options.system_resolvers.clone()
    } else {
        configured
    };
    if resolvers.is_empty() {
        return Err(EngineError::Config(
            "no upstream resolvers configured and none inherited from the system".into(),
        ));
    }
    Ok(resolvers)
}

struct Runtime {
    config: Config,
    rules: Arc<RuleTable>,
    tun_fd: OwnedFd,
    block_log: Option<Arc<Mutex<BlockLog>>>,
    block_log_path: Option<PathBuf>,
    resolvers: Vec<Resolver>,
    upstream_device: Option<String>,
    pump: Option<PumpHandle>,
    events: mpsc::UnboundedReceiver<PumpEvent>,
    // Keeps the events channel open between pumps so recv never spins on a
    // closed channel.
    _events_keepalive: mpsc::UnboundedSender<PumpEvent>,
    backoff: Duration,
}

impl Runtime {
    fn spawn_pump(&mut self) -> Result<(), EngineError> {
        let pool = UpstreamPool::new(self.resolvers.clone(), self.upstream_device.as_deref())?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PumpHandle::spawn(
            PumpConfig {
                tun_fd: self.tun_fd.as_raw_fd(),
                pool,
                rules: self.rules.clone(),
                block_log: self.block_log.clone(),
                ipv6_enabled: self.config.ipv6_enabled,
            },
            tx.clone(),
        )?;
        self._events_keepalive = tx;
        self.events = rx;
        self.pump = Some(handle);
        Ok(())
    }

    /// Stop the pump thread and join it with a deadline. Returns false on
    /// the last-resort abandonment path.
    async fn stop_pump(&mut self) -> bool {
        let Some(handle) = self.pump.take() else {
            return true;
        };
        let joined = tokio::task::spawn_blocking(move || handle.join_timeout(PUMP_JOIN_DEADLINE))
            .await
            .unwrap_or(false);
        if !joined {
            tracing::error!("pump thread did not stop within deadline, abandoning it");
        }
        joined
    }

    fn persist_block_log(&self, reporter: &StatusReporter) {
        let (Some(log), Some(path)) = (&self.block_log, &self.block_log_path) else {
            return;
        };
        let result = match log.lock() {
            Ok(log) => log.save(path),
            Err(_) => return,
        };
        if let Err(e) = result {
            reporter.warn(format!("block log persistence failed: {e}"));
        } else {
            tracing::debug!(path = %path.display(), "block log persisted");
        }
    }
}

async fn run(
    mut options: EngineOptions,
    resolvers: Vec<Resolver>,
    reporter: StatusReporter,
    mut commands: mpsc::Receiver<Command>,
) {
    reporter.publish(EngineState::Starting);

    let tun_options = TunOptions::new(
        options.config.ipv6_enabled,
        options.config.app_inclusion.clone(),
    );
    let tun_fd = match options.tun.establish(&tun_options) {
        Ok(fd) => fd,
        Err(e) => {
            tracing::error!(error = %e, "tunnel establishment failed");
            reporter.publish_with_detail(EngineState::Stopped, e.to_string());
            return;
        }
    };

    let block_log = if options.config.block_logging {
        let log = match &options.block_log_path {
            Some(path) => BlockLog::load(path, blocklog::DEFAULT_CAPACITY).unwrap_or_else(|e| {
                reporter.warn(format!("block log load failed: {e}"));
                BlockLog::new(blocklog::DEFAULT_CAPACITY)
            }),
            None => BlockLog::new(blocklog::DEFAULT_CAPACITY),
        };
        Some(Arc::new(Mutex::new(log)))
    } else {
        None
    };

    let (_events_keepalive, events) = mpsc::unbounded_channel();
    let mut rt = Runtime {
        config: options.config,
        rules: options.rules,
        tun_fd,
        block_log,
        block_log_path: options.block_log_path,
        resolvers,
        upstream_device: options.upstream_device,
        pump: None,
        events,
        _events_keepalive,
        backoff: BACKOFF_INITIAL,
    };

    let mut stop_reason: Option<String> = None;

    if let Err(e) = rt.spawn_pump() {
        stop_reason = Some(e.to_string());
    }

    // Deadline for the next reconnect attempt while backing off.
    let mut reconnect_at: Option<Instant> = None;

    while stop_reason.is_none() {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                // A closed command channel means the handle is gone.
                Some(Command::Stop) | None => break,
                Some(Command::NetworkLost) => {
                    reconnect_at = None;
                    if !rt.stop_pump().await {
                        stop_reason = Some("pump thread wedged on network loss".into());
                        break;
                    }
                    // The tunnel fd stays open: apps simply see no DNS
                    // connectivity until the network returns.
                    reporter.publish(EngineState::WaitingForNetwork);
                }
                Some(Command::NetworkAvailable { device }) => {
                    rt.upstream_device = device;
                    if rt.pump.is_none() {
                        reconnect_at = None;
                        reporter.publish(EngineState::Reconnecting);
                        if let Err(e) = rt.spawn_pump() {
                            // The network claims to be back but the socket
                            // could not be set up; retry with backoff.
                            tracing::warn!(error = %e, "reconnect failed");
                            reporter.publish(EngineState::ReconnectingNetworkError);
                            reconnect_at = Some(Instant::now() + rt.backoff);
                            rt.backoff = (rt.backoff * 2).min(BACKOFF_CAP);
                        }
                    }
                }
            },
            ev = rt.events.recv() => match ev {
                Some(PumpEvent::Started) => {
                    if reporter.current() == EngineState::Starting {
                        reporter.publish(EngineState::Running);
                    }
                }
                Some(PumpEvent::UpstreamHealthy) => {
                    rt.backoff = BACKOFF_INITIAL;
                    if matches!(
                        reporter.current(),
                        EngineState::Reconnecting | EngineState::ReconnectingNetworkError
                    ) {
                        reporter.publish(EngineState::Running);
                    }
                }
                Some(PumpEvent::RoundTrip) => {
                    rt.backoff = BACKOFF_INITIAL;
                }
                Some(PumpEvent::NetworkError) => {
                    reporter.publish(EngineState::ReconnectingNetworkError);
                    if !rt.stop_pump().await {
                        stop_reason = Some("pump thread wedged after network error".into());
                        break;
                    }
                    let delay = rt.backoff;
                    rt.backoff = (rt.backoff * 2).min(BACKOFF_CAP);
                    tracing::info!(?delay, "backing off before reconnect");
                    reconnect_at = Some(Instant::now() + delay);
                }
                Some(PumpEvent::FatalTunnel(reason)) => {
                    stop_reason = Some(reason);
                }
                // Keepalive sender prevents this.
                None => {
                    stop_reason = Some("pump event channel closed".into());
                }
            },
            _ = sleep_until_opt(reconnect_at) => {
                reconnect_at = None;
                if !rt.stop_pump().await {
                    stop_reason = Some("pump thread wedged before reconnect".into());
                    break;
                }
                if let Err(e) = rt.spawn_pump() {
                    tracing::warn!(error = %e, "reconnect failed");
                    reconnect_at = Some(Instant::now() + rt.backoff);
                    rt.backoff = (rt.backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }

    reporter.publish(EngineState::Stopping);
    rt.stop_pump().await;
    rt.persist_block_log(&reporter);
    // Dropping the runtime releases the tunnel fd; the upstream socket died
    // with the pump thread.
    drop(rt);
    match stop_reason {
        Some(reason) => reporter.publish_with_detail(EngineState::Stopped, reason),
        None => reporter.publish(EngineState::Stopped),
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

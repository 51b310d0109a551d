//! Engine state publication: a last-value broadcast channel.
//!
//! Subscribers observe the current value at subscription time and every
//! change thereafter; a slow subscriber may coalesce intermediate values
//! but always sees the latest.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    WaitingForNetwork,
    Reconnecting,
    ReconnectingNetworkError,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Starting => write!(f, "starting"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopping => write!(f, "stopping"),
            EngineState::WaitingForNetwork => write!(f, "waiting-for-network"),
            EngineState::Reconnecting => write!(f, "reconnecting"),
            EngineState::ReconnectingNetworkError => write!(f, "reconnecting-network-error"),
        }
    }
}

/// State plus an optional human-readable detail: the stop reason on a fatal
/// path, or a non-fatal warning (block-log persistence failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: EngineState,
    pub detail: Option<String>,
}

impl Status {
    fn new(state: EngineState) -> Self {
        Self {
            state,
            detail: None,
        }
    }
}

pub struct StatusReporter {
    tx: watch::Sender<Status>,
}

impl StatusReporter {
    pub fn new() -> (Self, watch::Receiver<Status>) {
        let (tx, rx) = watch::channel(Status::new(EngineState::Stopped));
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> EngineState {
        self.tx.borrow().state
    }

    pub fn publish(&self, state: EngineState) {
        tracing::debug!(%state, "engine state");
        self.tx.send_replace(Status::new(state));
    }

    pub fn publish_with_detail(&self, state: EngineState, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::debug!(%state, %detail, "engine state");
        self.tx.send_replace(Status {
            state,
            detail: Some(detail),
        });
    }

    /// Attach a warning to the current state without changing it.
    pub fn warn(&self, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(%detail, "engine warning");
        self.tx.send_modify(|status| status.detail = Some(detail));
    }
}

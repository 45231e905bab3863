//! Tunnel lifecycle: states, session snapshots, and the transport seam.
//!
//! The controller in [`controller`] owns a single [`TunnelSession`] and is the
//! only writer to it. The actual tunnel mechanism (packet capture, routing,
//! whatever the platform provides) sits behind [`TunnelTransport`], which the
//! embedder implements.

pub mod controller;

pub use controller::TunnelController;

use serde::Serialize;

/// Operational state of the tunnel session.
///
/// `New → Starting → Active ⇄ Paused`; `Reconnecting` is the transient
/// sub-state of `Active` entered when the underlying network set goes empty.
/// `Stopped` and `Failed` are terminal: a new session is required to restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunnelState {
    New,
    Starting,
    Active,
    Reconnecting,
    Paused,
    Failed,
    Stopped,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Failed | TunnelState::Stopped)
    }
}

/// Singleton state value for one run of the tunnel, from start to
/// stop/failure. Mutated only by the controller; everyone else observes
/// snapshots through the watch channel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSession {
    pub state: TunnelState,
    pub paused_at_ms: Option<i64>,
    pub resumed_at_ms: Option<i64>,
}

impl TunnelSession {
    pub fn new() -> Self {
        Self {
            state: TunnelState::New,
            paused_at_ms: None,
            resumed_at_ms: None,
        }
    }
}

impl Default for TunnelSession {
    fn default() -> Self {
        Self::new()
    }
}

/// The underlying tunnel mechanism. `establish` is called from STARTING and
/// again for each reconnect attempt; `teardown` on stop. Implementations do
/// not need to be cancel-safe beyond dropping the establish future when the
/// controller's timeout expires.
#[allow(async_fn_in_trait)]
pub trait TunnelTransport {
    async fn establish(&mut self) -> anyhow::Result<()>;
    async fn teardown(&mut self);
}

//! Single-writer controller for the tunnel state machine.
//!
//! All transition requests go through one async mutex, so concurrent calls
//! serialize and the loser of a race observes `InvalidTransition` rather
//! than corrupted state. Observers subscribe to a watch channel of session
//! snapshots and re-read current state on every notification; delivery is
//! at-least-once. Hot-path state reads (`state()`) are lock-free against the
//! last published snapshot.

use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::tunnel::{TunnelSession, TunnelState, TunnelTransport};

struct Inner<T> {
    session: TunnelSession,
    transport: T,
}

/// Owner of the [`TunnelSession`] singleton. Consumes user actions
/// (`start`/`pause`/`resume`/`stop`) and OS network-change notifications,
/// and gates whether the rule engine is consulted at all.
pub struct TunnelController<T: TunnelTransport> {
    inner: Mutex<Inner<T>>,
    state_tx: watch::Sender<TunnelSession>,
    start_timeout: Duration,
    reconnect_max_retries: u32,
    reconnect_backoff: Duration,
}

impl<T: TunnelTransport> TunnelController<T> {
    pub fn new(transport: T, config: &CoreConfig) -> Self {
        let session = TunnelSession::new();
        let (state_tx, _) = watch::channel(session.clone());
        Self {
            inner: Mutex::new(Inner { session, transport }),
            state_tx,
            start_timeout: config.start_timeout,
            // At least one retry is mandatory.
            reconnect_max_retries: config.reconnect_max_retries.max(1),
            reconnect_backoff: config.reconnect_backoff,
        }
    }

    /// Subscribe to session-state change notifications. Receivers should
    /// re-read [`session`](Self::session) rather than trusting a payload to
    /// stay current.
    pub fn subscribe(&self) -> watch::Receiver<TunnelSession> {
        self.state_tx.subscribe()
    }

    /// Last published session snapshot. Lock-free.
    pub fn session(&self) -> TunnelSession {
        self.state_tx.borrow().clone()
    }

    /// Last published state. Lock-free; used on the per-connection hot path.
    pub fn state(&self) -> TunnelState {
        self.state_tx.borrow().state
    }

    fn publish(&self, inner: &mut Inner<T>, state: TunnelState) {
        inner.session.state = state;
        self.state_tx.send_replace(inner.session.clone());
    }

    /// `NEW → STARTING → ACTIVE`, or `FAILED` if establishment errors or the
    /// timeout expires. Not retried internally; the failure is surfaced and
    /// the caller decides.
    pub async fn start(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.session.state != TunnelState::New {
            return Err(CoreError::InvalidTransition {
                from: inner.session.state,
                op: "start",
            });
        }
        self.publish(&mut inner, TunnelState::Starting);
        tracing::info!("Tunnel starting");

        match tokio::time::timeout(self.start_timeout, inner.transport.establish()).await {
            Ok(Ok(())) => {
                self.publish(&mut inner, TunnelState::Active);
                tracing::info!("Tunnel active");
                Ok(())
            }
            Ok(Err(e)) => {
                self.publish(&mut inner, TunnelState::Failed);
                tracing::error!("Tunnel establishment failed: {e:#}");
                Err(CoreError::TunnelStartFailed(e.to_string()))
            }
            Err(_) => {
                self.publish(&mut inner, TunnelState::Failed);
                tracing::error!(
                    "Tunnel establishment timed out after {:?}",
                    self.start_timeout
                );
                Err(CoreError::TunnelStartFailed(format!(
                    "establishment timed out after {:?}",
                    self.start_timeout
                )))
            }
        }
    }

    /// `ACTIVE → PAUSED`. While paused, every connection attempt is
    /// short-circuited to BLOCK without consulting the rule store.
    pub async fn pause(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.session.state != TunnelState::Active {
            return Err(CoreError::InvalidTransition {
                from: inner.session.state,
                op: "pause",
            });
        }
        inner.session.paused_at_ms = Some(crate::db::epoch_ms());
        self.publish(&mut inner, TunnelState::Paused);
        tracing::info!("Tunnel paused");
        Ok(())
    }

    /// `PAUSED → ACTIVE`.
    pub async fn resume(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.session.state != TunnelState::Paused {
            return Err(CoreError::InvalidTransition {
                from: inner.session.state,
                op: "resume",
            });
        }
        inner.session.resumed_at_ms = Some(crate::db::epoch_ms());
        self.publish(&mut inner, TunnelState::Active);
        tracing::info!("Tunnel resumed");
        Ok(())
    }

    /// Any non-terminal state → `STOPPED` (terminal). A second call returns
    /// `InvalidTransition` and the state stays `STOPPED`.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if inner.session.state.is_terminal() {
            return Err(CoreError::InvalidTransition {
                from: inner.session.state,
                op: "stop",
            });
        }
        inner.transport.teardown().await;
        self.publish(&mut inner, TunnelState::Stopped);
        tracing::info!("Tunnel stopped");
        Ok(())
    }

    /// OS network-set change. Losing the last network while ACTIVE enters the
    /// `Reconnecting` sub-state and re-establishes with exponential backoff:
    /// back to ACTIVE on success, terminal FAILED once retries are exhausted.
    /// Notifications in any other state are ignored.
    pub async fn network_changed(&self, available: bool) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().await;
        if available || inner.session.state != TunnelState::Active {
            tracing::debug!(
                "Ignoring network change (available={available}) while {:?}",
                inner.session.state
            );
            return Ok(());
        }

        self.publish(&mut inner, TunnelState::Reconnecting);
        tracing::warn!("Underlying network set empty, reconnecting");

        let mut backoff = self.reconnect_backoff;
        let attempts = 1 + self.reconnect_max_retries;
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.start_timeout, inner.transport.establish()).await {
                Ok(Ok(())) => {
                    self.publish(&mut inner, TunnelState::Active);
                    tracing::info!("Tunnel re-established on attempt {attempt}");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::warn!("Reconnect attempt {attempt}/{attempts} failed: {e:#}");
                }
                Err(_) => {
                    tracing::warn!("Reconnect attempt {attempt}/{attempts} timed out");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        self.publish(&mut inner, TunnelState::Failed);
        tracing::error!("Reconnect retries exhausted, tunnel failed");
        Err(CoreError::TunnelStartFailed(
            "reconnect retries exhausted".into(),
        ))
    }
}

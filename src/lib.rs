//! Per-app/per-destination firewall decision core bound to the lifecycle of
//! a local VPN tunnel.
//!
//! Components:
//! - [`rules`] — durable rule store with a copy-on-write lookup snapshot
//! - [`engine`] — pure allow/block verdict function
//! - [`tunnel`] — single-writer tunnel lifecycle state machine
//! - [`aggregator`] — per-destination connection accounting
//! - [`services`] — background flush and prune loops
//!
//! [`FirewallCore`] wires them together: a connection-attempt event reaches
//! the rule engine only while the tunnel is ACTIVE; while PAUSED (or not
//! running) it is short-circuited to BLOCK, and every event is forwarded to
//! the aggregator for bookkeeping either way.

pub mod aggregator;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod rules;
pub mod services;
pub mod tunnel;

use std::sync::{Arc, RwLock};

use tokio::sync::watch;

pub use aggregator::{ConnectionAggregator, ConnectionRecord};
pub use config::CoreConfig;
pub use db::Database;
pub use engine::{ConnectionAttempt, FirewallMode, Verdict};
pub use error::CoreError;
pub use rules::{RuleStatus, RuleStore, Subject, Target};
pub use tunnel::{TunnelController, TunnelSession, TunnelState, TunnelTransport};

/// The assembled decision/state core: rule store, engine, tunnel controller,
/// and aggregator behind one facade.
///
/// Created once per tunnel run. `bring_up` loads rules before any event is
/// accepted; `shut_down` stops the tunnel, flushes, and unloads.
pub struct FirewallCore<T: TunnelTransport> {
    config: CoreConfig,
    mode: RwLock<FirewallMode>,
    rules: Arc<RuleStore>,
    aggregator: Arc<ConnectionAggregator>,
    tunnel: TunnelController<T>,
    tasks: std::sync::Mutex<Option<services::BackgroundTasks>>,
}

impl<T: TunnelTransport> FirewallCore<T> {
    pub fn new(db: Arc<Database>, transport: T, config: CoreConfig) -> Self {
        Self {
            rules: Arc::new(RuleStore::new(Arc::clone(&db))),
            aggregator: Arc::new(ConnectionAggregator::new(db)),
            tunnel: TunnelController::new(transport, &config),
            mode: RwLock::new(FirewallMode::Custom),
            tasks: std::sync::Mutex::new(None),
            config,
        }
    }

    /// Load rules, sweep stale connection rows, warm-start the aggregator,
    /// start the maintenance loops, then bring the tunnel up.
    ///
    /// An unreadable rule store is not fatal: the core runs with no rules
    /// known and the configured default policy (fail-open unless the caller
    /// configured otherwise). Tunnel start failures are surfaced.
    pub async fn bring_up(&self) -> Result<(), CoreError> {
        if let Err(e) = self.rules.load() {
            tracing::warn!(
                "Rule store unavailable, continuing with no rules (default allow_unclassified={}): {e}",
                self.config.allow_unclassified
            );
        }
        // Sweep rows past the retention window before they are warm-started
        // back into memory.
        if let Err(e) = self.aggregator.prune(self.config.retention) {
            tracing::warn!("Startup connection prune failed: {e:#}");
        }
        if let Err(e) = self.aggregator.warm_start() {
            tracing::warn!("Connection warm-start failed, starting empty: {e:#}");
        }
        *self.tasks.lock().unwrap() = Some(services::BackgroundTasks::start(
            Arc::clone(&self.aggregator),
            &self.config,
        ));

        self.tunnel.start().await
    }

    /// Stop the tunnel, halt maintenance, flush what is pending, and drop the
    /// in-memory rule snapshot.
    pub async fn shut_down(&self) -> Result<(), CoreError> {
        let result = self.tunnel.stop().await;
        if let Some(mut tasks) = self.tasks.lock().unwrap().take() {
            tasks.shutdown();
        }
        if let Err(e) = self.aggregator.flush() {
            tracing::warn!("Final connection flush failed: {e:#}");
        }
        self.rules.unload_all();
        result
    }

    /// Classify one connection attempt and account for it.
    ///
    /// ACTIVE: consult the engine against the current rule snapshot.
    /// PAUSED: fail closed without consulting the rule store. Any other
    /// state means the tunnel is not carrying traffic; also fail closed.
    pub fn handle_attempt(&self, event: &ConnectionAttempt) -> Verdict {
        let verdict = match self.tunnel.state() {
            TunnelState::Active => engine::decide(
                event,
                self.mode(),
                &self.rules.snapshot(),
                self.config.allow_unclassified,
            ),
            _ => Verdict::Block,
        };
        self.aggregator.record(event, verdict);
        verdict
    }

    pub fn mode(&self) -> FirewallMode {
        *self.mode.read().unwrap()
    }

    pub fn set_mode(&self, mode: FirewallMode) {
        *self.mode.write().unwrap() = mode;
        tracing::info!("Firewall mode set to {mode:?}");
    }

    /// Rule store handle for the presentation layer (detail sheets, rule
    /// toggles).
    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Aggregator handle for the presentation layer (connections list).
    pub fn connections(&self) -> &ConnectionAggregator {
        &self.aggregator
    }

    pub fn tunnel(&self) -> &TunnelController<T> {
        &self.tunnel
    }

    /// Session-state change notifications for UI observers.
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelSession> {
        self.tunnel.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testutil::ScriptedTransport;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "tunnelfw=debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    fn core() -> FirewallCore<ScriptedTransport> {
        init_tracing();
        let db = Arc::new(Database::open_in_memory().unwrap());
        FirewallCore::new(db, ScriptedTransport::ok(), CoreConfig::default())
    }

    fn attempt(subject: i64, target: &str) -> ConnectionAttempt {
        ConnectionAttempt::new(Subject(subject), Target::parse(target).unwrap())
    }

    #[tokio::test]
    async fn test_events_blocked_until_tunnel_active() {
        let core = core();
        assert_eq!(core.handle_attempt(&attempt(1, "example.com")), Verdict::Block);

        core.bring_up().await.unwrap();
        assert_eq!(core.handle_attempt(&attempt(1, "example.com")), Verdict::Allow);
    }

    #[tokio::test]
    async fn test_custom_mode_scenario_uid_1010() {
        let core = core();
        core.bring_up().await.unwrap();

        // No rules loaded: configured default (fail open) applies.
        let ev = attempt(1010, "93.184.216.34");
        assert_eq!(core.handle_attempt(&ev), Verdict::Allow);

        core.rules()
            .set_rule(
                Subject(1010),
                &Target::parse("93.184.216.34").unwrap(),
                RuleStatus::Block,
            )
            .unwrap();
        assert_eq!(core.handle_attempt(&ev), Verdict::Block);
    }

    #[tokio::test]
    async fn test_pause_blocks_despite_trust_and_resume_restores() {
        let core = core();
        core.bring_up().await.unwrap();

        let t = Target::parse("trusted.example.com").unwrap();
        core.rules()
            .set_rule(Subject(7), &t, RuleStatus::Trust)
            .unwrap();
        let ev = attempt(7, "trusted.example.com");
        assert_eq!(core.handle_attempt(&ev), Verdict::Allow);

        core.tunnel().pause().await.unwrap();
        assert_eq!(core.handle_attempt(&ev), Verdict::Block);

        core.tunnel().resume().await.unwrap();
        assert_eq!(core.handle_attempt(&ev), Verdict::Allow);
    }

    #[tokio::test]
    async fn test_five_attempts_aggregate_to_one_record() {
        let core = core();
        core.bring_up().await.unwrap();

        for _ in 0..5 {
            core.handle_attempt(&attempt(2002, "example.com"));
        }

        let records = core.connections().snapshot_for(Subject(2002));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 5);
    }

    #[tokio::test]
    async fn test_mode_switch_changes_verdicts() {
        let core = core();
        core.bring_up().await.unwrap();

        let t = Target::parse("10.1.2.3").unwrap();
        core.rules()
            .set_rule(Subject(1), &t, RuleStatus::Trust)
            .unwrap();

        core.set_mode(FirewallMode::BlockAll);
        // Trust overrides the global block; everything else drops.
        assert_eq!(core.handle_attempt(&attempt(1, "10.1.2.3")), Verdict::Allow);
        assert_eq!(core.handle_attempt(&attempt(1, "10.9.9.9")), Verdict::Block);

        core.set_mode(FirewallMode::AllowAll);
        assert_eq!(core.handle_attempt(&attempt(1, "10.9.9.9")), Verdict::Allow);
    }

    #[tokio::test]
    async fn test_bring_up_prunes_stale_connection_rows() {
        init_tracing();
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.upsert_connection_batch(&[
            ConnectionRecord {
                subject: 1,
                target: "stale.example.com".into(),
                count: 9,
                last_seen_ms: 1000,
                hostname: None,
                tag: None,
            },
            ConnectionRecord {
                subject: 1,
                target: "fresh.example.com".into(),
                count: 2,
                last_seen_ms: db::epoch_ms(),
                hostname: None,
                tag: None,
            },
        ])
        .unwrap();

        let core = FirewallCore::new(
            Arc::clone(&db),
            ScriptedTransport::ok(),
            CoreConfig::default(),
        );
        core.bring_up().await.unwrap();

        // The row past the retention window is gone from storage and never
        // warm-started; the recent one survives.
        let records = core.connections().snapshot_for(Subject(1));
        let targets: Vec<&str> = records.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["fresh.example.com"]);
        let persisted = db.load_connections().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].target, "fresh.example.com");
    }

    #[tokio::test]
    async fn test_fail_open_when_rule_store_unavailable() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.break_rules_table();
        let core = FirewallCore::new(db, ScriptedTransport::ok(), CoreConfig::default());

        // bring_up continues past the load failure; with the default config
        // the core runs with no rules known and fails open.
        core.bring_up().await.unwrap();
        assert_eq!(core.handle_attempt(&attempt(1, "example.com")), Verdict::Allow);
    }

    #[tokio::test]
    async fn test_fail_closed_when_configured_strict() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let config = CoreConfig {
            allow_unclassified: false,
            ..CoreConfig::default()
        };
        let core = FirewallCore::new(db, ScriptedTransport::ok(), config);
        core.bring_up().await.unwrap();

        assert_eq!(core.handle_attempt(&attempt(1, "example.com")), Verdict::Block);
    }

    #[tokio::test]
    async fn test_shut_down_unloads_rules_and_blocks_traffic() {
        let core = core();
        core.bring_up().await.unwrap();
        core.rules()
            .set_rule(Subject(1), &Target::parse("example.com").unwrap(), RuleStatus::Trust)
            .unwrap();

        core.shut_down().await.unwrap();
        assert_eq!(core.tunnel().state(), TunnelState::Stopped);
        assert_eq!(core.handle_attempt(&attempt(1, "example.com")), Verdict::Block);
        assert!(core.rules().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_paused_observer_notification() {
        let core = core();
        core.bring_up().await.unwrap();
        let mut rx = core.subscribe_state();

        core.tunnel().pause().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state, TunnelState::Paused);
    }
}

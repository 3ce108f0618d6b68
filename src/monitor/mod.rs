//! Monitor loop: a cooperative single-threaded tick loop that inventories
//! sockets, evaluates them against the Rule Engine's cache, logs blocked
//! attempts, and re-asserts kernel state: snapshot -> diff active-app set
//! -> evaluate each connection -> log + re-assert on deny, structured-log
//! on allow -> periodic domain refresh. Runs on a plain OS thread, no
//! async runtime.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    attributor::{ConnectionRecord, Protocol, ProcessAttributor},
    engine::{Decision, RuleEngine},
};

/// Per-app activity counters (`connections`, `blocked_attempts`,
/// `unique_destinations`, `first_seen`), queryable over IPC (`Stats`)
/// rather than only surfaced as log lines.
#[derive(Debug, Clone, Default)]
pub struct AppActivityStats {
    pub connections: u64,
    pub blocked_attempts: u64,
    pub unique_destinations: HashSet<std::net::IpAddr>,
    pub first_seen: Option<Instant>,
}

#[derive(Default)]
struct MonitorState {
    active_apps: HashSet<String>,
    stats: HashMap<String, AppActivityStats>,
}

pub struct MonitorConfig {
    pub tick_period: Duration,
    pub domain_refresh_every_ticks: u32,
}

/// Owns only a shared `Arc<RuleEngine>` handle and the Attributor -- no
/// back-pointer into the L7 Proxy or vice versa.
pub struct MonitorLoop {
    engine: Arc<RuleEngine>,
    attributor: Box<dyn ProcessAttributor>,
    cancel: Arc<AtomicBool>,
    config: MonitorConfig,
    state: std::sync::Mutex<MonitorState>,
}

impl MonitorLoop {
    #[must_use]
    pub fn new(engine: Arc<RuleEngine>, attributor: Box<dyn ProcessAttributor>, config: MonitorConfig) -> Self {
        Self {
            engine,
            attributor,
            cancel: Arc::new(AtomicBool::new(false)),
            config,
            state: std::sync::Mutex::new(MonitorState::default()),
        }
    }

    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Spawns the tick loop on a dedicated OS thread. Cancellable by the
    /// shared flag from [`MonitorLoop::cancel_handle`]; on cancel the loop
    /// returns without touching the Enforcer's state, since rules persist
    /// across restarts through the Store.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        std::thread::spawn(move || self.run())
    }

    fn run(&self) {
        info!(period_ms = self.config.tick_period.as_millis(), "monitor loop started");
        let mut tick: u64 = 0;

        while !self.cancel.load(Ordering::SeqCst) {
            if let Err(e) = self.tick_once() {
                warn!(error = %e, "monitor tick failed");
            }

            tick += 1;
            if self.config.domain_refresh_every_ticks > 0
                && tick % u64::from(self.config.domain_refresh_every_ticks) == 0
            {
                self.refresh_domains();
            }

            std::thread::sleep(self.config.tick_period);
        }

        info!("monitor loop stopped");
    }

    fn tick_once(&self) -> crate::error::Result<()> {
        let connections = self.attributor.enumerate()?;
        self.update_app_state(&connections);

        for conn in &connections {
            let Some(app) = conn_app_name(&self.attributor, conn) else {
                continue;
            };
            // UDP has no connection state; its synthetic "stateless" rows
            // are surfaced the same as TCP's ESTABLISHED ones: both carry
            // a remote_addr worth evaluating.
            let Some(remote) = conn.remote_addr else {
                continue;
            };

            match self.engine.evaluate(&app, remote.ip()) {
                Decision::Deny(rule_id) => {
                    self.record_blocked(&app, remote.ip());
                    let _ = self.engine.store().log_attempt(
                        Some(rule_id),
                        &app,
                        &conn.local_addr.to_string(),
                        &remote.to_string(),
                        "monitor",
                    );
                    if let Err(e) = self.engine.reassert(&app, remote.ip()) {
                        warn!(error = %e, app, ip = %remote.ip(), "reassert failed");
                    }
                }
                Decision::Allow => {
                    self.record_allowed(&app, remote.ip());
                    debug!(app, remote = %remote, "connection allowed");
                }
            }
        }

        Ok(())
    }

    fn update_app_state(&self, connections: &[ConnectionRecord]) {
        let current: HashSet<String> = connections
            .iter()
            .filter_map(|c| conn_app_name(&self.attributor, c))
            .collect();

        let mut state = self.state.lock().expect("monitor state mutex poisoned");
        let new_apps: Vec<_> = current.difference(&state.active_apps).cloned().collect();
        let stopped_apps: Vec<_> = state.active_apps.difference(&current).cloned().collect();

        for app in &new_apps {
            debug!(app, "application became active");
        }
        for app in &stopped_apps {
            debug!(app, "application stopped");
        }

        state.active_apps = current;
    }

    fn record_blocked(&self, app: &str, ip: std::net::IpAddr) {
        let mut state = self.state.lock().expect("monitor state mutex poisoned");
        let entry = state.stats.entry(app.to_owned()).or_default();
        if entry.first_seen.is_none() {
            entry.first_seen = Some(Instant::now());
        }
        entry.connections += 1;
        entry.blocked_attempts += 1;
        entry.unique_destinations.insert(ip);
    }

    fn record_allowed(&self, app: &str, ip: std::net::IpAddr) {
        let mut state = self.state.lock().expect("monitor state mutex poisoned");
        let entry = state.stats.entry(app.to_owned()).or_default();
        if entry.first_seen.is_none() {
            entry.first_seen = Some(Instant::now());
        }
        entry.connections += 1;
        entry.unique_destinations.insert(ip);
    }

    fn refresh_domains(&self) {
        let rules = match self.engine.list_active() {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "failed to list active rules for domain refresh");
                return;
            }
        };
        for rule in rules.into_iter().filter(|r| r.target_kind == crate::store::TargetKind::Domain) {
            if let Err(e) = self.engine.refresh_domain(rule.id) {
                warn!(error = %e, rule_id = rule.id, "domain refresh failed");
            }
        }
    }

    /// Snapshot of per-app activity stats for the IPC `Stats` operation.
    #[must_use]
    pub fn stats_snapshot(&self) -> Vec<(String, AppActivityStats)> {
        let state = self.state.lock().expect("monitor state mutex poisoned");
        state.stats.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

fn conn_app_name(attributor: &dyn ProcessAttributor, conn: &ConnectionRecord) -> Option<String> {
    let pid = conn.pid?;
    let identity = attributor.attribute(conn.local_addr, conn.protocol).ok()??;
    debug_assert_eq!(identity.pid, pid);
    Some(identity.exe_basename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{attributor::ProcessIdentity, enforcer::stub::StubEnforcer, store::Store};

    struct FakeAttributor {
        records: Vec<ConnectionRecord>,
    }

    impl ProcessAttributor for FakeAttributor {
        fn attribute(
            &self,
            local_addr: std::net::SocketAddr,
            protocol: Protocol,
        ) -> crate::error::Result<Option<ProcessIdentity>> {
            Ok(self
                .records
                .iter()
                .find(|r| r.local_addr == local_addr && r.protocol == protocol)
                .map(|_| ProcessIdentity {
                    pid: 100,
                    uid: Some(1000),
                    exe_basename: "curl".to_owned(),
                    exe_path: Some("/usr/bin/curl".to_owned()),
                }))
        }

        fn enumerate(&self) -> crate::error::Result<Vec<ConnectionRecord>> {
            Ok(self.records.clone())
        }
    }

    #[test]
    fn tick_logs_attempt_on_deny() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = RuleEngine::new(Arc::clone(&store), Box::new(StubEnforcer), Duration::from_secs(5)).unwrap();
        engine.add("curl", "1.2.3.4").unwrap();

        let local: std::net::SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let remote: std::net::SocketAddr = "1.2.3.4:443".parse().unwrap();
        let attributor = Box::new(FakeAttributor {
            records: vec![ConnectionRecord {
                local_addr: local,
                remote_addr: Some(remote),
                protocol: Protocol::Tcp,
                pid: Some(100),
            }],
        });

        let monitor = MonitorLoop::new(
            engine,
            attributor,
            MonitorConfig {
                tick_period: Duration::from_millis(10),
                domain_refresh_every_ticks: 5,
            },
        );
        monitor.tick_once().expect("tick must succeed");

        let tail = store.tail_attempts(10).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].app, "curl");
    }
}

use std::{sync::Arc, time::Duration};

use egress_warden::{
    RuleEngine,
    attributor::{ConnectionRecord, ProcessAttributor, ProcessIdentity, Protocol},
    enforcer::stub::StubEnforcer,
    monitor::{MonitorConfig, MonitorLoop},
    store::Store,
};

struct FixedAttributor {
    records: Vec<ConnectionRecord>,
    identity: ProcessIdentity,
}

impl ProcessAttributor for FixedAttributor {
    fn attribute(
        &self,
        local_addr: std::net::SocketAddr,
        protocol: Protocol,
    ) -> egress_warden::error::Result<Option<ProcessIdentity>> {
        Ok(self
            .records
            .iter()
            .find(|r| r.local_addr == local_addr && r.protocol == protocol)
            .map(|_| self.identity.clone()))
    }

    fn enumerate(&self) -> egress_warden::error::Result<Vec<ConnectionRecord>> {
        Ok(self.records.clone())
    }
}

#[test]
fn allowed_connection_does_not_appear_in_blocked_stats() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let engine = RuleEngine::new(store, Box::new(StubEnforcer), Duration::from_secs(5)).unwrap();
    // No rule added: every connection from "wget" is allowed.

    let local: std::net::SocketAddr = "127.0.0.1:5000".parse().unwrap();
    let remote: std::net::SocketAddr = "9.9.9.9:443".parse().unwrap();
    let attributor = Box::new(FixedAttributor {
        records: vec![ConnectionRecord {
            local_addr: local,
            remote_addr: Some(remote),
            protocol: Protocol::Tcp,
            pid: Some(200),
        }],
        identity: ProcessIdentity {
            pid: 200,
            uid: Some(1000),
            exe_basename: "wget".to_owned(),
            exe_path: None,
        },
    });

    let monitor = Arc::new(MonitorLoop::new(
        engine,
        attributor,
        MonitorConfig {
            tick_period: Duration::from_millis(10),
            domain_refresh_every_ticks: 5,
        },
    ));

    // Run the loop body directly via the public spawn/cancel contract: spawn,
    // give it one tick window, then cancel.
    let cancel = monitor.cancel_handle();
    let handle = Arc::clone(&monitor).spawn();
    std::thread::sleep(Duration::from_millis(50));
    cancel.store(true, std::sync::atomic::Ordering::SeqCst);
    handle.join().expect("monitor thread must not panic");

    let stats = monitor.stats_snapshot();
    let wget = stats.iter().find(|(app, _)| app == "wget");
    assert!(wget.is_some());
    assert_eq!(wget.unwrap().1.blocked_attempts, 0);
}

use std::{sync::Arc, time::Duration};

use egress_warden::{
    Decision, RuleEngine,
    enforcer::{Enforcer, EnforcerTag, RemoveOutcome},
    engine::RemoveStatus,
    error::{Result, WardenError},
    store::Store,
};

/// Fails every `install` call after `fail_after` successful installs, so
/// tests can exercise the bounded-rollback path deterministically.
struct FlakyEnforcer {
    successes_remaining: std::sync::atomic::AtomicI64,
}

impl FlakyEnforcer {
    fn new(successes_remaining: i64) -> Self {
        Self {
            successes_remaining: std::sync::atomic::AtomicI64::new(successes_remaining),
        }
    }
}

impl Enforcer for FlakyEnforcer {
    fn install(&self, _tag: &EnforcerTag) -> Result<()> {
        let prev = self.successes_remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        if prev <= 0 {
            return Err(WardenError::enforcer_failed("install", "simulated failure"));
        }
        Ok(())
    }

    fn remove(&self, _tag: &EnforcerTag) -> Result<RemoveOutcome> {
        Ok(RemoveOutcome::Ok)
    }

    fn cleanup_all(&self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn add_ip_rule_then_list_active() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let engine = RuleEngine::new(store, Box::new(egress_warden::enforcer::stub::StubEnforcer), Duration::from_secs(5)).unwrap();

    let id = engine.add("curl", "8.8.8.8").expect("add must succeed");
    let active = engine.list_active().expect("list must succeed");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, id);
    assert_eq!(active[0].app, "curl");
}

#[test]
fn add_rejects_empty_app() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let engine = RuleEngine::new(store, Box::new(egress_warden::enforcer::stub::StubEnforcer), Duration::from_secs(5)).unwrap();
    let err = engine.add("", "8.8.8.8").unwrap_err();
    assert!(matches!(err, WardenError::InvalidArgument(_)));
}

#[test]
fn partial_install_failure_rolls_back_and_marks_inactive() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    // A domain with disjoint v4/v6 hits won't be used here; an IP literal
    // has exactly one address so a first-call failure exercises the
    // rollback path with zero prior installs to undo.
    let engine = RuleEngine::new(store, Box::new(FlakyEnforcer::new(0)), Duration::from_secs(5)).unwrap();

    let err = engine.add("curl", "8.8.8.8").unwrap_err();
    assert!(matches!(err, WardenError::EnforcerFailed { .. }));

    let active = engine.list_active().unwrap();
    assert!(active.is_empty(), "failed rule must not appear active");
}

#[test]
fn remove_unknown_rule_is_not_found() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let engine = RuleEngine::new(store, Box::new(egress_warden::enforcer::stub::StubEnforcer), Duration::from_secs(5)).unwrap();
    assert_eq!(engine.remove(42).unwrap(), RemoveStatus::NotFound);
}

#[test]
fn evaluate_tie_break_reports_lowest_rule_id() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let engine = RuleEngine::new(store, Box::new(egress_warden::enforcer::stub::StubEnforcer), Duration::from_secs(5)).unwrap();

    let first = engine.add("curl", "1.1.1.1").unwrap();
    let _second = engine.add("curl", "1.1.1.1").unwrap();

    assert_eq!(engine.evaluate("curl", "1.1.1.1".parse().unwrap()), Decision::Deny(first));
}

use std::collections::HashSet;

use egress_warden::enforcer::{Enforcer, EnforcerTag, RemoveOutcome, stub::StubEnforcer};

#[test]
fn stub_enforcer_install_is_idempotent() {
    let enforcer = StubEnforcer;
    let tag = EnforcerTag::new(1, "curl", "1.2.3.4".parse().unwrap());
    enforcer.install(&tag).expect("first install ok");
    enforcer.install(&tag).expect("second install ok (idempotent)");
}

#[test]
fn stub_enforcer_remove_of_never_installed_tag_is_not_found() {
    let enforcer = StubEnforcer;
    let tag = EnforcerTag::new(2, "curl", "5.6.7.8".parse().unwrap());
    assert_eq!(enforcer.remove(&tag).unwrap(), RemoveOutcome::NotFound);
}

/// Tracks tags "installed" in memory, standing in for a real platform
/// backend, to exercise the `Enforcer` trait's install/remove contract
/// against something that actually records state.
struct TrackingEnforcer {
    installed: std::sync::Mutex<HashSet<String>>,
}

impl TrackingEnforcer {
    fn new() -> Self {
        Self {
            installed: std::sync::Mutex::new(HashSet::new()),
        }
    }
}

impl Enforcer for TrackingEnforcer {
    fn install(&self, tag: &EnforcerTag) -> egress_warden::error::Result<()> {
        self.installed.lock().unwrap().insert(tag.to_string());
        Ok(())
    }

    fn remove(&self, tag: &EnforcerTag) -> egress_warden::error::Result<RemoveOutcome> {
        let removed = self.installed.lock().unwrap().remove(&tag.to_string());
        Ok(if removed { RemoveOutcome::Ok } else { RemoveOutcome::NotFound })
    }

    fn cleanup_all(&self) -> egress_warden::error::Result<()> {
        self.installed.lock().unwrap().clear();
        Ok(())
    }
}

#[test]
fn tracking_enforcer_install_then_remove_round_trips() {
    let enforcer = TrackingEnforcer::new();
    let tag = EnforcerTag::new(7, "firefox", "10.0.0.1".parse().unwrap());

    enforcer.install(&tag).unwrap();
    assert_eq!(enforcer.remove(&tag).unwrap(), RemoveOutcome::Ok);
    assert_eq!(enforcer.remove(&tag).unwrap(), RemoveOutcome::NotFound);
}

#[test]
fn tag_identity_is_the_only_thing_that_matters_for_removal() {
    let enforcer = TrackingEnforcer::new();
    let a = EnforcerTag::new(1, "app", "1.1.1.1".parse().unwrap());
    let b = EnforcerTag::new(2, "app", "1.1.1.1".parse().unwrap());

    enforcer.install(&a).unwrap();
    // Different rule_id, same app/ip: must not collide.
    assert_eq!(enforcer.remove(&b).unwrap(), RemoveOutcome::NotFound);
    assert_eq!(enforcer.remove(&a).unwrap(), RemoveOutcome::Ok);
}

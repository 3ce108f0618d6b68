use super::{Enforcer, EnforcerTag, RemoveOutcome};
use crate::error::Result;

/// No-op backend for platforms without a packet-filter implementation yet,
/// and as the fallback when the native backend fails to initialize: always
/// succeeds, never enforces.
pub struct StubEnforcer;

impl Enforcer for StubEnforcer {
    fn install(&self, tag: &EnforcerTag) -> Result<()> {
        tracing::warn!(%tag, "stub enforcer: rule accepted but not enforced at the kernel level");
        Ok(())
    }

    fn remove(&self, _tag: &EnforcerTag) -> Result<RemoveOutcome> {
        Ok(RemoveOutcome::NotFound)
    }

    fn cleanup_all(&self) -> Result<()> {
        Ok(())
    }
}

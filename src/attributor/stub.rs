use super::{ExeResolver, ProcessIdentity};

/// Fallback resolver for platforms/builds without a native attribution path
/// (macOS, or Linux built without `linux-enforcer`): always succeeds,
/// never attributes.
pub struct StubExeResolver;

impl ExeResolver for StubExeResolver {
    fn resolve(&self, pid: u32) -> ProcessIdentity {
        ProcessIdentity::unknown(pid)
    }
}

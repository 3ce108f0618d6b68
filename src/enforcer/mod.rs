//! Kernel packet-filter enforcement. A single [`Enforcer`] trait abstracts
//! the three platform backends: one interface, cfg-gated construction, a
//! stub for anything unmatched.

use std::{fmt, net::IpAddr};

use crate::error::Result;

#[cfg(all(target_os = "linux", feature = "linux-enforcer"))]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(all(target_os = "windows", feature = "windows"))]
pub mod windows;
pub mod stub;

/// Stable textual identity for one installed kernel rule. This tag, not a
/// rule-file offset or insertion order, is the sole key used to find and
/// remove kernel state later -- it survives daemon restarts and reordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnforcerTag {
    pub rule_id: i64,
    pub app: String,
    pub ip: IpAddr,
}

impl fmt::Display for EnforcerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block_{}_{}_{}", self.rule_id, sanitize(&self.app), self.ip)
    }
}

impl EnforcerTag {
    #[must_use]
    pub fn new(rule_id: i64, app: &str, ip: IpAddr) -> Self {
        Self {
            rule_id,
            app: app.to_owned(),
            ip,
        }
    }

    /// Parses a tag previously produced by [`EnforcerTag::to_string`]. Used
    /// by `cleanup_all` to recognize and reap this daemon's own kernel state
    /// left behind by an earlier crashed instance.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        let rest = tag.strip_prefix("block_")?;
        let (rule_id_raw, rest) = rest.split_once('_')?;
        let (app, ip_raw) = rest.rsplit_once('_')?;
        let rule_id = rule_id_raw.parse().ok()?;
        let ip = ip_raw.parse().ok()?;
        Some(Self {
            rule_id,
            app: app.to_owned(),
            ip,
        })
    }
}

fn sanitize(app: &str) -> String {
    app.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Outcome of a removal request: rules are identified by tag, and a given
/// tag may be partially present (e.g. the IPv4 leg installed but not IPv6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Ok,
    NotFound,
    Partial,
}

/// Platform packet-filter backend. `install`/`remove` must be idempotent:
/// calling `install` twice for the same tag, or `remove` for a tag that was
/// never installed, must not error.
pub trait Enforcer: Send + Sync + 'static {
    /// Installs a kernel-level block for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::WardenError::EnforcerFailed`] if any
    /// platform command fails; implementations roll back partial state
    /// before returning.
    fn install(&self, tag: &EnforcerTag) -> Result<()>;

    /// Removes the kernel-level block for `tag`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::WardenError::EnforcerFailed`] if a platform
    /// command fails outright (as opposed to simply finding nothing to
    /// remove, which is [`RemoveOutcome::NotFound`]).
    fn remove(&self, tag: &EnforcerTag) -> Result<RemoveOutcome>;

    /// Reaps every rule this enforcer recognizes as its own (by tag
    /// prefix), used at daemon startup to clear state from a prior crash.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::WardenError::EnforcerFailed`] if enumeration
    /// or cleanup fails.
    fn cleanup_all(&self) -> Result<()>;
}

#[must_use]
pub fn platform_enforcer() -> Box<dyn Enforcer> {
    build_enforcer()
}

#[cfg(all(target_os = "linux", feature = "linux-enforcer"))]
fn build_enforcer() -> Box<dyn Enforcer> {
    match linux::LinuxEnforcer::new() {
        Ok(enforcer) => Box::new(enforcer),
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize linux enforcer, falling back to stub");
            Box::new(stub::StubEnforcer)
        }
    }
}

#[cfg(target_os = "macos")]
fn build_enforcer() -> Box<dyn Enforcer> {
    Box::new(macos::MacosEnforcer::new())
}

#[cfg(all(target_os = "windows", feature = "windows"))]
fn build_enforcer() -> Box<dyn Enforcer> {
    Box::new(windows::WindowsEnforcer::new())
}

#[cfg(not(any(
    all(target_os = "linux", feature = "linux-enforcer"),
    target_os = "macos",
    all(target_os = "windows", feature = "windows")
)))]
fn build_enforcer() -> Box<dyn Enforcer> {
    Box::new(stub::StubEnforcer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrips_through_display_and_parse() {
        let tag = EnforcerTag::new(42, "fire.fox", "10.0.0.5".parse().unwrap());
        let rendered = tag.to_string();
        assert_eq!(rendered, "block_42_fire.fox_10.0.0.5");
        let parsed = EnforcerTag::parse(&rendered).expect("must parse");
        assert_eq!(parsed, tag);
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("my app/v2"), "my_app_v2");
    }
}

use std::process::Command;

use super::{Enforcer, EnforcerTag, RemoveOutcome};
use crate::error::{Result, WardenError};

/// Drives the Windows Filtering Platform through `netsh advfirewall`, one
/// named rule per tag. A real WFP callout would avoid the process-spawn
/// overhead per call, but `netsh` keeps this backend dependency-free and
/// scriptable the same way the reference `iptables`-based Linux backend is.
pub struct WindowsEnforcer;

impl WindowsEnforcer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn rule_name(tag: &EnforcerTag) -> String {
        format!("egress-warden-{tag}")
    }

    fn netsh(args: &[&str]) -> Result<String> {
        let output = Command::new("netsh")
            .args(args)
            .output()
            .map_err(|e| WardenError::enforcer_failed("netsh-spawn", e.to_string()))?;
        if !output.status.success() {
            return Err(WardenError::enforcer_failed(
                "netsh",
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for WindowsEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl Enforcer for WindowsEnforcer {
    fn install(&self, tag: &EnforcerTag) -> Result<()> {
        let name = Self::rule_name(tag);
        Self::netsh(&[
            "advfirewall",
            "firewall",
            "add",
            "rule",
            &format!("name={name}"),
            "dir=out",
            "action=block",
            &format!("remoteip={}", tag.ip),
            &format!("program={}", tag.app),
        ])?;
        Ok(())
    }

    fn remove(&self, tag: &EnforcerTag) -> Result<RemoveOutcome> {
        let name = Self::rule_name(tag);
        match Self::netsh(&["advfirewall", "firewall", "delete", "rule", &format!("name={name}")]) {
            Ok(_) => Ok(RemoveOutcome::Ok),
            Err(_) => Ok(RemoveOutcome::NotFound),
        }
    }

    fn cleanup_all(&self) -> Result<()> {
        // netsh has no "delete rules matching prefix" primitive; enumeration
        // would require parsing `show rule name=all` output. Left for a
        // WFP-native backend; startup cleanup is a best-effort no-op here.
        Ok(())
    }
}

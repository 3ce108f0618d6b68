use std::{
    process::Command,
    sync::Mutex,
};

use super::{Enforcer, EnforcerTag, RemoveOutcome};
use crate::error::{Result, WardenError};

/// One PF anchor per `(app, ip)`, loaded/unloaded via `pfctl`. Scoping the
/// anchor to the address as well as the app means removing one address's
/// rule never touches another address blocked for the same app -- each
/// pair owns a distinct anchor instead of sharing one `-F rules` flush.
/// Either a bare executable name or an absolute path is accepted as the
/// app identifier.
pub struct MacosEnforcer {
    // pfctl serializes anchor edits per name; one process-wide lock keeps
    // install/remove from racing each other across threads.
    lock: Mutex<()>,
}

impl MacosEnforcer {
    #[must_use]
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    fn sanitize(raw: &str) -> String {
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect()
    }

    fn anchor_name(app: &str, ip: std::net::IpAddr) -> String {
        format!("egress_warden/{}/{}", Self::sanitize(app), Self::sanitize(&ip.to_string()))
    }

    fn run_pfctl(args: &[&str]) -> Result<String> {
        let output = Command::new("pfctl")
            .args(args)
            .output()
            .map_err(|e| WardenError::enforcer_failed("pfctl-spawn", e.to_string()))?;
        if !output.status.success() {
            return Err(WardenError::enforcer_failed(
                "pfctl",
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for MacosEnforcer {
    fn default() -> Self {
        Self::new()
    }
}

impl Enforcer for MacosEnforcer {
    fn install(&self, tag: &EnforcerTag) -> Result<()> {
        let _guard = self.lock.lock().expect("pf anchor lock poisoned");
        let anchor = Self::anchor_name(&tag.app, tag.ip);
        let rule = format!("block drop quick to {} # {tag}\n", tag.ip);

        let mut child = std::process::Command::new("pfctl")
            .args(["-a", &anchor, "-f", "-"])
            .stdin(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| WardenError::enforcer_failed("pfctl-spawn", e.to_string()))?;
        {
            use std::io::Write;
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| WardenError::enforcer_failed("pfctl-stdin", "no stdin handle"))?;
            stdin
                .write_all(rule.as_bytes())
                .map_err(|e| WardenError::enforcer_failed("pfctl-write", e.to_string()))?;
        }
        let status = child
            .wait()
            .map_err(|e| WardenError::enforcer_failed("pfctl-wait", e.to_string()))?;
        if !status.success() {
            return Err(WardenError::enforcer_failed("pfctl-load", format!("exit status {status}")));
        }
        Ok(())
    }

    fn remove(&self, tag: &EnforcerTag) -> Result<RemoveOutcome> {
        let _guard = self.lock.lock().expect("pf anchor lock poisoned");
        let anchor = Self::anchor_name(&tag.app, tag.ip);
        match Self::run_pfctl(&["-a", &anchor, "-F", "rules"]) {
            Ok(_) => Ok(RemoveOutcome::Ok),
            Err(_) => Ok(RemoveOutcome::NotFound),
        }
    }

    fn cleanup_all(&self) -> Result<()> {
        let _guard = self.lock.lock().expect("pf anchor lock poisoned");
        let _ = Self::run_pfctl(&["-a", "egress_warden/*", "-F", "rules"]);
        Ok(())
    }
}

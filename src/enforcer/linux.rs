use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use tracing::Level;

use super::{Enforcer, EnforcerTag, RemoveOutcome};
use crate::error::{Result, WardenError};

const CGROUP_NET_CLS_BASE: &str = "/sys/fs/cgroup/net_cls";

/// Thin wrapper over the `iptables` crate, generalized to both
/// `iptables`/`ip6tables` binaries behind one interface so call sites never
/// branch on address family. Mirrors the `IPTables` trait wrapper shape used
/// to drive iptables from Rust elsewhere in the ecosystem. Public so
/// integration tests can substitute a mock and exercise
/// [`LinuxEnforcer`]'s chain/rule/classid logic without a real kernel.
pub trait IpTablesDriver: Send + Sync {
    fn create_chain(&self, chain: &str) -> Result<()>;
    fn delete_chain(&self, chain: &str) -> Result<()>;
    fn ensure_jump(&self, chain: &str, uid: u32, classid: u32) -> Result<()>;
    fn remove_jump(&self, chain: &str) -> Result<()>;
    fn append(&self, chain: &str, rule: &str) -> Result<()>;
    fn delete_matching(&self, chain: &str, needle: &str) -> Result<usize>;
    fn chain_exists(&self, chain: &str) -> Result<bool>;
    fn chain_is_empty(&self, chain: &str) -> Result<bool>;
    fn list_chains(&self) -> Result<Vec<String>>;
}

struct RealIpTables {
    inner: iptables::IPTables,
    cmd_name: &'static str,
}

impl RealIpTables {
    fn new(ipv6: bool) -> Result<Self> {
        let inner = iptables::new(ipv6)
            .map_err(|e| WardenError::enforcer_failed("iptables-init", e.to_string()))?;
        Ok(Self {
            inner,
            cmd_name: if ipv6 { "ip6tables" } else { "iptables" },
        })
    }

    fn fail(&self, step: &str, e: impl std::fmt::Display) -> WardenError {
        WardenError::enforcer_failed(format!("{}:{step}", self.cmd_name), e.to_string())
    }
}

impl IpTablesDriver for RealIpTables {
    #[tracing::instrument(level = Level::TRACE, skip(self), err)]
    fn create_chain(&self, chain: &str) -> Result<()> {
        // Idempotent: the binary errors if the chain already exists, which we
        // treat as success rather than propagating.
        let _ = self.inner.new_chain("filter", chain);
        Ok(())
    }

    #[tracing::instrument(level = Level::TRACE, skip(self), err)]
    fn delete_chain(&self, chain: &str) -> Result<()> {
        let _ = self.inner.flush_chain("filter", chain);
        let _ = self.inner.delete_chain("filter", chain);
        Ok(())
    }

    #[tracing::instrument(level = Level::TRACE, skip(self), err)]
    fn ensure_jump(&self, chain: &str, uid: u32, classid: u32) -> Result<()> {
        let rule = format!(
            "-m owner --uid-owner {uid} -m cgroup --cgroup {classid} -j {chain}"
        );
        let exists = self
            .inner
            .exists("filter", "OUTPUT", &rule)
            .map_err(|e| self.fail("jump-check", e))?;
        if !exists {
            self.inner
                .insert("filter", "OUTPUT", &rule, 1)
                .map_err(|e| self.fail("jump-insert", e))?;
        }
        Ok(())
    }

    #[tracing::instrument(level = Level::TRACE, skip(self), err)]
    fn remove_jump(&self, chain: &str) -> Result<()> {
        let rule = format!("-j {chain}");
        let _ = self.inner.delete("filter", "OUTPUT", &rule);
        Ok(())
    }

    #[tracing::instrument(level = Level::TRACE, skip(self), err)]
    fn append(&self, chain: &str, rule: &str) -> Result<()> {
        self.inner
            .append("filter", chain, rule)
            .map_err(|e| self.fail("append", e))
    }

    #[tracing::instrument(level = Level::TRACE, skip(self), err)]
    fn delete_matching(&self, chain: &str, needle: &str) -> Result<usize> {
        let rules = self
            .inner
            .list("filter", chain)
            .map_err(|e| self.fail("list", e))?;
        let mut removed = 0;
        for rule_line in rules {
            if !rule_line.contains(needle) {
                continue;
            }
            // `list` returns full `-A CHAIN ...` lines; iptables wants the
            // bare rule spec, so strip the leading "-A <chain> ".
            let Some(spec) = rule_line.strip_prefix(&format!("-A {chain} ")) else {
                continue;
            };
            if self.inner.delete("filter", chain, spec).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn chain_exists(&self, chain: &str) -> Result<bool> {
        self.inner
            .list("filter", chain)
            .map(|_| true)
            .or(Ok(false))
    }

    fn chain_is_empty(&self, chain: &str) -> Result<bool> {
        let rules = self
            .inner
            .list("filter", chain)
            .map_err(|e| self.fail("list", e))?;
        Ok(rules.iter().all(|l| l.starts_with(&format!("-N {chain}"))))
    }

    fn list_chains(&self) -> Result<Vec<String>> {
        let table = self
            .inner
            .list_table("filter")
            .map_err(|e| self.fail("list-table", e))?;
        Ok(table
            .into_iter()
            .filter_map(|line| line.strip_prefix("-N ").map(ToOwned::to_owned))
            .collect())
    }
}

/// Reference enforcer: iptables/ip6tables chain per app, cgroup-v1 net_cls
/// classification for uid+cgroup jump matching, tag-based rule identity via
/// the `comment` match module.
pub struct LinuxEnforcer {
    v4: Box<dyn IpTablesDriver>,
    v6: Box<dyn IpTablesDriver>,
    effective_uid: u32,
    cgroup_base: PathBuf,
}

impl LinuxEnforcer {
    /// # Errors
    ///
    /// Returns [`WardenError::EnforcerFailed`] if neither `iptables` nor
    /// `ip6tables` can be initialized.
    pub fn new() -> Result<Self> {
        Ok(Self {
            v4: Box::new(RealIpTables::new(false)?),
            v6: Box::new(RealIpTables::new(true)?),
            effective_uid: effective_uid(),
            cgroup_base: PathBuf::from(CGROUP_NET_CLS_BASE),
        })
    }

    /// Builds an enforcer over injected drivers and an injected cgroup
    /// base directory, bypassing both the real `iptables`/`ip6tables`
    /// binaries and the real `/sys/fs/cgroup/net_cls` hierarchy. Exists so
    /// tests can exercise the chain/rule/rollback/classid logic against a
    /// mock [`IpTablesDriver`] and a scratch directory.
    #[must_use]
    pub fn with_drivers(
        v4: Box<dyn IpTablesDriver>,
        v6: Box<dyn IpTablesDriver>,
        effective_uid: u32,
        cgroup_base: PathBuf,
    ) -> Self {
        Self { v4, v6, effective_uid, cgroup_base }
    }

    fn driver_for(&self, ip: IpAddr) -> &dyn IpTablesDriver {
        match ip {
            IpAddr::V4(_) => self.v4.as_ref(),
            IpAddr::V6(_) => self.v6.as_ref(),
        }
    }

    fn chain_name(app: &str) -> String {
        let upper: String = app
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("APP_{upper}")
    }
}

impl Enforcer for LinuxEnforcer {
    fn install(&self, tag: &EnforcerTag) -> Result<()> {
        let chain = Self::chain_name(&tag.app);
        let driver = self.driver_for(tag.ip);
        let classid = classid_for_app(&tag.app);

        setup_cgroup(&self.cgroup_base, &tag.app, classid)?;

        driver.create_chain(&chain)?;
        if let Err(e) = driver.ensure_jump(&chain, self.effective_uid, classid) {
            driver.delete_chain(&chain)?;
            return Err(e);
        }

        let comment = tag.to_string();
        let icmp_proto = if matches!(tag.ip, IpAddr::V6(_)) { "icmpv6" } else { "icmp" };
        let rules = [
            format!("-p tcp -d {} -m state --state NEW,ESTABLISHED -m comment --comment {comment} -j DROP", tag.ip),
            format!("-p udp -d {} -m comment --comment {comment} -j DROP", tag.ip),
            format!("-p {icmp_proto} -d {} -m comment --comment {comment} -j DROP", tag.ip),
        ];

        for (i, rule) in rules.iter().enumerate() {
            if let Err(e) = driver.append(&chain, rule) {
                // Bounded rollback: undo only the rules from this call, not
                // the whole chain, since other tags may already live there.
                for prior in &rules[..i] {
                    let _ = driver.delete_matching(&chain, prior);
                }
                return Err(e);
            }
        }

        Ok(())
    }

    fn remove(&self, tag: &EnforcerTag) -> Result<RemoveOutcome> {
        let chain = Self::chain_name(&tag.app);
        let driver = self.driver_for(tag.ip);

        if !driver.chain_exists(&chain)? {
            return Ok(RemoveOutcome::NotFound);
        }

        let removed = driver.delete_matching(&chain, &tag.to_string())?;
        if removed == 0 {
            return Ok(RemoveOutcome::NotFound);
        }

        if driver.chain_is_empty(&chain)? {
            driver.remove_jump(&chain)?;
            driver.delete_chain(&chain)?;
        }

        if removed < 3 {
            Ok(RemoveOutcome::Partial)
        } else {
            Ok(RemoveOutcome::Ok)
        }
    }

    fn cleanup_all(&self) -> Result<()> {
        for driver in [self.v4.as_ref(), self.v6.as_ref()] {
            for chain in driver.list_chains()? {
                if !chain.starts_with("APP_") {
                    continue;
                }
                driver.remove_jump(&chain)?;
                driver.delete_chain(&chain)?;
            }
        }
        Ok(())
    }
}

/// Deterministic classid in iptables' 32-bit `--cgroup` id space: high 16
/// bits fixed to 1 (this daemon's major number), low 16 bits a stable
/// non-zero hash of the app name, giving every app its own minor number
/// under `1:`.
fn classid_for_app(app: &str) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    app.hash(&mut hasher);
    let low16 = hasher.finish() as u16;
    let low16 = if low16 == 0 { 1 } else { low16 };
    0x0001_0000 | u32::from(low16)
}

fn setup_cgroup(base: &Path, app: &str, classid: u32) -> Result<()> {
    if !base.exists() {
        return Err(WardenError::enforcer_failed(
            "cgroup-setup",
            format!("{} is not mounted; net_cls cgroup v1 hierarchy required", base.display()),
        ));
    }

    let app_cgroup: PathBuf = base.join(sanitize_path_component(app));
    if !app_cgroup.exists() {
        fs::create_dir_all(&app_cgroup)
            .map_err(|e| WardenError::enforcer_failed("cgroup-mkdir", e.to_string()))?;
    }

    fs::write(app_cgroup.join("net_cls.classid"), classid.to_string())
        .map_err(|e| WardenError::enforcer_failed("cgroup-classid", e.to_string()))?;

    Ok(())
}

fn sanitize_path_component(app: &str) -> String {
    app.chars()
        .map(|c| if c == '/' || c == '\0' { '_' } else { c })
        .collect()
}

fn effective_uid() -> u32 {
    std::env::var("SUDO_UID")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| unsafe { libc::geteuid() })
}

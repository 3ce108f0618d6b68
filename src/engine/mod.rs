//! Rule engine: consumes operator intent, drives the Resolver and Enforcer,
//! persists in the Store, and maintains an `ArcSwap`-backed in-memory cache
//! indexed by application name, atomically replaced on every write.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::IpAddr,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;

use crate::{
    enforcer::{Enforcer, EnforcerTag, RemoveOutcome},
    error::{Result, WardenError},
    resolver::{self, DEFAULT_TIMEOUT},
    store::{RuleId, Store, TargetKind},
};

/// One application's worth of cached rules, reconstructed from the Store.
#[derive(Debug, Clone)]
pub struct CachedRule {
    pub id: RuleId,
    pub target: String,
    pub kind: TargetKind,
    pub ips: BTreeSet<IpAddr>,
}

type RuleCache = HashMap<String, Vec<CachedRule>>;

/// Outcome of `evaluate`. `Deny` names the lowest matching rule id so
/// logging is deterministic when several rules for the same app match the
/// same destination (deny wins, tie-break on lowest id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(RuleId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    Ok,
    NotFound,
    Partial,
}

struct CacheState {
    map: RuleCache,
    built_at: Instant,
}

/// Owns the Store, Enforcer, and the atomically-swapped rule cache. The
/// sole writer; Monitor Loop and L7 Proxy hold only a shared `Arc<RuleEngine>`
/// for `evaluate`/`refresh_domain` reads.
pub struct RuleEngine {
    store: Arc<Store>,
    enforcer: Box<dyn Enforcer>,
    cache: ArcSwap<CacheState>,
    staleness: Duration,
    refreshing: Mutex<HashSet<RuleId>>,
    self_handle: Weak<Self>,
}

impl RuleEngine {
    /// Builds the engine behind an `Arc`, with a weak self-handle installed
    /// so `evaluate` can actually spawn a background `refresh_domain` call
    /// on a stale domain-rule cache hit rather than only recording that one
    /// was due.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] if the initial cache build
    /// fails to read from the store.
    pub fn new(store: Arc<Store>, enforcer: Box<dyn Enforcer>, staleness: Duration) -> Result<Arc<Self>> {
        let map = build_cache(&store)?;
        Ok(Arc::new_cyclic(|weak| Self {
            store,
            enforcer,
            cache: ArcSwap::from_pointee(CacheState {
                map,
                built_at: Instant::now(),
            }),
            staleness,
            refreshing: Mutex::new(HashSet::new()),
            self_handle: weak.clone(),
        }))
    }

    fn swap_cache(&self) -> Result<()> {
        let map = build_cache(&self.store)?;
        self.cache.store(Arc::new(CacheState {
            map,
            built_at: Instant::now(),
        }));
        Ok(())
    }

    /// Classifies `target`, resolves it if it is a name, installs one
    /// kernel rule per resolved address, and persists the row. On any
    /// enforcer failure, performs a bounded rollback: every address already
    /// installed for this `rule_id` is removed and the row is marked
    /// inactive before returning the error.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidArgument`] for an empty `app`,
    /// [`WardenError::ResolutionFailed`] if a domain name resolves to no
    /// addresses, or [`WardenError::EnforcerFailed`] if installation fails.
    pub fn add(&self, app: &str, target: &str) -> Result<RuleId> {
        if app.trim().is_empty() {
            return Err(WardenError::InvalidArgument("app must not be empty".to_owned()));
        }

        let (kind, v4, v6) = classify_and_resolve(target)?;

        let rule_id = self.store.insert_rule(app, target, kind, &v4, &v6)?;

        let all_ips: Vec<IpAddr> = v4
            .iter()
            .copied()
            .map(IpAddr::V4)
            .chain(v6.iter().copied().map(IpAddr::V6))
            .collect();

        let mut installed = Vec::with_capacity(all_ips.len());
        for ip in &all_ips {
            let tag = EnforcerTag::new(rule_id, app, *ip);
            if let Err(e) = self.enforcer.install(&tag) {
                for done in installed.iter().rev() {
                    let _ = self.enforcer.remove(&EnforcerTag::new(rule_id, app, *done));
                }
                let _ = self.store.set_active(rule_id, false);
                return Err(e);
            }
            installed.push(*ip);
        }

        self.swap_cache()?;
        Ok(rule_id)
    }

    /// Removes every kernel rule for `rule_id` and marks it inactive if all
    /// removals succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] on a store failure.
    pub fn remove(&self, rule_id: RuleId) -> Result<RemoveStatus> {
        let Some(rule) = self.store.get_rule(rule_id)? else {
            return Ok(RemoveStatus::NotFound);
        };
        if !rule.active {
            return Ok(RemoveStatus::NotFound);
        }

        let ips: Vec<IpAddr> = rule
            .resolved_v4
            .iter()
            .copied()
            .map(IpAddr::V4)
            .chain(rule.resolved_v6.iter().copied().map(IpAddr::V6))
            .collect();

        let mut all_ok = true;
        for ip in &ips {
            let tag = EnforcerTag::new(rule_id, &rule.app, *ip);
            match self.enforcer.remove(&tag) {
                Ok(RemoveOutcome::Ok | RemoveOutcome::NotFound) => {}
                Ok(RemoveOutcome::Partial) | Err(_) => all_ok = false,
            }
        }

        if all_ok {
            self.store.set_active(rule_id, false)?;
            self.swap_cache()?;
            Ok(RemoveStatus::Ok)
        } else {
            Ok(RemoveStatus::Partial)
        }
    }

    /// Read-through to the Store, refreshing the cache first.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] on a store failure.
    pub fn list_active(&self) -> Result<Vec<crate::store::Rule>> {
        self.maybe_refresh_cache()?;
        self.store.list_active()
    }

    /// Consults the cache only; never touches the Store. Triggers an
    /// asynchronous (fire-and-forget thread) refresh when the matched
    /// domain rule's cache entry is older than the staleness threshold, but
    /// answers from current state regardless.
    #[must_use]
    pub fn evaluate(&self, app: &str, remote_ip: IpAddr) -> Decision {
        let cache = self.cache.load();
        let Some(rules) = cache.map.get(app) else {
            return Decision::Allow;
        };

        let mut matched: Option<(RuleId, TargetKind)> = None;
        for rule in rules {
            if rule.ips.contains(&remote_ip) {
                matched = match matched {
                    Some((id, _)) if id <= rule.id => matched,
                    _ => Some((rule.id, rule.kind)),
                };
            }
        }

        let Some((rule_id, kind)) = matched else {
            return Decision::Allow;
        };

        if kind == TargetKind::Domain && cache.built_at.elapsed() > self.staleness {
            self.spawn_refresh(rule_id);
        }

        Decision::Deny(rule_id)
    }

    /// Consults the cache by hostname rather than resolved address, for
    /// callers (the L7 proxy) that see the request's target host string
    /// directly. Matching on the host string itself, instead of performing
    /// a fresh resolution and matching on one of its addresses, means a
    /// stale or differently-ordered DNS answer can never cause a flow that
    /// should be denied to slip through as allowed. Only domain rules
    /// participate: an IP-literal rule's `target` is an address, not a
    /// hostname, and cannot match a `Host` header or CONNECT target.
    #[must_use]
    pub fn evaluate_name(&self, app: &str, host: &str) -> Decision {
        let cache = self.cache.load();
        let Some(rules) = cache.map.get(app) else {
            return Decision::Allow;
        };

        let mut matched: Option<RuleId> = None;
        for rule in rules {
            if rule.kind == TargetKind::Domain && rule.target.eq_ignore_ascii_case(host) {
                matched = match matched {
                    Some(id) if id <= rule.id => matched,
                    _ => Some(rule.id),
                };
            }
        }

        let Some(rule_id) = matched else {
            return Decision::Allow;
        };

        if cache.built_at.elapsed() > self.staleness {
            self.spawn_refresh(rule_id);
        }

        Decision::Deny(rule_id)
    }

    /// Spawns a background thread that calls `refresh_domain(rule_id)`.
    /// Coalesces concurrent staleness triggers for the same rule: if a
    /// refresh for `rule_id` is already in flight, this is a no-op.
    fn spawn_refresh(&self, rule_id: RuleId) {
        {
            let mut inflight = self.refreshing.lock().unwrap();
            if !inflight.insert(rule_id) {
                return;
            }
        }

        let Some(engine) = self.self_handle.upgrade() else {
            self.refreshing.lock().unwrap().remove(&rule_id);
            return;
        };

        tracing::debug!(rule_id, "domain rule cache stale, spawning background refresh");
        std::thread::spawn(move || {
            if let Err(e) = engine.refresh_domain(rule_id) {
                tracing::warn!(rule_id, error = %e, "background domain refresh failed");
            }
            engine.refreshing.lock().unwrap().remove(&rule_id);
        });
    }

    /// Recomputes resolved sets for a domain rule, diffs against the cached
    /// sets, installs added addresses and removes dropped ones, then
    /// updates the Store row atomically. Idempotent: re-running after a
    /// partial failure converges on the same union.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::NotFound`] if the rule is absent or inactive,
    /// [`WardenError::ResolutionFailed`] if re-resolution fails, or
    /// [`WardenError::EnforcerFailed`] if a kernel mutation fails.
    pub fn refresh_domain(&self, rule_id: RuleId) -> Result<()> {
        let rule = self.store.get_rule(rule_id)?.ok_or(WardenError::NotFound)?;
        if !rule.active || rule.target_kind != TargetKind::Domain {
            return Err(WardenError::NotFound);
        }

        let resolved = resolver::resolve_with_timeout(&rule.target, DEFAULT_TIMEOUT)?;

        let added_v4: Vec<_> = resolved.v4.difference(&rule.resolved_v4).copied().collect();
        let removed_v4: Vec<_> = rule.resolved_v4.difference(&resolved.v4).copied().collect();
        let added_v6: Vec<_> = resolved.v6.difference(&rule.resolved_v6).copied().collect();
        let removed_v6: Vec<_> = rule.resolved_v6.difference(&resolved.v6).copied().collect();

        for ip in added_v4.iter().copied().map(IpAddr::V4).chain(added_v6.iter().copied().map(IpAddr::V6)) {
            self.enforcer.install(&EnforcerTag::new(rule_id, &rule.app, ip))?;
        }
        for ip in removed_v4.iter().copied().map(IpAddr::V4).chain(removed_v6.iter().copied().map(IpAddr::V6)) {
            self.enforcer.remove(&EnforcerTag::new(rule_id, &rule.app, ip))?;
        }

        self.store.update_resolved(rule_id, &resolved.v4, &resolved.v6)?;
        self.swap_cache()?;
        Ok(())
    }

    /// Re-asserts kernel state for `(app, ip)` if a cached rule matches,
    /// without consulting the Store. No-op if no rule currently matches —
    /// resolves the open question left by the undefined
    /// `enforce_firewall_rule` contract.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::EnforcerFailed`] if the install call fails.
    pub fn reassert(&self, app: &str, ip: IpAddr) -> Result<()> {
        let cache = self.cache.load();
        let Some(rules) = cache.map.get(app) else {
            return Ok(());
        };
        let Some(rule) = rules.iter().filter(|r| r.ips.contains(&ip)).min_by_key(|r| r.id) else {
            return Ok(());
        };
        self.enforcer.install(&EnforcerTag::new(rule.id, app, ip))
    }

    /// Shared handle to the underlying store, for components (the Monitor
    /// Loop) that log attempts directly rather than through the engine.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn maybe_refresh_cache(&self) -> Result<()> {
        if self.cache.load().built_at.elapsed() > self.staleness {
            self.swap_cache()?;
        }
        Ok(())
    }
}

fn classify_and_resolve(
    target: &str,
) -> Result<(TargetKind, BTreeSet<std::net::Ipv4Addr>, BTreeSet<std::net::Ipv6Addr>)> {
    if let Ok(v4) = target.parse::<std::net::Ipv4Addr>() {
        let mut set = BTreeSet::new();
        set.insert(v4);
        return Ok((TargetKind::Ip, set, BTreeSet::new()));
    }
    if target.contains(':') {
        if let Ok(v6) = target.parse::<std::net::Ipv6Addr>() {
            let mut set = BTreeSet::new();
            set.insert(v6);
            return Ok((TargetKind::Ip, BTreeSet::new(), set));
        }
    }

    let resolved = resolver::resolve_with_timeout(target, DEFAULT_TIMEOUT)?;
    if resolved.is_empty() {
        return Err(WardenError::ResolutionFailed(target.to_owned()));
    }
    Ok((TargetKind::Domain, resolved.v4, resolved.v6))
}

fn build_cache(store: &Store) -> Result<RuleCache> {
    let mut map: RuleCache = HashMap::new();
    for rule in store.list_active()? {
        let mut ips: BTreeSet<IpAddr> = rule.resolved_v4.iter().copied().map(IpAddr::V4).collect();
        ips.extend(rule.resolved_v6.iter().copied().map(IpAddr::V6));
        map.entry(rule.app.clone()).or_default().push(CachedRule {
            id: rule.id,
            target: rule.target.clone(),
            kind: rule.target_kind,
            ips,
        });
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::stub::StubEnforcer;

    fn test_engine() -> Arc<RuleEngine> {
        let store = Arc::new(Store::open_in_memory().expect("open store"));
        RuleEngine::new(store, Box::new(StubEnforcer), Duration::from_secs(5)).expect("build engine")
    }

    #[test]
    fn add_then_evaluate_denies_matching_ip() {
        let engine = test_engine();
        let id = engine.add("curl", "1.2.3.4").expect("add rule");
        let decision = engine.evaluate("curl", "1.2.3.4".parse().unwrap());
        assert_eq!(decision, Decision::Deny(id));
    }

    #[test]
    fn evaluate_allows_unmatched_app() {
        let engine = test_engine();
        engine.add("curl", "1.2.3.4").unwrap();
        assert_eq!(engine.evaluate("wget", "1.2.3.4".parse().unwrap()), Decision::Allow);
    }

    #[test]
    fn remove_marks_inactive_and_clears_from_cache() {
        let engine = test_engine();
        let id = engine.add("curl", "1.2.3.4").unwrap();
        assert_eq!(engine.remove(id).unwrap(), RemoveStatus::Ok);
        assert_eq!(engine.evaluate("curl", "1.2.3.4".parse().unwrap()), Decision::Allow);
    }

    #[test]
    fn remove_unknown_rule_is_not_found() {
        let engine = test_engine();
        assert_eq!(engine.remove(999).unwrap(), RemoveStatus::NotFound);
    }

    #[test]
    fn evaluate_name_matches_host_string_even_if_live_resolution_would_differ() {
        let engine = test_engine();
        let id = engine.add("curl", "localhost").unwrap();
        // The cached resolved set for "localhost" (from classify_and_resolve
        // at add-time) is whatever it was at that moment; evaluate_name must
        // match on the host string itself, not on a fresh lookup result.
        assert_eq!(engine.evaluate_name("curl", "localhost"), Decision::Deny(id));
        assert_eq!(engine.evaluate_name("curl", "LOCALHOST"), Decision::Deny(id));
        assert_eq!(engine.evaluate_name("curl", "other.example"), Decision::Allow);
    }

    #[test]
    fn evaluate_name_does_not_match_an_ip_literal_rule() {
        let engine = test_engine();
        engine.add("curl", "1.2.3.4").unwrap();
        assert_eq!(engine.evaluate_name("curl", "1.2.3.4"), Decision::Allow);
    }

    #[test]
    fn deny_tie_break_picks_lowest_rule_id() {
        let engine = test_engine();
        let first = engine.add("curl", "1.2.3.4").unwrap();
        let _second = engine.add("curl", "1.2.3.4").unwrap();
        assert_eq!(engine.evaluate("curl", "1.2.3.4".parse().unwrap()), Decision::Deny(first));
    }

    #[test]
    fn reassert_on_unmatched_destination_is_noop() {
        let engine = test_engine();
        engine.add("curl", "1.2.3.4").unwrap();
        engine.reassert("curl", "9.9.9.9".parse().unwrap()).expect("noop ok");
    }

    #[test]
    fn stale_domain_match_actually_spawns_a_refresh() {
        let store = Arc::new(Store::open_in_memory().expect("open store"));
        let engine =
            RuleEngine::new(store, Box::new(StubEnforcer), Duration::from_millis(1)).expect("build engine");
        engine.add("curl", "localhost").expect("add domain rule");
        std::thread::sleep(Duration::from_millis(5));

        let ip = {
            let cache = engine.cache.load();
            *cache.map.get("curl").unwrap()[0].ips.iter().next().unwrap()
        };

        // The cache entry is already older than the 1ms staleness window, so
        // this evaluate() call must actually spawn a background
        // refresh_domain() rather than only noting one was due.
        engine.evaluate("curl", ip);
        std::thread::sleep(Duration::from_millis(200));
        assert!(
            engine.refreshing.lock().unwrap().is_empty(),
            "background refresh must complete and clear the in-flight marker"
        );
    }
}

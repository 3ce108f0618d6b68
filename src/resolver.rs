use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use dns_lookup::lookup_host;

use crate::error::{Result, WardenError};

/// Default resolution timeout, per the monitor tick budget: a stuck resolver
/// thread must never stall the tick loop for longer than this.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedAddrs {
    pub v4: BTreeSet<Ipv4Addr>,
    pub v6: BTreeSet<Ipv6Addr>,
}

impl ResolvedAddrs {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    #[must_use]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.v4.contains(v4),
            IpAddr::V6(v6) => self.v6.contains(v6),
        }
    }
}

/// Resolves a domain to its current set of A/AAAA addresses, requesting
/// both address families together with no protocol/service filtering.
///
/// The lookup itself runs on the calling thread; callers that need a hard
/// timeout (the monitor loop) run this inside `resolve_with_timeout`.
///
/// # Errors
///
/// Returns [`WardenError::ResolutionFailed`] if the name does not resolve.
pub fn resolve(domain: &str) -> Result<ResolvedAddrs> {
    let addrs = lookup_host(domain)
        .map_err(|e| WardenError::ResolutionFailed(format!("{domain}: {e}")))?;

    let mut out = ResolvedAddrs::default();
    for addr in addrs {
        match addr {
            IpAddr::V4(v4) => {
                out.v4.insert(v4);
            }
            IpAddr::V6(v6) => {
                out.v6.insert(v6);
            }
        }
    }

    if out.is_empty() {
        return Err(WardenError::ResolutionFailed(format!(
            "{domain}: getaddrinfo returned no usable addresses"
        )));
    }

    Ok(out)
}

/// Resolves `domain`, bounding the lookup to `timeout` on a helper thread so
/// a hung resolver cannot stall the monitor tick indefinitely.
///
/// # Errors
///
/// Returns [`WardenError::ResolutionFailed`] if the lookup fails or does not
/// complete within `timeout`.
pub fn resolve_with_timeout(domain: &str, timeout: Duration) -> Result<ResolvedAddrs> {
    let (tx, rx) = std::sync::mpsc::channel();
    let owned = domain.to_owned();
    std::thread::spawn(move || {
        let _ = tx.send(resolve(&owned));
    });

    rx.recv_timeout(timeout)
        .map_err(|_| WardenError::ResolutionFailed(format!("{domain}: timed out after {timeout:?}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_resolves_to_loopback() {
        let addrs = resolve("localhost").expect("localhost must resolve");
        assert!(!addrs.is_empty());
    }

    #[test]
    fn bogus_tld_fails() {
        let result = resolve("this-domain-should-not-exist.invalid-tld-xyz123");
        assert!(result.is_err());
    }

    #[test]
    fn contains_checks_both_families() {
        let mut addrs = ResolvedAddrs::default();
        addrs.v4.insert(Ipv4Addr::new(93, 184, 216, 34));
        assert!(addrs.contains(&IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
        assert!(!addrs.contains(&IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
    }
}

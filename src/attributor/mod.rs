//! Process attribution: map an observed socket (local address + protocol) to
//! the process that owns it, by joining the OS connection table against
//! per-process metadata. One trait and factory function, cfg-gated
//! construction per platform, generalized from "one client address -> one
//! process" to the connection-table enumeration the monitor loop needs
//! every tick.

use std::net::SocketAddr;

use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, iterate_sockets_info};

use crate::error::{Result, WardenError};

#[cfg(all(target_os = "linux", feature = "linux-enforcer"))]
mod linux;
#[cfg(all(target_os = "windows", feature = "windows"))]
mod windows;
#[cfg(not(any(
    all(target_os = "linux", feature = "linux-enforcer"),
    all(target_os = "windows", feature = "windows")
)))]
mod stub;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Process metadata recovered for the owner of a socket. `exe_basename`
/// falls back to `"unknown"` when the process has already exited between
/// the connection-table snapshot and the lookup (spec edge case: ephemeral
/// short-lived processes).
#[derive(Debug, Clone)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub uid: Option<u32>,
    pub exe_basename: String,
    pub exe_path: Option<String>,
}

impl ProcessIdentity {
    #[must_use]
    pub fn unknown(pid: u32) -> Self {
        Self {
            pid,
            uid: None,
            exe_basename: "unknown".to_owned(),
            exe_path: None,
        }
    }
}

/// A single row of the OS connection table, as enumerated this tick.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub local_addr: SocketAddr,
    pub remote_addr: Option<SocketAddr>,
    pub protocol: Protocol,
    pub pid: Option<u32>,
}

/// Resolves a pid to process metadata; the only part of attribution that
/// differs per platform.
pub trait ExeResolver: Send + Sync + 'static {
    fn resolve(&self, pid: u32) -> ProcessIdentity;
}

/// Looks up the process owning a socket, and enumerates the whole
/// connection table for the Monitor Loop's per-tick snapshot.
pub trait ProcessAttributor: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`WardenError::UnsupportedPlatform`] if connection-table
    /// enumeration is not available on this platform/build.
    fn attribute(&self, local_addr: SocketAddr, protocol: Protocol) -> Result<Option<ProcessIdentity>>;

    /// # Errors
    ///
    /// Returns [`WardenError::UnsupportedPlatform`] if connection-table
    /// enumeration is not available on this platform/build.
    fn enumerate(&self) -> Result<Vec<ConnectionRecord>>;
}

struct NetstatAttributor<R> {
    resolver: R,
}

impl<R: ExeResolver> ProcessAttributor for NetstatAttributor<R> {
    fn attribute(&self, local_addr: SocketAddr, protocol: Protocol) -> Result<Option<ProcessIdentity>> {
        let records = self.enumerate()?;
        Ok(records
            .into_iter()
            .find(|r| r.local_addr == local_addr && r.protocol == protocol)
            .and_then(|r| r.pid)
            .map(|pid| self.resolver.resolve(pid)))
    }

    fn enumerate(&self) -> Result<Vec<ConnectionRecord>> {
        let af_flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
        let proto_flags = ProtocolFlags::TCP | ProtocolFlags::UDP;
        let sockets = iterate_sockets_info(af_flags, proto_flags)
            .map_err(|e| WardenError::UnsupportedPlatform(format!("connection table unavailable: {e}")))?;

        #[cfg(all(target_os = "linux", feature = "linux-enforcer"))]
        let udp_remotes = linux::udp_remote_addrs();

        let mut out = Vec::new();
        for entry in sockets {
            let info = match entry {
                Ok(info) => info,
                Err(_) => continue,
            };
            let pid = info.associated_pids.first().copied();
            match info.protocol_socket_info {
                ProtocolSocketInfo::Tcp(tcp) => out.push(ConnectionRecord {
                    local_addr: SocketAddr::new(tcp.local_addr, tcp.local_port),
                    remote_addr: Some(SocketAddr::new(tcp.remote_addr, tcp.remote_port)),
                    protocol: Protocol::Tcp,
                    pid,
                }),
                ProtocolSocketInfo::Udp(udp) => {
                    let local = SocketAddr::new(udp.local_addr, udp.local_port);
                    #[cfg(all(target_os = "linux", feature = "linux-enforcer"))]
                    let remote_addr = udp_remotes.get(&local).copied();
                    #[cfg(not(all(target_os = "linux", feature = "linux-enforcer")))]
                    let remote_addr = None;
                    out.push(ConnectionRecord {
                        local_addr: local,
                        remote_addr,
                        protocol: Protocol::Udp,
                        pid,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[must_use]
pub fn process_attributor() -> Box<dyn ProcessAttributor> {
    platform_process_attributor()
}

#[cfg(all(target_os = "linux", feature = "linux-enforcer"))]
fn platform_process_attributor() -> Box<dyn ProcessAttributor> {
    Box::new(NetstatAttributor {
        resolver: linux::LinuxExeResolver,
    })
}

#[cfg(all(target_os = "windows", feature = "windows"))]
fn platform_process_attributor() -> Box<dyn ProcessAttributor> {
    Box::new(NetstatAttributor {
        resolver: windows::WindowsExeResolver,
    })
}

#[cfg(not(any(
    all(target_os = "linux", feature = "linux-enforcer"),
    all(target_os = "windows", feature = "windows")
)))]
fn platform_process_attributor() -> Box<dyn ProcessAttributor> {
    Box::new(NetstatAttributor {
        resolver: stub::StubExeResolver,
    })
}

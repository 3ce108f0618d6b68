use std::{
    collections::HashMap,
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use super::{ExeResolver, ProcessIdentity};

/// Reads `/proc/<pid>/exe` and `/proc/<pid>/status` directly to recover the
/// owning process's basename and uid.
pub struct LinuxExeResolver;

impl ExeResolver for LinuxExeResolver {
    fn resolve(&self, pid: u32) -> ProcessIdentity {
        let exe_path = fs::read_link(format!("/proc/{pid}/exe"))
            .ok()
            .and_then(|p| p.to_str().map(ToOwned::to_owned));

        let exe_basename = exe_path
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| "unknown".to_owned());

        let uid = fs::read_to_string(format!("/proc/{pid}/status"))
            .ok()
            .and_then(|status| {
                status.lines().find_map(|line| {
                    line.strip_prefix("Uid:")
                        .and_then(|rest| rest.split_whitespace().next())
                        .and_then(|s| s.parse::<u32>().ok())
                })
            });

        ProcessIdentity {
            pid,
            uid,
            exe_basename,
            exe_path,
        }
    }
}

/// `netstat2`'s UDP socket info carries no connected-peer address, so a
/// connected UDP socket's remote address is recovered straight from
/// `/proc/net/{udp,udp6}`'s `rem_address` column, keyed by local address.
/// Unconnected sockets (`rem_address` all-zero) are omitted.
pub fn udp_remote_addrs() -> HashMap<SocketAddr, SocketAddr> {
    let mut out = HashMap::new();
    for (path, v6) in [("/proc/net/udp", false), ("/proc/net/udp6", true)] {
        let Ok(contents) = fs::read_to_string(path) else {
            continue;
        };
        for line in contents.lines().skip(1) {
            let mut fields = line.split_whitespace();
            let Some(local) = fields.next() else { continue };
            let Some(remote) = fields.next() else { continue };
            let (Some(local), Some(remote)) = (parse_hex_addr(local, v6), parse_hex_addr(remote, v6)) else {
                continue;
            };
            if remote.ip().is_unspecified() && remote.port() == 0 {
                continue;
            }
            out.insert(local, remote);
        }
    }
    out
}

/// Parses a `/proc/net/{tcp,udp}` address field (`<hex addr>:<hex port>`).
/// The kernel formats the address as the hex digits of the little-endian
/// word(s), so they are parsed as big-endian ints and re-emitted as
/// little-endian bytes to recover network byte order.
fn parse_hex_addr(field: &str, v6: bool) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = if v6 {
        if addr.len() != 32 {
            return None;
        }
        let mut bytes = [0_u8; 16];
        for (chunk_idx, chunk) in addr.as_bytes().chunks(8).enumerate() {
            let word = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
            bytes[chunk_idx * 4..chunk_idx * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        IpAddr::V6(Ipv6Addr::from(bytes))
    } else {
        if addr.len() != 8 {
            return None;
        }
        let word = u32::from_str_radix(addr, 16).ok()?;
        IpAddr::V4(Ipv4Addr::from(word.to_le_bytes()))
    };
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_addr_v4_matches_loopback() {
        let addr = parse_hex_addr("0100007F:1F90", false).unwrap();
        assert_eq!(addr, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080));
    }

    #[test]
    fn parse_hex_addr_rejects_malformed_field() {
        assert!(parse_hex_addr("not-a-field", false).is_none());
        assert!(parse_hex_addr("0100007F", false).is_none());
    }

    #[test]
    fn udp_remote_addrs_does_not_panic_without_proc_access() {
        // Exercises the real /proc/net/udp{,6} on whatever host runs this
        // test; just asserts it returns instead of panicking.
        let _ = udp_remote_addrs();
    }
}

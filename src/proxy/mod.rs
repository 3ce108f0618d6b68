//! L7 proxy: a terminating HTTP/HTTPS MITM that attributes each inbound
//! flow to a process before forwarding. A dedicated worker owns its own
//! run loop (start/stop lifecycle, per-connection process lookup feeding
//! a decision), expressed as a dedicated `std::thread` running a blocking
//! `TcpListener::accept` loop, one thread per accepted connection.

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    attributor::{Protocol, ProcessAttributor},
    engine::{Decision, RuleEngine},
    error::{Result, WardenError},
};

#[cfg(feature = "proxy-tls")]
pub mod tls;

const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Owns only a shared `Arc<RuleEngine>` handle and the Attributor -- the
/// same "no back-pointers" rule the Monitor Loop follows.
pub struct L7Proxy {
    engine: Arc<RuleEngine>,
    attributor: Box<dyn ProcessAttributor>,
    listen: String,
    stopping: Arc<AtomicBool>,
    in_flight: Arc<std::sync::atomic::AtomicU64>,
}

impl L7Proxy {
    #[must_use]
    pub fn new(engine: Arc<RuleEngine>, attributor: Box<dyn ProcessAttributor>, listen: String) -> Self {
        Self {
            engine,
            attributor,
            listen,
            stopping: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopping)
    }

    /// Starts the accept loop on a dedicated worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::EnforcerFailed`] if the listener cannot bind
    /// (reusing the enforcer-failure variant is a stretch; binding is the
    /// proxy's only fallible setup step and the taxonomy has no dedicated
    /// I/O variant).
    pub fn spawn(self: Arc<Self>) -> Result<JoinHandle<()>> {
        let listener = TcpListener::bind(&self.listen)
            .map_err(|e| WardenError::enforcer_failed("proxy-bind", e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| WardenError::enforcer_failed("proxy-nonblocking", e.to_string()))?;

        info!(listen = %self.listen, "proxy listening");

        Ok(std::thread::spawn(move || self.accept_loop(&listener)))
    }

    fn accept_loop(&self, listener: &TcpListener) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    let engine = Arc::clone(&self.engine);
                    let in_flight = Arc::clone(&self.in_flight);
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    let decision = self.attribute_and_decide(peer, &stream);
                    std::thread::spawn(move || {
                        handle_flow(stream, engine, decision);
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    warn!(error = %e, "proxy accept error");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }

        self.drain(GRACE_PERIOD);
        info!("proxy stopped accepting connections");
    }

    fn drain(&self, grace_period: Duration) {
        let deadline = std::time::Instant::now() + grace_period;
        while self.in_flight.load(Ordering::SeqCst) > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    /// Looks up the process that owns `stream`'s local socket before any
    /// bytes are forwarded.
    fn attribute_and_decide(&self, _peer: std::net::SocketAddr, stream: &TcpStream) -> Option<String> {
        let local = stream.local_addr().ok()?;
        self.attributor
            .attribute(local, Protocol::Tcp)
            .ok()
            .flatten()
            .map(|id| id.exe_basename)
    }
}

/// Parses the first request's target (CONNECT target or `Host` header,
/// never the resolved IP, so name-based rules match cleanly) and evaluates
/// it against the engine. Denies before completing the CONNECT or issuing
/// any upstream request.
fn handle_flow(mut stream: TcpStream, engine: Arc<RuleEngine>, app: Option<String>) {
    let Some(app) = app else {
        debug!("proxy: no process attribution for flow, allowing by default");
        return;
    };

    let mut buf = [0_u8; 4096];
    let Ok(n) = stream.read(&mut buf) else {
        return;
    };
    if n == 0 {
        return;
    }

    let Some(target_host) = parse_target_host(&buf[..n]) else {
        warn!("proxy: could not parse request target, dropping flow");
        return;
    };

    // Match on the request's target host/IP literal itself, never a fresh
    // resolution: a name target is looked up against the rule's cached
    // hostname, not a new DNS answer that may disagree with what the rule
    // actually has enforced.
    let decision = match target_host.parse::<std::net::IpAddr>() {
        Ok(ip) => engine.evaluate(&app, ip),
        Err(_) => engine.evaluate_name(&app, &target_host),
    };

    match decision {
        Decision::Deny(rule_id) => {
            let _ = engine.store().log_attempt(
                Some(rule_id),
                &app,
                &stream.peer_addr().map(|a| a.to_string()).unwrap_or_default(),
                &target_host,
                "proxy",
            );
            info!(app, target = %target_host, "proxy denied flow");
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        Decision::Allow => {
            debug!(app, target = %target_host, "proxy allowed flow (MITM forwarding out of scope for this module)");
            let _ = stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
        }
    }
}

/// Extracts the request target: the `CONNECT host:port` target line, or
/// the `Host` header for plain HTTP, whichever the buffer contains.
fn parse_target_host(buf: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(buf).ok()?;
    let first_line = text.lines().next()?;

    if let Some(rest) = first_line.strip_prefix("CONNECT ") {
        let target = rest.split_whitespace().next()?;
        return Some(target.rsplit_once(':').map_or(target, |(host, _)| host).to_owned());
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(buf).is_ok() {
        for header in req.headers.iter() {
            if header.name.eq_ignore_ascii_case("host") {
                let value = std::str::from_utf8(header.value).ok()?;
                return Some(value.rsplit_once(':').map_or(value, |(host, _)| host).to_owned());
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_connect_target_strips_port() {
        let req = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";
        assert_eq!(parse_target_host(req).as_deref(), Some("example.com"));
    }

    #[test]
    fn parse_host_header_strips_port() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com:8080\r\nUser-Agent: test\r\n\r\n";
        assert_eq!(parse_target_host(req).as_deref(), Some("example.com"));
    }

    #[test]
    fn parse_missing_target_is_none() {
        assert!(parse_target_host(b"garbage\r\n\r\n").is_none());
    }
}

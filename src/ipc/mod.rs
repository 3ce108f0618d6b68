//! Control-plane wire protocol: newline-delimited JSON request/response
//! enums over a local socket, covering the operator-intent operations
//! (`AddRule`/`RemoveRule`/`ListActive`/`Stats`/`TailAttempts`/`Status`)
//! plus the daemon-lifecycle ops (`Reload`/`Stop`) every long-running
//! daemon needs.

use std::io::{BufRead, BufReader, Write};

use anyhow::{Context, Result};
use interprocess::local_socket::{GenericFilePath, GenericNamespaced, Name, prelude::*};
use serde::{Deserialize, Serialize};

pub const SOCKET_PRINT_NAME: &str = "wardend.sock";
pub const SOCKET_FS_FALLBACK: &str = "/tmp/wardend.sock";
pub const SOCKET_ENV_VAR: &str = "EGRESS_WARDEN_SOCKET";

/// Builds the default IPC socket name for this platform.
///
/// # Errors
///
/// Returns an error if the platform-specific socket name cannot be
/// constructed.
pub fn socket_name() -> Result<Name<'static>> {
    socket_name_with_override(None).map(|(name, _)| name)
}

/// Builds the IPC socket name, honoring an explicit override (CLI flag or
/// `EGRESS_WARDEN_SOCKET`) over the platform default. Returns the name plus,
/// when the socket is filesystem-backed, the path that should be unlinked
/// on startup/shutdown.
///
/// # Errors
///
/// Returns an error if the platform-specific socket name cannot be
/// constructed.
pub fn socket_name_with_override(
    override_socket: Option<&str>,
) -> Result<(Name<'static>, Option<std::path::PathBuf>)> {
    if let Some(path) = override_socket {
        let name = path
            .to_owned()
            .to_fs_name::<GenericFilePath>()
            .with_context(|| format!("failed to build local socket name from '{path}'"))?;
        return Ok((name, Some(std::path::PathBuf::from(path))));
    }

    if GenericNamespaced::is_supported() {
        let name = SOCKET_PRINT_NAME
            .to_ns_name::<GenericNamespaced>()
            .context("failed to build namespaced local socket name")?;
        Ok((name, None))
    } else {
        let name = SOCKET_FS_FALLBACK
            .to_fs_name::<GenericFilePath>()
            .context("failed to build filesystem local socket name")?;
        Ok((name, Some(std::path::PathBuf::from(SOCKET_FS_FALLBACK))))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    AddRule(AddRuleRequest),
    RemoveRule { rule_id: i64 },
    ListActive,
    Stats,
    TailAttempts { count: u32 },
    Status,
    Reload,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddRuleRequest {
    pub app: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    OkAddRule { rule_id: i64 },
    OkRemoveRule { status: RemoveStatusWire },
    OkListActive { rules: Vec<RuleInfo> },
    OkStats { apps: Vec<AppStatsInfo> },
    OkTailAttempts { attempts: Vec<AttemptInfo> },
    OkStatus(StatusResponse),
    OkReload,
    OkStop,
    Err(ErrorResponse),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoveStatusWire {
    Ok,
    NotFound,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleInfo {
    pub id: i64,
    pub app: String,
    pub target: String,
    pub target_kind: String,
    pub resolved_ips: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatsInfo {
    pub app: String,
    pub connections: u64,
    pub blocked_attempts: u64,
    pub unique_destinations: u64,
    pub first_seen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptInfo {
    pub id: i64,
    pub rule_id: Option<i64>,
    pub timestamp: String,
    pub app: String,
    pub source: String,
    pub target: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub uptime_ms: u128,
    pub config_path: String,
    pub socket: String,
    pub active_rule_count: usize,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
}

/// Serializes `value` as JSON and writes it as a single line terminated by `\n`.
///
/// # Errors
///
/// Returns an error if JSON serialization fails or the underlying writer fails.
pub fn write_json_line<W: Write, T: Serialize>(mut w: W, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value).context("failed to serialize JSON")?;
    line.push(b'\n');
    w.write_all(&line).context("failed to write JSON line")?;
    w.flush().ok();
    Ok(())
}

/// Reads a single `\n` terminated line and deserializes it from JSON.
///
/// # Errors
///
/// Returns an error if reading fails or the input is not valid JSON for `T`.
pub fn read_json_line<R: BufRead, T: for<'de> Deserialize<'de>>(mut r: R) -> Result<T> {
    let mut line = String::new();
    r.read_line(&mut line).context("failed to read JSON line")?;
    let value = serde_json::from_str::<T>(&line).context("failed to deserialize JSON")?;
    Ok(value)
}

/// Sends one request and waits for one response over the same stream.
///
/// # Errors
///
/// Returns an error if writing the request fails, reading fails, or JSON
/// parsing fails.
pub fn client_roundtrip(
    stream: &mut interprocess::local_socket::Stream,
    req: &Request,
) -> Result<Response> {
    write_json_line(&mut *stream, req)?;
    let reader = BufReader::new(&*stream);
    read_json_line(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rule_request_roundtrips_through_json() {
        let req = Request::AddRule(AddRuleRequest {
            app: "curl".to_owned(),
            target: "example.com".to_owned(),
        });
        let mut buf = Vec::new();
        write_json_line(&mut buf, &req).unwrap();
        let parsed: Request = read_json_line(&buf[..]).unwrap();
        match parsed {
            Request::AddRule(r) => {
                assert_eq!(r.app, "curl");
                assert_eq!(r.target, "example.com");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn error_response_roundtrips() {
        let resp = Response::Err(ErrorResponse {
            message: "boom".to_owned(),
        });
        let mut buf = Vec::new();
        write_json_line(&mut buf, &resp).unwrap();
        let parsed: Response = read_json_line(&buf[..]).unwrap();
        assert!(matches!(parsed, Response::Err(e) if e.message == "boom"));
    }
}

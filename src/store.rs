use std::{
    collections::BTreeSet,
    net::{Ipv4Addr, Ipv6Addr},
    path::Path,
    str::FromStr,
    sync::Mutex,
};

use rusqlite::{Connection, OptionalExtension, params};
use strum_macros::{Display, EnumString};

use crate::error::{Result, WardenError};

pub type RuleId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum TargetKind {
    Ip,
    Domain,
}

impl TargetKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Domain => "domain",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        Self::from_str(s).map_err(|_| {
            WardenError::StoreUnavailable(format!("unknown target_kind '{s}' in store row"))
        })
    }
}

/// A persistent record of operator intent to block an (app, target) pair.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub app: String,
    pub target: String,
    pub target_kind: TargetKind,
    pub resolved_v4: BTreeSet<Ipv4Addr>,
    pub resolved_v6: BTreeSet<Ipv6Addr>,
    pub created_at: String,
    pub active: bool,
}

impl Rule {
    #[must_use]
    pub fn all_ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = self.resolved_v4.iter().map(ToString::to_string).collect();
        ips.extend(self.resolved_v6.iter().map(ToString::to_string));
        ips
    }
}

#[derive(Debug, Clone)]
pub struct AttemptLogEntry {
    pub id: i64,
    pub rule_id: Option<RuleId>,
    pub timestamp: String,
    pub app: String,
    pub source: String,
    pub target: String,
    pub detail: String,
}

/// Embedded transactional store for `blocking_rules` and `blocked_attempts`.
/// Sole source of truth for operator intent; every write is synchronous and
/// serialized behind the single connection mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if absent) the SQLite-backed store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] if the database cannot be
    /// opened or the schema cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| WardenError::StoreUnavailable(format!("failed to open {}: {e}", path.display())))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| WardenError::StoreUnavailable(format!("failed to open in-memory store: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS blocking_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                app TEXT NOT NULL,
                target TEXT NOT NULL,
                target_kind TEXT NOT NULL,
                resolved_ips TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS blocked_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id INTEGER,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                app TEXT NOT NULL,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                detail TEXT NOT NULL,
                FOREIGN KEY (rule_id) REFERENCES blocking_rules(id)
            );
            ",
        )
        .map_err(|e| WardenError::StoreUnavailable(format!("failed to create schema: {e}")))?;
        Ok(())
    }

    /// Inserts a new active rule and returns its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] on a commit failure.
    pub fn insert_rule(
        &self,
        app: &str,
        target: &str,
        kind: TargetKind,
        resolved_v4: &BTreeSet<Ipv4Addr>,
        resolved_v6: &BTreeSet<Ipv6Addr>,
    ) -> Result<RuleId> {
        let resolved_ips = join_ips(resolved_v4, resolved_v6);
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO blocking_rules (app, target, target_kind, resolved_ips, active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![app, target, kind.as_str(), resolved_ips],
        )
        .map_err(|e| WardenError::StoreUnavailable(format!("failed to insert rule: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetches a single rule by id regardless of `active` state.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] on a query failure.
    pub fn get_rule(&self, id: RuleId) -> Result<Option<Rule>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.query_row(
            "SELECT id, app, target, target_kind, resolved_ips, created_at, active
             FROM blocking_rules WHERE id = ?1",
            params![id],
            row_to_rule,
        )
        .optional()
        .map_err(|e| WardenError::StoreUnavailable(format!("failed to fetch rule {id}: {e}")))?
        .transpose()
    }

    /// Lists every rule with `active = 1`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] on a query failure.
    pub fn list_active(&self) -> Result<Vec<Rule>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, app, target, target_kind, resolved_ips, created_at, active
                 FROM blocking_rules WHERE active = 1",
            )
            .map_err(|e| WardenError::StoreUnavailable(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map([], row_to_rule)
            .map_err(|e| WardenError::StoreUnavailable(format!("failed to run query: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            let rule = row.map_err(|e| WardenError::StoreUnavailable(format!("failed to read row: {e}")))?;
            out.push(rule?);
        }
        Ok(out)
    }

    /// Marks a rule active or inactive.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] on a commit failure.
    pub fn set_active(&self, id: RuleId, active: bool) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE blocking_rules SET active = ?2 WHERE id = ?1",
            params![id, i64::from(active)],
        )
        .map_err(|e| WardenError::StoreUnavailable(format!("failed to update rule {id}: {e}")))?;
        Ok(())
    }

    /// Atomically replaces the resolved address sets for a domain rule.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] on a commit failure.
    pub fn update_resolved(
        &self,
        id: RuleId,
        resolved_v4: &BTreeSet<Ipv4Addr>,
        resolved_v6: &BTreeSet<Ipv6Addr>,
    ) -> Result<()> {
        let resolved_ips = join_ips(resolved_v4, resolved_v6);
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE blocking_rules SET resolved_ips = ?2 WHERE id = ?1",
            params![id, resolved_ips],
        )
        .map_err(|e| WardenError::StoreUnavailable(format!("failed to update resolved ips for {id}: {e}")))?;
        Ok(())
    }

    /// Appends an attempt log entry. Best-effort from the caller's
    /// perspective: failures are surfaced, never silently dropped, but the
    /// Monitor Loop only logs them (see monitor module).
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] on a commit failure.
    pub fn log_attempt(
        &self,
        rule_id: Option<RuleId>,
        app: &str,
        source: &str,
        target: &str,
        detail: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO blocked_attempts (rule_id, app, source, target, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rule_id, app, source, target, detail],
        )
        .map_err(|e| WardenError::StoreUnavailable(format!("failed to log attempt: {e}")))?;
        Ok(())
    }

    /// Returns the most recent `n` attempt log entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::StoreUnavailable`] on a query failure.
    pub fn tail_attempts(&self, n: u32) -> Result<Vec<AttemptLogEntry>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, rule_id, timestamp, app, source, target, detail
                 FROM blocked_attempts ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| WardenError::StoreUnavailable(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map(params![n], |row| {
                Ok(AttemptLogEntry {
                    id: row.get(0)?,
                    rule_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    app: row.get(3)?,
                    source: row.get(4)?,
                    target: row.get(5)?,
                    detail: row.get(6)?,
                })
            })
            .map_err(|e| WardenError::StoreUnavailable(format!("failed to run query: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| WardenError::StoreUnavailable(format!("failed to read row: {e}")))?);
        }
        Ok(out)
    }
}

fn join_ips(v4: &BTreeSet<Ipv4Addr>, v6: &BTreeSet<Ipv6Addr>) -> String {
    let mut parts: Vec<String> = v4.iter().map(ToString::to_string).collect();
    parts.extend(v6.iter().map(ToString::to_string));
    parts.join(",")
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Rule>> {
    let id: RuleId = row.get(0)?;
    let app: String = row.get(1)?;
    let target: String = row.get(2)?;
    let target_kind_raw: String = row.get(3)?;
    let resolved_ips: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let active: i64 = row.get(6)?;

    Ok((|| {
        let target_kind = TargetKind::parse(&target_kind_raw)?;
        let mut resolved_v4 = BTreeSet::new();
        let mut resolved_v6 = BTreeSet::new();
        for part in resolved_ips.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if let Ok(v4) = part.parse::<Ipv4Addr>() {
                resolved_v4.insert(v4);
            } else if let Ok(v6) = part.parse::<Ipv6Addr>() {
                resolved_v6.insert(v6);
            }
        }
        Ok(Rule {
            id,
            app,
            target,
            target_kind,
            resolved_v4,
            resolved_v6,
            created_at,
            active: active != 0,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_fetch_roundtrip() {
        let store = Store::open_in_memory().expect("open store");
        let mut v4 = BTreeSet::new();
        v4.insert("93.184.216.34".parse().unwrap());
        let id = store
            .insert_rule("firefox", "example.net", TargetKind::Domain, &v4, &BTreeSet::new())
            .expect("insert rule");

        let rule = store.get_rule(id).expect("query ok").expect("rule present");
        assert_eq!(rule.app, "firefox");
        assert_eq!(rule.target_kind, TargetKind::Domain);
        assert!(rule.active);
        assert_eq!(rule.resolved_v4.len(), 1);
    }

    #[test]
    fn set_inactive_excludes_from_list_active() {
        let store = Store::open_in_memory().expect("open store");
        let id = store
            .insert_rule("chrome", "1.2.3.4", TargetKind::Ip, &BTreeSet::new(), &BTreeSet::new())
            .expect("insert rule");

        assert_eq!(store.list_active().expect("list").len(), 1);
        store.set_active(id, false).expect("deactivate");
        assert_eq!(store.list_active().expect("list").len(), 0);
    }

    #[test]
    fn attempt_log_tail_orders_newest_first() {
        let store = Store::open_in_memory().expect("open store");
        store.log_attempt(None, "app1", "10.0.0.1", "1.2.3.4", "d1").unwrap();
        store.log_attempt(None, "app2", "10.0.0.2", "1.2.3.5", "d2").unwrap();

        let tail = store.tail_attempts(10).expect("tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].app, "app2");
        assert_eq!(tail[1].app, "app1");
    }
}

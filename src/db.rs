//! Usage-record persistence.
//!
//! SQLite store for billing records. Writes happen on a best-effort task
//! after the response completes; reads back the window aggregates that feed
//! the billing gate and `GET /v1/usage`.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::accounts::{AccountId, GroupId, UserId};
use crate::error::AppResult;
use crate::forward::usage::Usage;

#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub account_id: AccountId,
    pub model: String,
    pub usage: Usage,
    pub cost_usd: f64,
    pub client_disconnect: bool,
    pub recorded_at: DateTime<Utc>,
}

pub struct UsageStore {
    conn: Mutex<Connection>,
}

fn default_db_path() -> PathBuf {
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("relay-gateway");
    std::fs::create_dir_all(&p).ok();
    p.push("usage.db");
    p
}

fn optimize_connection(conn: &Connection) {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "cache_size", "-64000").ok();
    conn.pragma_update(None, "temp_store", "MEMORY").ok();
}

impl UsageStore {
    pub fn open_default() -> AppResult<Self> {
        Self::open(default_db_path())
    }

    pub fn open(path: PathBuf) -> AppResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        optimize_connection(&conn);
        conn.execute(
            "create table if not exists usage_records (
                id integer primary key autoincrement,
                request_id text,
                timestamp integer,
                user_id integer,
                group_id integer,
                account_id integer,
                model text,
                input_tokens integer,
                output_tokens integer,
                cache_creation_tokens integer,
                cache_read_tokens integer,
                cost_usd real,
                client_disconnect integer
            )",
            [],
        )?;
        conn.execute(
            "create index if not exists idx_usage_user_group_ts
                on usage_records(user_id, group_id, timestamp desc)",
            [],
        )
        .ok();
        conn.execute(
            "create index if not exists idx_usage_ts on usage_records(timestamp desc)",
            [],
        )
        .ok();
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn record(&self, rec: &UsageRecord) -> AppResult<()> {
        let conn = self.conn.lock().expect("usage store poisoned");
        conn.execute(
            "insert into usage_records (
                request_id, timestamp, user_id, group_id, account_id, model,
                input_tokens, output_tokens, cache_creation_tokens,
                cache_read_tokens, cost_usd, client_disconnect
            ) values (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                rec.request_id,
                rec.recorded_at.timestamp(),
                rec.user_id,
                rec.group_id,
                rec.account_id,
                rec.model,
                rec.usage.input,
                rec.usage.output,
                rec.usage.cache_creation,
                rec.usage.cache_read,
                rec.cost_usd,
                rec.client_disconnect as i64,
            ],
        )?;
        Ok(())
    }

    /// Spend in USD for a user within a group since `since`.
    pub fn spent_since(
        &self,
        user_id: UserId,
        group_id: GroupId,
        since: DateTime<Utc>,
    ) -> AppResult<f64> {
        let conn = self.conn.lock().expect("usage store poisoned");
        let mut stmt = conn.prepare_cached(
            "select ifnull(sum(cost_usd), 0) from usage_records
                where user_id = ?1 and group_id = ?2 and timestamp >= ?3",
        )?;
        let spent =
            stmt.query_row(params![user_id, group_id, since.timestamp()], |row| {
                row.get(0)
            })?;
        Ok(spent)
    }

    /// (requests, tokens, cost) for a user since `since`, any group.
    pub fn user_summary_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> AppResult<(i64, i64, f64)> {
        let conn = self.conn.lock().expect("usage store poisoned");
        let mut stmt = conn.prepare_cached(
            "select count(*),
                    ifnull(sum(input_tokens + output_tokens + cache_creation_tokens + cache_read_tokens), 0),
                    ifnull(sum(cost_usd), 0)
                from usage_records where user_id = ?1 and timestamp >= ?2",
        )?;
        let row = stmt.query_row(params![user_id, since.timestamp()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(row)
    }
}

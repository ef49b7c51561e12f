//! information_schema metadata and session establishment. Every worker opens
//! its own session; nothing here is shared across the pool.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder};
use tracing::warn;

use crate::config::Config;
use crate::error::AccelError;

pub const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Opens a session with the base options for `cfg`.
///
/// # Errors
/// Returns [`AccelError::Connect`] once the attempt budget is exhausted.
pub fn connect(cfg: &Config) -> Result<Conn> {
    connect_session(cfg, cfg.mysql_opts())
}

/// Opens a session with caller-supplied options, retrying up to
/// [`CONNECT_ATTEMPTS`] times with a fixed backoff after the first failure.
///
/// # Errors
/// Returns [`AccelError::Connect`] once the attempt budget is exhausted.
pub fn connect_session(cfg: &Config, builder: OptsBuilder) -> Result<Conn> {
    let opts = Opts::from(builder);
    let mut last_message = String::new();
    for attempt in 1..=CONNECT_ATTEMPTS {
        if attempt > 1 {
            thread::sleep(CONNECT_BACKOFF);
        }
        match Conn::new(opts.clone()) {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                warn!(
                    "connect attempt {attempt}/{CONNECT_ATTEMPTS} to {}:{} failed: {err}",
                    cfg.host, cfg.port
                );
                last_message = err.to_string();
            }
        }
    }
    Err(AccelError::Connect {
        host: cfg.host.clone(),
        port: cfg.port,
        user: cfg.username.clone(),
        attempts: CONNECT_ATTEMPTS,
        message: last_message,
    }
    .into())
}

/// Base tables of `database`, ordered by name and optionally restricted to
/// a caller-supplied set.
///
/// # Errors
/// Returns an error when the information_schema query fails.
pub fn list_base_tables(
    conn: &mut Conn,
    database: &str,
    filter: Option<&[String]>,
) -> Result<Vec<String>> {
    let tables: Vec<String> = conn
        .exec(
            "SELECT TABLE_NAME FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
            (database,),
        )
        .context("failed to list base tables")?;
    Ok(match filter {
        Some(included) => tables
            .into_iter()
            .filter(|table| included.iter().any(|name| name == table))
            .collect(),
        None => tables,
    })
}

/// Row count of one table via `SELECT COUNT(*)`.
///
/// # Errors
/// Returns an error when the count query fails.
pub fn row_count(conn: &mut Conn, database: &str, table: &str) -> Result<u64> {
    let count: Option<u64> = conn
        .query_first(format!("SELECT COUNT(*) FROM `{database}`.`{table}`"))
        .with_context(|| format!("failed to count rows of `{table}`"))?;
    Ok(count.unwrap_or(0))
}

/// One column as reported by information_schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    pub name: String,
    pub data_type: String,
}

impl ColumnType {
    #[must_use]
    pub fn is_blob(&self) -> bool {
        self.data_type.to_ascii_lowercase().contains("blob")
    }

    #[must_use]
    pub fn is_text(&self) -> bool {
        self.data_type.to_ascii_lowercase().contains("text")
    }
}

/// Columns of `table` in ordinal order.
///
/// # Errors
/// Returns an error when the information_schema query fails.
pub fn column_types(conn: &mut Conn, database: &str, table: &str) -> Result<Vec<ColumnType>> {
    let rows: Vec<(String, String)> = conn
        .exec(
            "SELECT COLUMN_NAME, DATA_TYPE FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .with_context(|| format!("failed to read columns of `{table}`"))?;
    Ok(rows
        .into_iter()
        .map(|(name, data_type)| ColumnType { name, data_type })
        .collect())
}

/// Columns of the primary key, or of the first unique key when no primary
/// key exists; empty when the table has neither.
///
/// # Errors
/// Returns an error when the information_schema query fails.
pub fn primary_or_unique_keys(
    conn: &mut Conn,
    database: &str,
    table: &str,
) -> Result<Vec<String>> {
    let rows: Vec<(String, String)> = conn
        .exec(
            "SELECT INDEX_NAME, COLUMN_NAME FROM information_schema.STATISTICS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND NON_UNIQUE = 0 \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
            (database, table),
        )
        .with_context(|| format!("failed to read keys of `{table}`"))?;

    let mut indexes: Vec<(String, Vec<String>)> = Vec::new();
    for (index_name, column) in rows {
        match indexes.iter_mut().find(|(name, _)| *name == index_name) {
            Some((_, columns)) => columns.push(column),
            None => indexes.push((index_name, vec![column])),
        }
    }
    if let Some((_, columns)) = indexes.iter().find(|(name, _)| name == "PRIMARY") {
        return Ok(columns.clone());
    }
    Ok(indexes
        .into_iter()
        .next()
        .map(|(_, columns)| columns)
        .unwrap_or_default())
}

/// SELECT-list expressions for one table's export.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub select_exprs: Vec<String>,
    /// True when any column is blob- or text-typed; such tables cannot be
    /// streamed under the bulk-packet limits and take the fallback path.
    pub paging_required: bool,
}

#[must_use]
pub fn export_expressions(columns: &[ColumnType]) -> ExportPlan {
    let mut select_exprs = Vec::with_capacity(columns.len());
    let mut paging_required = false;
    for column in columns {
        if column.is_blob() {
            select_exprs.push(format!("HEX(`{}`)", column.name));
        } else {
            select_exprs.push(format!("`{}`", column.name));
        }
        if column.is_blob() || column.is_text() {
            paging_required = true;
        }
    }
    ExportPlan {
        select_exprs,
        paging_required,
    }
}

/// Column placeholders and SET clauses for one table's bulk load.
#[derive(Debug, Clone)]
pub struct ImportPlan {
    pub placeholders: Vec<String>,
    pub set_exprs: Vec<String>,
}

#[must_use]
pub fn import_expressions(columns: &[ColumnType]) -> ImportPlan {
    let mut placeholders = Vec::with_capacity(columns.len());
    let mut set_exprs = Vec::new();
    for column in columns {
        if column.is_blob() {
            placeholders.push(format!("@{}", column.name));
            set_exprs.push(format!("`{0}`=UNHEX(@{0})", column.name));
        } else {
            placeholders.push(format!("`{}`", column.name));
        }
    }
    ImportPlan {
        placeholders,
        set_exprs,
    }
}

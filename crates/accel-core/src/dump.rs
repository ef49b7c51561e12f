//! Per-table export: the streaming CSV path with sharding, retry and
//! row-count verification, and the mysqldump fallback for tables the
//! streaming path cannot safely carry.

use std::fs::{self, File};
use std::path::Path;

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use mysql::prelude::Queryable;
use mysql::Value;
use tracing::{debug, info, warn};

use crate::codec::ShardWriter;
use crate::config::Config;
use crate::csv;
use crate::error::AccelError;
use crate::layout;
use crate::probe::{self, ColumnType, ExportPlan};
use crate::process;

pub const DUMP_ATTEMPTS: u32 = 5;
pub const FALLBACK_ATTEMPTS: u32 = 20;

/// Dumps one table into `dir`, either as CSV shards or, for blob/text
/// tables, through the mysqldump fallback.
///
/// # Errors
/// Returns an error once the per-table retry budget is exhausted.
pub fn dump_table(cfg: &Config, dir: &Path, table: &str) -> Result<()> {
    let mut conn = probe::connect(cfg)?;
    let expected = if cfg.check_count {
        let count = probe::row_count(&mut conn, &cfg.database, table)?;
        layout::write_info(dir, table, count)?;
        Some(count)
    } else {
        None
    };
    let columns = probe::column_types(&mut conn, &cfg.database, table)?;
    let plan = probe::export_expressions(&columns);

    if plan.paging_required {
        let keys = probe::primary_or_unique_keys(&mut conn, &cfg.database, table)?;
        drop(conn);
        if keys.is_empty() {
            debug!("`{table}` has no primary or unique key, skipping key pages");
        } else {
            write_key_pages(cfg, dir, table, &keys)?;
        }
        fallback_table(cfg, dir, table)?;
        layout::remove_key_pages(dir, table)?;
        return Ok(());
    }
    drop(conn);

    let mut attempt = 0;
    loop {
        attempt += 1;
        match stream_table(cfg, dir, table, &columns, &plan, expected) {
            Ok(rows) => {
                info!("dumped `{table}` ({} rows)", commas(rows));
                return Ok(());
            }
            Err(err) => {
                warn!("dump attempt {attempt}/{DUMP_ATTEMPTS} for `{table}` failed: {err:#}");
                layout::remove_shards(dir, table)?;
                if attempt >= DUMP_ATTEMPTS {
                    return Err(err.context(AccelError::DumpRetriesExhausted {
                        table: table.to_string(),
                        attempts: DUMP_ATTEMPTS,
                    }));
                }
            }
        }
    }
}

/// One dump attempt: stream the full result set into rotating shards.
fn stream_table(
    cfg: &Config,
    dir: &Path,
    table: &str,
    columns: &[ColumnType],
    plan: &ExportPlan,
    expected: Option<u64>,
) -> Result<u64> {
    let mut conn = probe::connect(cfg)?;
    let mut query = format!(
        "SELECT {} FROM `{}`.`{}`",
        plan.select_exprs.join(", "),
        cfg.database,
        table
    );
    if let Some(limit) = cfg.sample {
        query.push_str(&format!(" LIMIT {limit}"));
    }
    let header: Vec<String> = columns.iter().map(|column| column.name.clone()).collect();

    let result = conn
        .query_iter(&query)
        .with_context(|| format!("export query for `{table}` failed"))?;
    let mut rows_written = 0u64;
    let mut shard: Option<ShardWriter> = None;
    for row in result {
        let row = row.with_context(|| format!("fetch from `{table}` failed"))?;
        if shard.is_none() {
            let ordinal = shard_ordinal(rows_written);
            let path = dir.join(layout::shard_name(table, ordinal));
            debug!("opening shard {}", path.display());
            let mut writer = ShardWriter::create(&path)?;
            csv::write_header(&mut writer, &header)
                .with_context(|| format!("failed to write header for `{table}`"))?;
            shard = Some(writer);
        }
        let fields: Vec<Option<Vec<u8>>> =
            row.unwrap().into_iter().map(value_to_field).collect();
        csv::write_row(shard.as_mut().expect("open shard"), &fields)
            .with_context(|| format!("failed to write row of `{table}`"))?;
        rows_written += 1;
        if rows_written % layout::SHARD_ROWS == 0 {
            shard.take().expect("open shard").finish()?;
        }
    }
    if let Some(writer) = shard.take() {
        writer.finish()?;
    }

    if let Some(expected) = expected {
        if expected != rows_written {
            return Err(AccelError::RowCountMismatch {
                table: table.to_string(),
                expected,
                actual: rows_written,
            }
            .into());
        }
    }
    Ok(rows_written)
}

/// Shard ordinals carry the driver page counter at the moment the shard is
/// opened, so the first shard of a table is always `000001`.
fn shard_ordinal(rows_written: u64) -> u64 {
    rows_written / layout::PAGE_ROWS + 1
}

fn value_to_field(value: Value) -> Option<Vec<u8>> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(bytes),
        other => Some(other.as_sql(true).into_bytes()),
    }
}

/// Key-page sidecars for a paging-eligible table: flat JSON arrays of the
/// primary-or-unique key values, one file per `--page-size` rows. They are
/// removed again once the table's dump succeeds.
fn write_key_pages(cfg: &Config, dir: &Path, table: &str, keys: &[String]) -> Result<()> {
    let mut conn = probe::connect(cfg)?;
    let select_list: Vec<String> = keys.iter().map(|key| format!("`{key}`")).collect();
    let query = format!(
        "SELECT {} FROM `{}`.`{}`",
        select_list.join(", "),
        cfg.database,
        table
    );
    let result = conn
        .query_iter(query)
        .with_context(|| format!("key scan for `{table}` failed"))?;

    let per_page = (cfg.page_size.max(1) as usize).saturating_mul(keys.len());
    let mut page: Vec<serde_json::Value> = Vec::with_capacity(per_page);
    let mut page_no = 0u64;
    for row in result {
        let row = row.with_context(|| format!("key fetch from `{table}` failed"))?;
        for value in row.unwrap() {
            page.push(key_json_value(value));
        }
        if page.len() >= per_page {
            page_no += 1;
            write_key_page(dir, table, page_no, &page)?;
            page.clear();
        }
    }
    if !page.is_empty() {
        page_no += 1;
        write_key_page(dir, table, page_no, &page)?;
    }
    debug!("wrote {page_no} key pages for `{table}`");
    Ok(())
}

fn write_key_page(
    dir: &Path,
    table: &str,
    page_no: u64,
    values: &[serde_json::Value],
) -> Result<()> {
    let path = dir.join(layout::key_page_name(table, page_no));
    let body = serde_json::to_string(values).context("failed to serialize key page")?;
    fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
}

fn key_json_value(value: Value) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,
        Value::Bytes(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        Value::Int(number) => serde_json::Value::from(number),
        Value::UInt(number) => serde_json::Value::from(number),
        other => serde_json::Value::String(other.as_sql(true)),
    }
}

/// Dumps one table through the vendor dumper into `<table>.sql.gz`.
///
/// # Errors
/// Returns an error once the fallback retry budget is exhausted.
pub fn fallback_table(cfg: &Config, dir: &Path, table: &str) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match run_mysqldump(cfg, dir, table) {
            Ok(()) => {
                info!("dumped `{table}` via mysqldump fallback");
                return Ok(());
            }
            Err(err) => {
                warn!(
                    "fallback attempt {attempt}/{FALLBACK_ATTEMPTS} for `{table}` failed: {err:#}"
                );
                let _ = fs::remove_file(dir.join(layout::fallback_name(table)));
                if attempt >= FALLBACK_ATTEMPTS {
                    return Err(err.context(AccelError::FallbackRetriesExhausted {
                        table: table.to_string(),
                        attempts: FALLBACK_ATTEMPTS,
                    }));
                }
            }
        }
    }
}

fn run_mysqldump(cfg: &Config, dir: &Path, table: &str) -> Result<()> {
    let path = dir.join(layout::fallback_name(table));
    let file =
        File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut encoder = GzEncoder::new(file, Compression::default());

    let mut args = cfg.client_args();
    args.extend(
        [
            "--no-create-info",
            "--skip-triggers",
            "--single-transaction=TRUE",
            "--max_allowed_packet=2G",
        ]
        .map(str::to_string),
    );
    args.push(cfg.database.clone());
    args.push(table.to_string());

    let output = process::stream_stdout(
        "mysqldump",
        &args,
        &[("MYSQL_PWD".to_string(), cfg.password.clone())],
        &mut encoder,
    )?;
    encoder
        .finish()
        .with_context(|| format!("failed to finish {}", path.display()))?;
    if !output.success() {
        bail!("mysqldump exited with status {}", output.code);
    }
    if !output.stderr.trim().is_empty() {
        bail!("mysqldump wrote to stderr: {}", output.stderr.trim());
    }
    Ok(())
}

/// Digit grouping for row counts in log lines.
pub(crate) fn commas(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_ordinals_track_the_page_counter() {
        assert_eq!(shard_ordinal(0), 1);
        assert_eq!(shard_ordinal(9_999), 1);
        assert_eq!(shard_ordinal(10_000), 2);
        // The shard after the 1,000,000-row close opens at page 101.
        assert_eq!(shard_ordinal(1_000_000), 101);
        assert_eq!(shard_ordinal(2_000_000), 201);
    }

    #[test]
    fn null_and_bytes_map_to_csv_fields() {
        assert_eq!(value_to_field(Value::NULL), None);
        assert_eq!(
            value_to_field(Value::Bytes(b"abc".to_vec())),
            Some(b"abc".to_vec())
        );
        assert_eq!(value_to_field(Value::Int(-7)), Some(b"-7".to_vec()));
        assert_eq!(value_to_field(Value::UInt(42)), Some(b"42".to_vec()));
    }

    #[test]
    fn key_values_serialize_flat() {
        assert_eq!(key_json_value(Value::Int(3)), serde_json::json!(3));
        assert_eq!(
            key_json_value(Value::Bytes(b"k1".to_vec())),
            serde_json::json!("k1")
        );
        assert_eq!(key_json_value(Value::NULL), serde_json::Value::Null);
    }

    #[test]
    fn commas_group_thousands() {
        assert_eq!(commas(0), "0");
        assert_eq!(commas(999), "999");
        assert_eq!(commas(1_000), "1,000");
        assert_eq!(commas(2_500_000), "2,500,000");
        assert_eq!(commas(1_234_567_890), "1,234,567,890");
    }
}

//! Per-table restore: shards are decompressed into a named pipe and bulk
//! loaded in ordinal order; fallback dumps are replayed through the vendor
//! client reading the same pipe.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use mysql::prelude::Queryable;
use mysql::LocalInfileHandler;
use tracing::{debug, info};

use crate::codec;
use crate::config::Config;
use crate::dump::commas;
use crate::error::AccelError;
use crate::layout::{self, TableData, TableInfo};
use crate::probe;
use crate::process;

/// Restores one table from its unpacked data files.
///
/// # Errors
/// Returns an error when a load or its feeder fails, or when the loaded row
/// count disagrees with the table's `.info` sidecar.
pub fn restore_table(cfg: &Config, dir: &Path, table: &str, data: &TableData) -> Result<()> {
    let info = layout::read_info(dir, table)?;
    let fifo = dir.join(layout::fifo_name(table));
    let result = if let Some(fallback) = &data.fallback {
        restore_fallback(cfg, table, &fifo, fallback, info.as_ref())
    } else {
        restore_shards(cfg, table, &fifo, &data.csv_shards, info.as_ref())
    };
    let _ = fs::remove_file(&fifo);
    result
}

fn restore_shards(
    cfg: &Config,
    table: &str,
    fifo: &Path,
    shards: &[PathBuf],
    info: Option<&TableInfo>,
) -> Result<()> {
    if shards.is_empty() {
        if let Some(info) = info {
            if info.record_count != 0 {
                return Err(AccelError::RowCountMismatch {
                    table: table.to_string(),
                    expected: info.record_count,
                    actual: 0,
                }
                .into());
            }
        }
        info!("restored `{table}` (0 rows)");
        return Ok(());
    }

    let mut conn = probe::connect(cfg)?;
    let columns = probe::column_types(&mut conn, &cfg.database, table)?;
    drop(conn);
    if columns.is_empty() {
        bail!("table `{table}` does not exist in `{}`", cfg.database);
    }
    let plan = probe::import_expressions(&columns);
    let statement = load_statement(table, fifo, &plan.placeholders, &plan.set_exprs);

    let mut loaded = 0u64;
    for shard in shards {
        loaded += load_csv_shard(cfg, table, fifo, shard, &statement)?;
    }
    if let Some(info) = info {
        if info.record_count != loaded {
            return Err(AccelError::RowCountMismatch {
                table: table.to_string(),
                expected: info.record_count,
                actual: loaded,
            }
            .into());
        }
    }
    info!("restored `{table}` ({} rows)", commas(loaded));
    Ok(())
}

fn load_csv_shard(
    cfg: &Config,
    table: &str,
    fifo: &Path,
    shard: &Path,
    statement: &str,
) -> Result<u64> {
    // A feeder that cannot open the shard would leave the loader blocked on
    // the pipe, so the shard is checked first.
    File::open(shard)
        .with_context(|| format!("failed to open {}", shard.display()))?;
    codec::create_fifo(fifo)?;
    let cancel = Arc::new(AtomicBool::new(false));
    let feeder = codec::feed_fifo(shard, fifo, cancel.clone());

    let load_result = (|| -> Result<u64> {
        let opts = cfg
            .mysql_opts()
            .local_infile_handler(Some(fifo_infile_handler()));
        let mut conn = probe::connect_session(cfg, opts)?;
        conn.query_drop("SET foreign_key_checks=0, unique_checks=0")
            .context("failed to relax load checks")?;
        conn.query_drop(statement)
            .with_context(|| format!("bulk load of {} failed", shard.display()))?;
        Ok(conn.affected_rows())
    })();

    if load_result.is_err() {
        cancel.store(true, Ordering::SeqCst);
    }
    let feeder_result = feeder
        .join()
        .map_err(|_| anyhow!("feeder thread for `{table}` panicked"))?;

    let rows = load_result.map_err(|err| {
        anyhow::Error::from(AccelError::Load {
            table: table.to_string(),
            message: format!("{err:#}"),
        })
    })?;
    let fed = feeder_result
        .with_context(|| format!("decompression of {} failed", shard.display()))?;
    debug!(
        "loaded {} rows ({} bytes) from {}",
        commas(rows),
        fed,
        shard.display()
    );
    Ok(rows)
}

fn restore_fallback(
    cfg: &Config,
    table: &str,
    fifo: &Path,
    shard: &Path,
    info: Option<&TableInfo>,
) -> Result<()> {
    File::open(shard)
        .with_context(|| format!("failed to open {}", shard.display()))?;
    codec::create_fifo(fifo)?;
    let cancel = Arc::new(AtomicBool::new(false));
    let feeder = codec::feed_fifo(shard, fifo, cancel.clone());

    let load_result = (|| -> Result<()> {
        let stdin = File::open(fifo)
            .with_context(|| format!("failed to open {}", fifo.display()))?;
        let mut args = cfg.client_args();
        args.push(cfg.database.clone());
        let output = process::run_with_stdin_file(
            "mysql",
            &args,
            &[("MYSQL_PWD".to_string(), cfg.password.clone())],
            stdin,
        )?;
        if !output.success() {
            bail!(
                "mysql client exited with status {}: {}",
                output.code,
                output.stderr.trim()
            );
        }
        Ok(())
    })();

    if load_result.is_err() {
        cancel.store(true, Ordering::SeqCst);
    }
    let feeder_result = feeder
        .join()
        .map_err(|_| anyhow!("feeder thread for `{table}` panicked"))?;

    load_result.map_err(|err| {
        anyhow::Error::from(AccelError::Load {
            table: table.to_string(),
            message: format!("{err:#}"),
        })
    })?;
    feeder_result.with_context(|| format!("decompression of {} failed", shard.display()))?;

    if let Some(info) = info {
        let mut conn = probe::connect(cfg)?;
        let count = probe::row_count(&mut conn, &cfg.database, table)?;
        if count != info.record_count {
            return Err(AccelError::RowCountMismatch {
                table: table.to_string(),
                expected: info.record_count,
                actual: count,
            }
            .into());
        }
    }
    info!("restored `{table}` from fallback dump");
    Ok(())
}

fn load_statement(
    table: &str,
    fifo: &Path,
    placeholders: &[String],
    set_exprs: &[String],
) -> String {
    let mut statement = format!(
        "LOAD DATA LOCAL INFILE '{}' INTO TABLE `{table}` CHARACTER SET utf8 \
         COLUMNS TERMINATED BY ',' OPTIONALLY ENCLOSED BY '\"' IGNORE 1 ROWS ({})",
        fifo.display(),
        placeholders.join(", ")
    );
    if !set_exprs.is_empty() {
        statement.push_str(&format!(" SET {}", set_exprs.join(", ")));
    }
    statement
}

/// The driver hands the statement's file name back to the client; the
/// handler streams that pipe into the connection.
fn fifo_infile_handler() -> LocalInfileHandler {
    LocalInfileHandler::new(|name, writer| {
        let path = PathBuf::from(String::from_utf8_lossy(name).into_owned());
        let mut source = File::open(&path)?;
        io::copy(&mut source, writer)?;
        Ok(())
    })
}

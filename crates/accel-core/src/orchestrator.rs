//! Top-level dump and restore state machines composing the probe, the
//! worker pool, the rewriter and the archive codecs.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use mysql::prelude::Queryable;
use tracing::{info, warn};

use crate::config::Config;
use crate::ddl;
use crate::dump;
use crate::error::AccelError;
use crate::layout;
use crate::pool;
use crate::probe;
use crate::process;
use crate::restore;

/// Dumps the configured database into `<directory>/<database>.accel.dump`.
///
/// # Errors
/// Returns the first failure of any stage or worker.
pub fn run_dump(cfg: &Config) -> Result<PathBuf> {
    let work_dir = cfg.work_dir();
    prepare_work_dir(&work_dir)?;
    dump_schema(cfg, &work_dir)?;
    let tables = enumerate_tables(cfg)?;
    info!(
        "dumping {} tables from `{}` with {} workers",
        tables.len(),
        cfg.database,
        cfg.jobs
    );
    pool::run_tasks(cfg.jobs, tables, |table| {
        let outcome = if cfg.is_fallback_table(&table) {
            dump::fallback_table(cfg, &work_dir, &table)
        } else {
            dump::dump_table(cfg, &work_dir, &table)
        };
        outcome.with_context(|| format!("dump of `{table}` failed"))
    })?;
    let archive = archive_work_dir(cfg, &work_dir)?;
    fs::remove_dir_all(&work_dir)
        .with_context(|| format!("failed to remove {}", work_dir.display()))?;
    info!("wrote {}", archive.display());
    Ok(archive)
}

/// Restores an archive into the configured target database.
///
/// # Errors
/// Returns the first failure of any stage or worker.
pub fn run_restore(cfg: &Config) -> Result<()> {
    let archive = cfg.archive.as_ref().ok_or_else(|| {
        AccelError::Config("--file is required for restore".to_string())
    })?;
    let source_dir = unpack_archive(cfg, archive)?;
    let schema = detokenise_schema(cfg, &source_dir)?;
    split_schema(cfg, &source_dir, &schema)?;
    if cfg.skip_create_db {
        info!("skipping stage-1 DDL");
    } else {
        apply_stage1(cfg, &source_dir)?;
    }
    if let Some(hook) = &cfg.post_schema_command {
        run_post_schema_hook(cfg, hook)?;
    }

    let tables = layout::discover_tables(&source_dir)?;
    info!(
        "restoring {} tables into `{}` with {} workers",
        tables.len(),
        cfg.database,
        cfg.jobs
    );
    let items: Vec<(String, layout::TableData)> = tables.into_iter().collect();
    pool::run_tasks(cfg.jobs, items, |(table, data)| {
        restore::restore_table(cfg, &source_dir, &table, &data)
            .with_context(|| format!("restore of `{table}` failed"))
    })?;

    apply_stage_dir(cfg, &source_dir, layout::STAGE2_DIR)?;
    apply_stage_dir(cfg, &source_dir, layout::STAGE3_DIR)?;

    fs::remove_dir_all(&source_dir)
        .with_context(|| format!("failed to remove {}", source_dir.display()))?;
    info!("restore of `{}` complete", cfg.database);
    Ok(())
}

fn prepare_work_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        warn!("removing stale working directory {}", dir.display());
        fs::remove_dir_all(dir)
            .with_context(|| format!("failed to remove {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
}

/// Stage `DumpSchema`: vendor schema dump plus the tokenised rewrite.
fn dump_schema(cfg: &Config, work_dir: &Path) -> Result<()> {
    let orig_path = work_dir.join(layout::SCHEMA_ORIG);
    let mut file = File::create(&orig_path)
        .with_context(|| format!("failed to create {}", orig_path.display()))?;
    let mut args = cfg.client_args();
    args.extend(
        ["--no-data", "--routines", "--single-transaction=TRUE", "-B"].map(str::to_string),
    );
    args.push(cfg.database.clone());
    let output = process::stream_stdout(
        "mysqldump",
        &args,
        &[("MYSQL_PWD".to_string(), cfg.password.clone())],
        &mut file,
    )?;
    if !output.success() {
        return Err(AccelError::Schema {
            stage: "schema dump".to_string(),
            message: format!(
                "mysqldump exited with status {}: {}",
                output.code,
                output.stderr.trim()
            ),
        }
        .into());
    }
    if !output.stderr.trim().is_empty() {
        warn!("mysqldump: {}", output.stderr.trim());
    }

    let schema = fs::read_to_string(&orig_path)
        .with_context(|| format!("failed to read {}", orig_path.display()))?;
    let tokenised = ddl::rewrite_schema(&schema, &cfg.database);
    let tokenised_path = work_dir.join(layout::SCHEMA_TOKENISED);
    fs::write(&tokenised_path, tokenised)
        .with_context(|| format!("failed to write {}", tokenised_path.display()))?;
    info!("dumped schema of `{}`", cfg.database);
    Ok(())
}

fn enumerate_tables(cfg: &Config) -> Result<Vec<String>> {
    let mut conn = probe::connect(cfg)?;
    probe::list_base_tables(&mut conn, &cfg.database, cfg.tables.as_deref())
}

/// Stage `Archive`: tar the working directory, then rename the intermediate
/// to its final `.accel.dump` name.
fn archive_work_dir(cfg: &Config, work_dir: &Path) -> Result<PathBuf> {
    let tar_path = cfg.directory.join(format!("{}.tar", cfg.database));
    let file = File::create(&tar_path)
        .with_context(|| format!("failed to create {}", tar_path.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(&cfg.database, work_dir)
        .with_context(|| format!("failed to archive {}", work_dir.display()))?;
    let encoder = builder
        .into_inner()
        .context("failed to finalize archive")?;
    encoder.finish().context("failed to finish archive")?;

    let archive = cfg.archive_path();
    fs::rename(&tar_path, &archive)
        .with_context(|| format!("failed to rename to {}", archive.display()))?;
    Ok(archive)
}

/// Stage `Unpack`: extract the archive and locate the source directory
/// derived from the archive stem.
fn unpack_archive(cfg: &Config, archive: &Path) -> Result<PathBuf> {
    let stem = archive
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(layout::ARCHIVE_SUFFIX))
        .ok_or_else(|| {
            AccelError::Config(format!(
                "archive name must end with {}: {}",
                layout::ARCHIVE_SUFFIX,
                archive.display()
            ))
        })?;
    let file = File::open(archive)
        .with_context(|| format!("failed to open {}", archive.display()))?;
    fs::create_dir_all(&cfg.directory)
        .with_context(|| format!("failed to create {}", cfg.directory.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(&cfg.directory)
        .with_context(|| format!("failed to unpack {}", archive.display()))?;
    let source_dir = cfg.directory.join(stem);
    if !source_dir.is_dir() {
        bail!(
            "{} did not contain the expected directory {}",
            archive.display(),
            source_dir.display()
        );
    }
    info!("unpacked {} into {}", archive.display(), source_dir.display());
    Ok(source_dir)
}

/// Stage `Detokenise`: substitute the target database name.
fn detokenise_schema(cfg: &Config, source_dir: &Path) -> Result<String> {
    let tokenised_path = source_dir.join(layout::SCHEMA_TOKENISED);
    let tokenised = fs::read_to_string(&tokenised_path)
        .with_context(|| format!("failed to read {}", tokenised_path.display()))?;
    let schema = ddl::detokenise(&tokenised, &cfg.database);
    let schema_path = source_dir.join(layout::SCHEMA_DETOKENISED);
    fs::write(&schema_path, &schema)
        .with_context(|| format!("failed to write {}", schema_path.display()))?;
    Ok(schema)
}

/// Stage `SplitStages`: the three-stage split, or the whole schema as
/// stage 1 when the split is not requested.
fn split_schema(cfg: &Config, source_dir: &Path, schema: &str) -> Result<()> {
    if cfg.accel_keys {
        let stages = ddl::split_stages(schema);
        ddl::write_stage_files(source_dir, &stages)
    } else {
        let stage1 = source_dir.join(layout::STAGE1_FILE);
        fs::write(&stage1, schema)
            .with_context(|| format!("failed to write {}", stage1.display()))
    }
}

/// Stage `ApplyStage1`: the vendor client executes the stage-1 DDL; only
/// the client handles routine delimiters.
fn apply_stage1(cfg: &Config, source_dir: &Path) -> Result<()> {
    let path = source_dir.join(layout::STAGE1_FILE);
    let stdin =
        File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    let output = process::run_with_stdin_file(
        "mysql",
        &cfg.client_args(),
        &[("MYSQL_PWD".to_string(), cfg.password.clone())],
        stdin,
    )?;
    if !output.success() {
        return Err(AccelError::Schema {
            stage: "stage 1".to_string(),
            message: format!(
                "mysql client exited with status {}: {}",
                output.code,
                output.stderr.trim()
            ),
        }
        .into());
    }
    info!("applied stage-1 DDL");
    Ok(())
}

fn run_post_schema_hook(cfg: &Config, hook: &str) -> Result<()> {
    info!("running post-schema command");
    let output = process::run_shell(
        hook,
        &[("MYSQL_PWD".to_string(), cfg.password.clone())],
    )?;
    if !output.stdout.trim().is_empty() {
        info!("post-schema stdout: {}", output.stdout.trim());
    }
    if !output.stderr.trim().is_empty() {
        warn!("post-schema stderr: {}", output.stderr.trim());
    }
    if !output.success() {
        return Err(AccelError::Schema {
            stage: "post-schema command".to_string(),
            message: format!("exited with status {}", output.code),
        }
        .into());
    }
    Ok(())
}

/// Stages `ApplyStage2`/`ApplyStage3`: per-table ALTERs in parallel; the
/// pool return is the barrier between them.
fn apply_stage_dir(cfg: &Config, source_dir: &Path, stage: &str) -> Result<()> {
    let dir = source_dir.join(stage);
    if !dir.is_dir() {
        return Ok(());
    }
    let mut files: Vec<PathBuf> = Vec::new();
    let entries =
        fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "ddl") {
            files.push(path);
        }
    }
    files.sort();
    info!("applying {} statements from {stage}", files.len());
    pool::run_tasks(cfg.jobs, files, |path| {
        let sql = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut conn = probe::connect(cfg)?;
        conn.query_drop(&sql).map_err(|err| {
            anyhow::Error::from(AccelError::Schema {
                stage: stage.to_string(),
                message: format!("{}: {err}", path.display()),
            })
        })?;
        Ok(())
    })
}

//! Naming contract for everything the engine leaves on disk: data shards,
//! fallback dumps, sidecars, schema stages and the final archive.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Rows per shard; bulk loads slow sharply beyond this.
pub const SHARD_ROWS: u64 = 1_000_000;
/// Rows per driver page during export.
pub const PAGE_ROWS: u64 = 10_000;

pub const ARCHIVE_SUFFIX: &str = ".accel.dump";
pub const SCHEMA_ORIG: &str = "schema.ddl.orig";
pub const SCHEMA_TOKENISED: &str = "schema.ddl.tokenised";
pub const SCHEMA_DETOKENISED: &str = "schema.ddl";
pub const STAGE1_FILE: &str = "accel_schema_stage_1.ddl";
pub const STAGE2_DIR: &str = "stage_2";
pub const STAGE3_DIR: &str = "stage_3";

const SHARD_SUFFIX: &str = ".csv.gz";
const FALLBACK_SUFFIX: &str = ".sql.gz";

#[must_use]
pub fn shard_name(table: &str, ordinal: u64) -> String {
    format!("{table}.{ordinal:06}{SHARD_SUFFIX}")
}

#[must_use]
pub fn fallback_name(table: &str) -> String {
    format!("{table}{FALLBACK_SUFFIX}")
}

#[must_use]
pub fn info_name(table: &str) -> String {
    format!("{table}.info")
}

#[must_use]
pub fn key_page_name(table: &str, ordinal: u64) -> String {
    format!("{table}_keys.{ordinal:06}.json")
}

#[must_use]
pub fn fifo_name(table: &str) -> String {
    format!("{table}.fifo")
}

#[must_use]
pub fn archive_name(database: &str) -> String {
    format!("{database}{ARCHIVE_SUFFIX}")
}

/// Per-table row count sidecar, written when verification is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub record_count: u64,
}

/// Writes the `.info` sidecar for `table`.
///
/// # Errors
/// Returns an error when the sidecar cannot be written.
pub fn write_info(dir: &Path, table: &str, record_count: u64) -> Result<()> {
    let path = dir.join(info_name(table));
    let body = serde_json::to_string(&TableInfo { record_count })
        .context("failed to serialize table info")?;
    fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))
}

/// Reads the `.info` sidecar for `table`, if one exists.
///
/// # Errors
/// Returns an error when the sidecar exists but cannot be read or parsed.
pub fn read_info(dir: &Path, table: &str) -> Result<Option<TableInfo>> {
    let path = dir.join(info_name(table));
    let body = match fs::read_to_string(&path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    let info = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(info))
}

/// One table's data files inside an unpacked archive. A table has either CSV
/// shards or a fallback dump, never both.
#[derive(Debug, Clone, Default)]
pub struct TableData {
    /// CSV shards in increasing ordinal order.
    pub csv_shards: Vec<PathBuf>,
    pub fallback: Option<PathBuf>,
}

/// Splits a shard file name into table name and ordinal.
fn parse_shard_name(name: &str) -> Option<(&str, u64)> {
    let stem = name.strip_suffix(SHARD_SUFFIX)?;
    let (table, ordinal) = stem.rsplit_once('.')?;
    if table.is_empty() || ordinal.len() != 6 {
        return None;
    }
    let ordinal = ordinal.parse().ok()?;
    Some((table, ordinal))
}

/// Enumerates the data files of every table present in `dir`.
///
/// # Errors
/// Returns an error when the directory cannot be read.
pub fn discover_tables(dir: &Path) -> Result<BTreeMap<String, TableData>> {
    let mut tables: BTreeMap<String, Vec<(u64, PathBuf)>> = BTreeMap::new();
    let mut fallbacks: BTreeMap<String, PathBuf> = BTreeMap::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some((table, ordinal)) = parse_shard_name(name) {
            tables
                .entry(table.to_string())
                .or_default()
                .push((ordinal, entry.path()));
        } else if let Some(table) = name.strip_suffix(FALLBACK_SUFFIX) {
            fallbacks.insert(table.to_string(), entry.path());
        }
    }

    let mut discovered: BTreeMap<String, TableData> = BTreeMap::new();
    for (table, mut shards) in tables {
        shards.sort_by_key(|(ordinal, _)| *ordinal);
        discovered.entry(table).or_default().csv_shards =
            shards.into_iter().map(|(_, path)| path).collect();
    }
    for (table, path) in fallbacks {
        discovered.entry(table).or_default().fallback = Some(path);
    }
    Ok(discovered)
}

/// Shard paths for one table, in load order.
///
/// # Errors
/// Returns an error when the directory cannot be read.
pub fn shard_paths(dir: &Path, table: &str) -> Result<Vec<PathBuf>> {
    let discovered = discover_tables(dir)?;
    Ok(discovered
        .get(table)
        .map(|data| data.csv_shards.clone())
        .unwrap_or_default())
}

/// Removes every shard written for `table`, used between dump attempts.
///
/// # Errors
/// Returns an error when an existing shard cannot be removed.
pub fn remove_shards(dir: &Path, table: &str) -> Result<()> {
    for path in shard_paths(dir, table)? {
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Removes the key-page sidecars of `table`, kept only while its dump runs.
///
/// # Errors
/// Returns an error when the directory cannot be read or a page removed.
pub fn remove_key_pages(dir: &Path, table: &str) -> Result<()> {
    let prefix = format!("{table}_keys.");
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(".json") {
            let path = entry.path();
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_archive_contract() {
        assert_eq!(shard_name("users", 1), "users.000001.csv.gz");
        assert_eq!(shard_name("logs", 250), "logs.000250.csv.gz");
        assert_eq!(fallback_name("files"), "files.sql.gz");
        assert_eq!(info_name("users"), "users.info");
        assert_eq!(key_page_name("files", 3), "files_keys.000003.json");
        assert_eq!(archive_name("shop"), "shop.accel.dump");
    }

    #[test]
    fn shard_names_parse_back() {
        assert_eq!(parse_shard_name("users.000001.csv.gz"), Some(("users", 1)));
        assert_eq!(
            parse_shard_name("audit.log.000012.csv.gz"),
            Some(("audit.log", 12))
        );
        assert_eq!(parse_shard_name("users.csv.gz"), None);
        assert_eq!(parse_shard_name("users.000001.sql.gz"), None);
    }

    #[test]
    fn info_round_trips_and_absence_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_info(dir.path(), "users", 42).expect("write info");
        let info = read_info(dir.path(), "users").expect("read info");
        assert_eq!(info, Some(TableInfo { record_count: 42 }));
        assert_eq!(read_info(dir.path(), "orders").expect("read info"), None);
    }

    #[test]
    fn discovery_orders_shards_and_separates_fallbacks() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in [
            "logs.000250.csv.gz",
            "logs.000001.csv.gz",
            "logs.000101.csv.gz",
            "files.sql.gz",
            "users.info",
            "schema.ddl.orig",
        ] {
            fs::write(dir.path().join(name), b"x").expect("write file");
        }
        let discovered = discover_tables(dir.path()).expect("discover");
        assert_eq!(discovered.len(), 2);
        let logs = &discovered["logs"];
        let ordinals: Vec<String> = logs
            .csv_shards
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            ordinals,
            vec![
                "logs.000001.csv.gz",
                "logs.000101.csv.gz",
                "logs.000250.csv.gz"
            ]
        );
        assert!(logs.fallback.is_none());
        assert!(discovered["files"].csv_shards.is_empty());
        assert!(discovered["files"].fallback.is_some());
    }

    #[test]
    fn remove_shards_leaves_other_tables_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["a.000001.csv.gz", "a.000101.csv.gz", "ab.000001.csv.gz"] {
            fs::write(dir.path().join(name), b"x").expect("write file");
        }
        remove_shards(dir.path(), "a").expect("remove");
        assert!(!dir.path().join("a.000001.csv.gz").exists());
        assert!(!dir.path().join("a.000101.csv.gz").exists());
        assert!(dir.path().join("ab.000001.csv.gz").exists());
    }

    #[test]
    fn remove_key_pages_targets_one_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["files_keys.000001.json", "files_keys.000002.json", "other_keys.000001.json"] {
            fs::write(dir.path().join(name), b"[]").expect("write file");
        }
        remove_key_pages(dir.path(), "files").expect("remove");
        assert!(!dir.path().join("files_keys.000001.json").exists());
        assert!(dir.path().join("other_keys.000001.json").exists());
    }
}

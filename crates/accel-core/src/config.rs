use std::path::PathBuf;

use mysql::OptsBuilder;

use crate::layout;

/// The requested top-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Dump,
    Restore,
}

/// Resolved run configuration, threaded explicitly through the orchestrator
/// and every worker entry point.
#[derive(Debug, Clone)]
pub struct Config {
    pub action: Action,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Source database on dump, target database on restore.
    pub database: String,
    /// Maximum number of tables processed concurrently.
    pub jobs: usize,
    /// Working root; dumps run in `<directory>/<database>/`.
    pub directory: PathBuf,
    /// Archive to restore from.
    pub archive: Option<PathBuf>,
    /// Optional LIMIT applied to every table export.
    pub sample: Option<u64>,
    /// Verify row counts against `.info` sidecars.
    pub check_count: bool,
    /// Tables forced through the mysqldump fallback exporter.
    pub fallback_tables: Vec<String>,
    /// Restrict the dump to these tables.
    pub tables: Option<Vec<String>>,
    /// Rows per key-page sidecar.
    pub page_size: u64,
    /// Split restore DDL into the three-stage form.
    pub accel_keys: bool,
    /// Skip the stage-1 DDL on restore.
    pub skip_create_db: bool,
    /// Shell command executed after the stage-1 DDL.
    pub post_schema_command: Option<String>,
}

impl Config {
    #[must_use]
    pub fn work_dir(&self) -> PathBuf {
        self.directory.join(&self.database)
    }

    #[must_use]
    pub fn archive_path(&self) -> PathBuf {
        self.directory.join(layout::archive_name(&self.database))
    }

    #[must_use]
    pub fn is_fallback_table(&self, table: &str) -> bool {
        self.fallback_tables.iter().any(|name| name == table)
    }

    /// Base session options: UTF-8 names, wire compression, default schema.
    #[must_use]
    pub fn mysql_opts(&self) -> OptsBuilder {
        OptsBuilder::new()
            .ip_or_hostname(Some(self.host.clone()))
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(Some(self.database.clone()))
            .init(vec!["SET NAMES utf8".to_string()])
            .compress(Some(mysql::Compression::default()))
    }

    /// Connection arguments shared by the vendor `mysql`/`mysqldump` clients.
    #[must_use]
    pub fn client_args(&self) -> Vec<String> {
        vec![
            "-h".to_string(),
            self.host.clone(),
            "-P".to_string(),
            self.port.to_string(),
            "-u".to_string(),
            self.username.clone(),
        ]
    }
}

#[cfg(test)]
pub(crate) fn test_config(action: Action) -> Config {
    Config {
        action,
        host: "localhost".to_string(),
        port: 3306,
        username: "root".to_string(),
        password: "secret".to_string(),
        database: "shop".to_string(),
        jobs: 4,
        directory: PathBuf::from("/tmp"),
        archive: None,
        sample: None,
        check_count: false,
        fallback_tables: Vec::new(),
        tables: None,
        page_size: 1000,
        accel_keys: false,
        skip_create_db: false,
        post_schema_command: None,
    }
}

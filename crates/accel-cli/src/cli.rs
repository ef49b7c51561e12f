use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ActionCli {
    Dump,
    Restore,
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Parallel logical dump/restore for MySQL-compatible servers"
)]
#[allow(clippy::struct_excessive_bools)]
pub struct AccelCli {
    #[arg(long, help = "Requested operation")]
    pub action: ActionCli,
    #[arg(long, default_value = "localhost", help = "Server host")]
    pub host: String,
    #[arg(long, default_value_t = 3306, help = "Server port")]
    pub port: u16,
    #[arg(long, help = "Account used for every session")]
    pub username: String,
    #[arg(long, help = "Password; taken from MYSQL_PWD when absent")]
    pub password: Option<String>,
    #[arg(long, help = "Source database on dump, target database on restore")]
    pub database: String,
    #[arg(long, default_value_t = 4, help = "Maximum concurrent tables")]
    pub jobs: usize,
    #[arg(long, default_value = "/tmp", help = "Working directory root")]
    pub directory: PathBuf,
    #[arg(
        long,
        required_if_eq("action", "restore"),
        help = "Archive to restore (required for restore)"
    )]
    pub file: Option<PathBuf>,
    #[arg(long, help = "LIMIT applied to every table export")]
    pub sample: Option<u64>,
    #[arg(long, help = "Verify row counts via .info sidecars")]
    pub check_count: bool,
    #[arg(
        long,
        value_delimiter = ',',
        help = "Tables forced through the mysqldump fallback"
    )]
    pub fallback_tables: Vec<String>,
    #[arg(
        long,
        value_delimiter = ',',
        help = "Restrict the dump to these tables"
    )]
    pub tables_string: Option<Vec<String>>,
    #[arg(long, default_value_t = 1000, help = "Rows per key page")]
    pub page_size: u64,
    #[arg(long, help = "Apply keys and constraints after the data loads")]
    pub accel_keys: bool,
    #[arg(long, help = "Skip the stage-1 DDL on restore")]
    pub skip_create_db: bool,
    #[arg(long, help = "Shell command executed after the stage-1 DDL")]
    pub post_schema_command: Option<String>,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)")]
    pub verbose: u8,
    #[arg(short, long, help = "Only log warnings and errors")]
    pub quiet: bool,
}

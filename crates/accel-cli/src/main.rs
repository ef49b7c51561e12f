#![deny(clippy::all, warnings)]

use std::env;

use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::info;

use accel_core::{run_dump, run_restore, Action, Config};

mod cli;

use cli::{AccelCli, ActionCli};

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = AccelCli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let cfg = build_config(cli)?;
    match cfg.action {
        Action::Dump => {
            let archive = run_dump(&cfg).map_err(|err| eyre!("{err:#}"))?;
            info!("dump complete: {}", archive.display());
        }
        Action::Restore => {
            run_restore(&cfg).map_err(|err| eyre!("{err:#}"))?;
            info!("restore complete");
        }
    }
    Ok(())
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("accel={level},accel_cli={level},accel_core={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn build_config(cli: AccelCli) -> Result<Config> {
    let password = match cli.password {
        Some(password) => password,
        None => env::var("MYSQL_PWD")
            .map_err(|_| eyre!("no password given and MYSQL_PWD is not set"))?,
    };
    Ok(Config {
        action: match cli.action {
            ActionCli::Dump => Action::Dump,
            ActionCli::Restore => Action::Restore,
        },
        host: cli.host,
        port: cli.port,
        username: cli.username,
        password,
        database: cli.database,
        jobs: cli.jobs,
        directory: cli.directory,
        archive: cli.file,
        sample: cli.sample,
        check_count: cli.check_count,
        fallback_tables: cli.fallback_tables,
        tables: cli.tables_string,
        page_size: cli.page_size,
        accel_keys: cli.accel_keys,
        skip_create_db: cli.skip_create_db,
        post_schema_command: cli.post_schema_command,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_lists_split_into_tables() {
        let cli = AccelCli::try_parse_from([
            "accel",
            "--action",
            "dump",
            "--username",
            "root",
            "--database",
            "shop",
            "--fallback-tables",
            "files,blobs",
            "--tables-string",
            "users,orders",
        ])
        .expect("parse dump args");
        assert_eq!(cli.fallback_tables, vec!["files", "blobs"]);
        assert_eq!(
            cli.tables_string.as_deref(),
            Some(["users".to_string(), "orders".to_string()].as_slice())
        );
    }

    #[test]
    fn restore_requires_an_archive() {
        let result = AccelCli::try_parse_from([
            "accel",
            "--action",
            "restore",
            "--username",
            "root",
            "--database",
            "shop",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn explicit_password_wins_over_the_environment() {
        let cli = AccelCli::try_parse_from([
            "accel",
            "--action",
            "dump",
            "--username",
            "root",
            "--password",
            "given",
            "--database",
            "shop",
        ])
        .expect("parse dump args");
        let cfg = build_config(cli).expect("build config");
        assert_eq!(cfg.password, "given");
        assert_eq!(cfg.action, Action::Dump);
        assert_eq!(cfg.jobs, 4);
        assert_eq!(cfg.page_size, 1000);
    }
}

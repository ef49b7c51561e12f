//! Rewrites vendor schema dumps: strips ownership directives, swaps the
//! database name for a portable token, and splits table DDL into three
//! stages so bulk loads run against keyless tables.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::layout::{STAGE1_FILE, STAGE2_DIR, STAGE3_DIR};

/// Placeholder substituted for the source database name.
pub const DB_TOKEN: &str = "#DATABASE#";

static DEFINER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:\*/)?\s*(?:/\*!\d+)?\s*DEFINER\s*=\s*(?:`[^`]+`|[^\s@`]+)@(?:`[^`]+`|[A-Za-z0-9._%-]+)\s*(?:SQL SECURITY DEFINER)?\s*(?:\*/)?\s*(?:SQL SECURITY DEFINER)?"#,
    )
    .expect("definer pattern")
});

static TABLE_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-- Table structure for table `([^`]+)`").expect("table header pattern")
});

/// Collapses any `DEFINER=user@host` directive, including its version-gated
/// comment wrappers and an optional `SQL SECURITY DEFINER` clause, to a
/// single space.
#[must_use]
pub fn strip_definer(line: &str) -> String {
    match DEFINER_RE.find(line) {
        None => line.to_string(),
        Some(first) => {
            let replaced = DEFINER_RE.replace_all(line, " ");
            if first.start() == 0 {
                replaced.trim_start().to_string()
            } else {
                replaced.into_owned()
            }
        }
    }
}

/// Replaces every whole-word occurrence of `database` with [`DB_TOKEN`].
#[must_use]
pub fn tokenise(text: &str, database: &str) -> String {
    let pattern = format!(r"\b{}\b", regex::escape(database));
    match Regex::new(&pattern) {
        Ok(re) => re.replace_all(text, DB_TOKEN).into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Substitutes the target database name for every token occurrence.
#[must_use]
pub fn detokenise(text: &str, target: &str) -> String {
    text.replace(DB_TOKEN, target)
}

/// Full dump-side rewrite: drops `ALTER DATABASE` lines, strips DEFINER
/// directives and tokenises the database name.
#[must_use]
pub fn rewrite_schema(ddl: &str, database: &str) -> String {
    let mut out = String::with_capacity(ddl.len());
    for line in ddl.lines() {
        if line.trim_start().starts_with("ALTER DATABASE") {
            continue;
        }
        out.push_str(&tokenise(&strip_definer(line), database));
        out.push('\n');
    }
    out
}

/// Result of the three-stage split: stage 1 holds the full schema with keys
/// removed from table bodies, stages 2 and 3 hold one ALTER statement per
/// table for keys and foreign-key constraints respectively.
#[derive(Debug, Default)]
pub struct SchemaStages {
    pub stage1: String,
    pub stage2: BTreeMap<String, String>,
    pub stage3: BTreeMap<String, String>,
}

#[derive(Debug, PartialEq, Eq)]
enum SplitState {
    /// Database-level statements, views and routines; passed through.
    Database,
    /// Saw a table header comment, waiting for its CREATE TABLE.
    TablePreamble,
    /// Inside the column list of a CREATE TABLE.
    Columns,
}

const KEY_PREFIXES: [&str; 4] = ["UNIQUE KEY", "FULLTEXT KEY", "SPATIAL KEY", "KEY"];

/// Splits a schema dump into the three-stage form with a line-oriented state
/// machine over the vendor dumper's output.
#[must_use]
pub fn split_stages(ddl: &str) -> SchemaStages {
    let mut stages = SchemaStages::default();
    let mut state = SplitState::Database;
    let mut table = String::new();
    let mut columns: Vec<String> = Vec::new();
    let mut key_fragments: Vec<String> = Vec::new();
    let mut constraint_fragments: Vec<String> = Vec::new();
    let mut has_auto_increment = false;

    for line in ddl.lines() {
        if state != SplitState::Columns {
            if let Some(captures) = TABLE_HEADER_RE.captures(line) {
                table = captures[1].to_string();
                state = SplitState::TablePreamble;
            } else if state == SplitState::TablePreamble
                && line.trim_start().starts_with("CREATE TABLE")
            {
                state = SplitState::Columns;
                columns.clear();
                key_fragments.clear();
                constraint_fragments.clear();
                has_auto_increment = false;
            }
            stages.stage1.push_str(line);
            stages.stage1.push('\n');
            continue;
        }

        let trimmed = line.trim();
        let body = line.trim_end().trim_end_matches(',');
        if trimmed.starts_with(TABLE_CLOSE_PREFIX) {
            stages.stage1.push_str(&columns.join(",\n"));
            stages.stage1.push('\n');
            stages.stage1.push_str(line);
            stages.stage1.push('\n');
            if !key_fragments.is_empty() {
                stages
                    .stage2
                    .insert(table.clone(), alter_statement(&table, &key_fragments));
            }
            if !constraint_fragments.is_empty() {
                stages
                    .stage3
                    .insert(table.clone(), alter_statement(&table, &constraint_fragments));
            }
            state = SplitState::Database;
        } else if trimmed.starts_with("PRIMARY KEY") {
            // An AUTO_INCREMENT column already implies its primary key via
            // the MODIFY fragment below.
            if !has_auto_increment {
                key_fragments.push(format!("ADD {}", body.trim_start()));
            }
        } else if KEY_PREFIXES.iter().any(|prefix| trimmed.starts_with(prefix)) {
            key_fragments.push(format!("ADD {}", body.trim_start()));
        } else if trimmed.starts_with("CONSTRAINT") {
            constraint_fragments.push(format!("ADD {}", body.trim_start()));
        } else if body.contains("AUTO_INCREMENT") {
            has_auto_increment = true;
            columns.push(body.replace(" AUTO_INCREMENT", ""));
            key_fragments.insert(
                0,
                format!("MODIFY {} PRIMARY KEY", body.trim_start()),
            );
        } else {
            columns.push(body.to_string());
        }
    }

    stages
}

/// The line that ends a CREATE TABLE body.
const TABLE_CLOSE_PREFIX: &str = ") ENGINE=";

fn alter_statement(table: &str, fragments: &[String]) -> String {
    format!("ALTER TABLE `{table}`\n  {};\n", fragments.join(",\n  "))
}

/// Writes the stage files into `dir`: `accel_schema_stage_1.ddl` plus one
/// `<table>.ddl` per non-empty stage-2/stage-3 statement.
///
/// # Errors
/// Returns an error when a stage file or directory cannot be written.
pub fn write_stage_files(dir: &Path, stages: &SchemaStages) -> Result<()> {
    let stage1 = dir.join(STAGE1_FILE);
    fs::write(&stage1, &stages.stage1)
        .with_context(|| format!("failed to write {}", stage1.display()))?;
    for (subdir, statements) in [(STAGE2_DIR, &stages.stage2), (STAGE3_DIR, &stages.stage3)] {
        if statements.is_empty() {
            continue;
        }
        let stage_dir = dir.join(subdir);
        fs::create_dir_all(&stage_dir)
            .with_context(|| format!("failed to create {}", stage_dir.display()))?;
        for (table, statement) in statements {
            let path = stage_dir.join(format!("{table}.ddl"));
            fs::write(&path, statement)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
-- MySQL dump 10.13
--
-- Table structure for table `users`
--

DROP TABLE IF EXISTS `users`;
CREATE TABLE `users` (
  `id` int(11) NOT NULL AUTO_INCREMENT,
  `name` varchar(64) NOT NULL,
  `email` varchar(128) DEFAULT NULL,
  PRIMARY KEY (`id`),
  UNIQUE KEY `email` (`email`)
) ENGINE=InnoDB AUTO_INCREMENT=4 DEFAULT CHARSET=utf8;

--
-- Table structure for table `orders`
--

DROP TABLE IF EXISTS `orders`;
CREATE TABLE `orders` (
  `id` int(11) NOT NULL,
  `user_id` int(11) NOT NULL,
  `total` decimal(10,2) NOT NULL,
  PRIMARY KEY (`id`),
  KEY `user_id` (`user_id`),
  CONSTRAINT `orders_ibfk_1` FOREIGN KEY (`user_id`) REFERENCES `users` (`id`)
) ENGINE=InnoDB DEFAULT CHARSET=utf8;
";

    #[test]
    fn definer_with_version_wrapper_and_security_clause_is_stripped() {
        let line = "/*!50017 DEFINER=`dev`@`%` SQL SECURITY DEFINER */ PROCEDURE foo()";
        assert_eq!(strip_definer(line), "PROCEDURE foo()");
    }

    #[test]
    fn definer_between_comment_wrappers_is_stripped() {
        let line = "/*!50001 CREATE ALGORITHM=UNDEFINED */ /*!50013 DEFINER=`root`@`localhost` SQL SECURITY DEFINER */ /*!50001 VIEW `v` AS SELECT 1 */";
        let stripped = strip_definer(line);
        assert!(!stripped.contains("DEFINER"));
        assert!(stripped.contains("VIEW `v` AS SELECT 1"));
    }

    #[test]
    fn unquoted_definer_identifiers_are_stripped() {
        let stripped = strip_definer("CREATE DEFINER=admin@10.0.0.% FUNCTION f()");
        assert_eq!(stripped.trim(), "CREATE FUNCTION f()");
    }

    #[test]
    fn tokenise_replaces_whole_words_only() {
        let ddl = "CREATE DATABASE acme;\nUSE acme;\n-- acme_backup is unrelated\n";
        let tokenised = tokenise(ddl, "acme");
        assert_eq!(
            tokenised,
            "CREATE DATABASE #DATABASE#;\nUSE #DATABASE#;\n-- acme_backup is unrelated\n"
        );
    }

    #[test]
    fn detokenise_then_retokenise_is_a_fixed_point() {
        let tokenised = "CREATE DATABASE #DATABASE#;\nUSE #DATABASE#;\n";
        let applied = detokenise(tokenised, "acme_stage");
        assert_eq!(applied, "CREATE DATABASE acme_stage;\nUSE acme_stage;\n");
        assert_eq!(tokenise(&applied, "acme_stage"), tokenised);
    }

    #[test]
    fn rewrite_drops_alter_database_lines() {
        let ddl = "USE acme;\nALTER DATABASE acme CHARACTER SET utf8;\nSELECT 1;\n";
        let rewritten = rewrite_schema(ddl, "acme");
        assert_eq!(rewritten, "USE #DATABASE#;\nSELECT 1;\n");
    }

    #[test]
    fn stage1_has_no_keys_and_no_auto_increment() {
        let stages = split_stages(SAMPLE);
        assert!(!stages.stage1.contains("AUTO_INCREMENT,"));
        assert!(!stages.stage1.contains("PRIMARY KEY"));
        assert!(!stages.stage1.contains("UNIQUE KEY"));
        assert!(!stages.stage1.contains("CONSTRAINT"));
        // Table-level options keep their AUTO_INCREMENT counter.
        assert!(stages.stage1.contains("ENGINE=InnoDB AUTO_INCREMENT=4"));
        assert!(stages.stage1.contains("`id` int(11) NOT NULL,\n"));
        assert!(stages.stage1.contains("`email` varchar(128) DEFAULT NULL\n"));
    }

    #[test]
    fn auto_increment_becomes_a_single_stage2_modify() {
        let stages = split_stages(SAMPLE);
        let users = &stages.stage2["users"];
        assert!(users.starts_with("ALTER TABLE `users`"));
        assert!(users.contains("MODIFY `id` int(11) NOT NULL AUTO_INCREMENT PRIMARY KEY"));
        assert!(users.contains("ADD UNIQUE KEY `email` (`email`)"));
        // The explicit PRIMARY KEY line is implied by the MODIFY.
        assert_eq!(users.matches("PRIMARY KEY").count(), 1);
    }

    #[test]
    fn explicit_primary_key_survives_without_auto_increment() {
        let stages = split_stages(SAMPLE);
        let orders = &stages.stage2["orders"];
        assert!(orders.contains("ADD PRIMARY KEY (`id`)"));
        assert!(orders.contains("ADD KEY `user_id` (`user_id`)"));
    }

    #[test]
    fn stage3_is_solely_add_constraint() {
        let stages = split_stages(SAMPLE);
        assert!(!stages.stage3.contains_key("users"));
        let orders = &stages.stage3["orders"];
        for line in orders.lines().skip(1) {
            let trimmed = line.trim().trim_end_matches(';');
            if trimmed.is_empty() {
                continue;
            }
            assert!(trimmed.starts_with("ADD CONSTRAINT"), "unexpected: {trimmed}");
        }
    }

    #[test]
    fn views_and_routines_pass_through_to_stage1() {
        let ddl = "\
-- Dumping routines for database 'shop'
/*!50003 CREATE PROCEDURE `totals`() BEGIN SELECT 1; END */
CREATE TABLE `loose` (x int);
";
        let stages = split_stages(ddl);
        assert!(stages.stage1.contains("PROCEDURE `totals`"));
        // Without a table header the CREATE TABLE is passed through intact.
        assert!(stages.stage1.contains("CREATE TABLE `loose` (x int);"));
        assert!(stages.stage2.is_empty());
    }

    #[test]
    fn stage_files_land_in_the_expected_places() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stages = split_stages(SAMPLE);
        write_stage_files(dir.path(), &stages).expect("write stages");
        assert!(dir.path().join(STAGE1_FILE).exists());
        assert!(dir.path().join(STAGE2_DIR).join("users.ddl").exists());
        assert!(dir.path().join(STAGE2_DIR).join("orders.ddl").exists());
        assert!(dir.path().join(STAGE3_DIR).join("orders.ddl").exists());
        assert!(!dir.path().join(STAGE3_DIR).join("users.ddl").exists());
    }
}

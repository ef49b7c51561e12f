use std::fs::File;
use std::io::{self, Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Execute a program and capture stdout/stderr.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or the I/O streams
/// cannot be read entirely.
pub fn run_command(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let output = command
        .output()
        .with_context(|| format!("failed to start {program}"))?;
    Ok(RunOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Execute a program with stdin connected to an already-open file (a named
/// pipe during restore, a stage file during schema apply).
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or its streams
/// cannot be read.
pub fn run_with_stdin_file(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    stdin: File,
) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.stdin(Stdio::from(stdin));
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let output = command
        .output()
        .with_context(|| format!("failed to start {program}"))?;
    Ok(RunOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Execute a program streaming its stdout into `sink` while stderr is
/// captured on the side. The returned output has an empty `stdout`.
///
/// # Errors
///
/// Returns an error when the program cannot be spawned or streaming fails.
pub fn stream_stdout(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    sink: &mut dyn Write,
) -> Result<RunOutput> {
    let mut command = Command::new(program);
    command.args(args);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {program}"))?;
    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");
    let reader = thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf);
        buf
    });
    let copy_result = io::copy(&mut stdout, sink);
    let status = child
        .wait()
        .with_context(|| format!("failed to wait for {program}"))?;
    let stderr = reader.join().unwrap_or_default();
    copy_result.with_context(|| format!("failed to stream output of {program}"))?;
    Ok(RunOutput {
        code: status.code().unwrap_or(-1),
        stdout: String::new(),
        stderr,
    })
}

/// Execute a shell command line (used only for the post-schema hook).
///
/// # Errors
///
/// Returns an error when the shell cannot be spawned.
pub fn run_shell(command_line: &str, envs: &[(String, String)]) -> Result<RunOutput> {
    run_command(
        "sh",
        &["-c".to_string(), command_line.to_string()],
        envs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_captures_output_and_status() -> Result<()> {
        let output = run_command(
            "/bin/sh",
            &[
                "-c".to_string(),
                "printf out && printf err >&2; exit 7".to_string(),
            ],
            &[],
        )?;
        assert_eq!(output.code, 7);
        assert_eq!(output.stdout, "out");
        assert_eq!(output.stderr, "err");
        assert!(!output.success());
        Ok(())
    }

    #[test]
    fn run_command_passes_environment() -> Result<()> {
        let output = run_command(
            "/bin/sh",
            &["-c".to_string(), "printf \"$ACCEL_TEST_VAR\"".to_string()],
            &[("ACCEL_TEST_VAR".to_string(), "marker".to_string())],
        )?;
        assert_eq!(output.stdout, "marker");
        Ok(())
    }

    #[test]
    fn stream_stdout_separates_the_streams() -> Result<()> {
        let mut sink = Vec::new();
        let output = stream_stdout(
            "/bin/sh",
            &[
                "-c".to_string(),
                "printf data && printf warning >&2".to_string(),
            ],
            &[],
            &mut sink,
        )?;
        assert_eq!(output.code, 0);
        assert_eq!(sink, b"data");
        assert_eq!(output.stderr, "warning");
        assert!(output.stdout.is_empty());
        Ok(())
    }

    #[test]
    fn run_with_stdin_file_feeds_the_child() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "piped\n").expect("write input");
        let output = run_with_stdin_file(
            "cat",
            &[],
            &[],
            File::open(&path).expect("open input"),
        )?;
        assert_eq!(output.code, 0);
        assert_eq!(output.stdout, "piped\n");
        Ok(())
    }

    #[test]
    fn run_shell_expands_a_pipeline() -> Result<()> {
        let output = run_shell("printf 'a b c' | wc -w", &[])?;
        assert_eq!(output.code, 0);
        assert_eq!(output.stdout.trim(), "3");
        Ok(())
    }
}

//! Child-process driver shared by the worker (trainer) and the
//! aggregator (merger).
//!
//! Both external programs follow the same contract: stdout is free-form
//! progress output, and the last non-empty line is a JSON result object.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{CoordError, Result};

/// A configured external command, e.g. `"python3 ml-code/train.py"`.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    base_args: Vec<String>,
}

impl CommandSpec {
    /// Split a command line on whitespace. Paths with spaces are not
    /// supported; the first token is the program.
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            return Err(CoordError::Process("empty command line".to_string()));
        };
        Ok(Self {
            program,
            base_args: parts.collect(),
        })
    }

    /// Run the command with extra arguments appended, streaming stdout
    /// line by line into the log, and return the last non-empty line.
    ///
    /// `tag` labels the log lines (typically the job or parent id).
    /// Non-zero exit or an empty stdout is an error; stderr passes
    /// through to the node's own stderr.
    pub async fn run_last_line<I, S>(&self, extra_args: I, tag: &str) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .args(extra_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| CoordError::Process(format!("failed to start {}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoordError::Process("child stdout unavailable".to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        let mut last_line = String::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| CoordError::Process(format!("failed reading child stdout: {e}")))?
        {
            tracing::info!(tag, line = %line, "child output");
            if !line.trim().is_empty() {
                last_line = line.trim().to_string();
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| CoordError::Process(format!("failed waiting for child: {e}")))?;
        if !status.success() {
            return Err(CoordError::Process(format!(
                "{} exited with {:?}",
                self.program,
                status.code()
            )));
        }
        if last_line.is_empty() {
            return Err(CoordError::Process(format!(
                "{} produced no output",
                self.program
            )));
        }
        Ok(last_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_program_and_args() {
        let spec = CommandSpec::parse("python3 ml-code/train.py").unwrap();
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.base_args, vec!["ml-code/train.py"]);

        assert!(CommandSpec::parse("   ").is_err());
    }

    #[tokio::test]
    async fn run_returns_last_non_empty_line() {
        let spec = CommandSpec::parse("sh -c").unwrap();
        let line = spec
            .run_last_line(["printf 'progress\\nfinal result\\n\\n'"], "test")
            .await
            .unwrap();
        assert_eq!(line, "final result");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let spec = CommandSpec::parse("sh -c").unwrap();
        let err = spec.run_last_line(["echo boom; exit 3"], "test").await;
        assert!(matches!(err, Err(CoordError::Process(_))));
    }
}

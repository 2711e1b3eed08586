//! GDB/MI debug session
//!
//! Drives `gdb --interpreter=mi3` connected to the probe's GDB server.
//! Every command is sent with a numeric token and completes when the
//! result record carrying the same token arrives.

use crate::target::{TargetConnector, TargetLifecycle};
use crate::{HarnessError, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Settings for spawning GDB
#[derive(Debug, Clone)]
pub struct GdbConfig {
    /// GDB executable
    pub gdb: PathBuf,
    /// Remote target passed to `-target-select extended-remote`
    pub remote: String,
    /// How long a single command may take
    pub command_timeout: Duration,
}

impl Default for GdbConfig {
    fn default() -> Self {
        Self {
            gdb: PathBuf::from("arm-none-eabihf-gdb"),
            remote: ":3333".to_string(),
            command_timeout: Duration::from_secs(10),
        }
    }
}

/// Result class of a GDB/MI result record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Exit,
    Error(String),
}

/// Parse a result record (`<token>^<class>[,<results>]`) carrying `token`.
///
/// Returns `None` for any other output line: async records, stream
/// records, the `(gdb)` prompt, or results for other tokens.
pub fn parse_result_record(line: &str, token: u32) -> Option<ResultClass> {
    let rest = line.trim_end().strip_prefix(token.to_string().as_str())?;
    let rest = rest.strip_prefix('^')?;
    let (class, results) = match rest.split_once(',') {
        Some((class, results)) => (class, results),
        None => (rest, ""),
    };

    Some(match class {
        "done" => ResultClass::Done,
        "running" => ResultClass::Running,
        "connected" => ResultClass::Connected,
        "exit" => ResultClass::Exit,
        "error" => ResultClass::Error(error_message(results)),
        other => ResultClass::Error(format!("unexpected result class `{}`", other)),
    })
}

/// Pull `msg="..."` out of an error result, unescaping quotes
fn error_message(results: &str) -> String {
    let Some(start) = results.find("msg=\"") else {
        return results.to_string();
    };
    let body = &results[start + 5..];

    let mut out = String::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
            }
            '"' => break,
            other => out.push(other),
        }
    }
    out
}

/// Quote a path for an MI command argument
fn mi_quote(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
}

/// A running GDB process in MI mode
#[derive(Debug)]
pub struct GdbTarget {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    config: GdbConfig,
    next_token: u32,
}

impl GdbTarget {
    /// Spawn GDB
    ///
    /// The process is killed if the handle is dropped without
    /// [`TargetLifecycle::terminate_session`].
    pub async fn spawn(config: &GdbConfig) -> Result<Self> {
        let tool = config.gdb.display().to_string();
        let mut child = Command::new(&config.gdb)
            .arg("--interpreter=mi3")
            .arg("--nx")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                tool: tool.clone(),
                source,
            })?;

        let missing_pipe = || HarnessError::Spawn {
            tool: tool.clone(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdio pipe not captured"),
        };
        let stdin = child.stdin.take().ok_or_else(missing_pipe)?;
        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;

        tracing::debug!("Spawned {} (pid {:?})", tool, child.id());
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            config: config.clone(),
            next_token: 1,
        })
    }

    /// Send one MI command and wait for its result record
    pub async fn execute(&mut self, command: &str) -> Result<ResultClass> {
        let token = self.next_token;
        self.next_token += 1;

        let line = format!("{}{}\n", token, command);
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|source| HarnessError::Spawn {
                tool: self.config.gdb.display().to_string(),
                source,
            })?;
        self.stdin.flush().await.map_err(|source| HarnessError::Spawn {
            tool: self.config.gdb.display().to_string(),
            source,
        })?;

        let timeout = self.config.command_timeout;
        let class = tokio::time::timeout(timeout, self.wait_for_result(command, token))
            .await
            .map_err(|_| HarnessError::Timeout {
                command: command.to_string(),
                timeout,
            })??;

        match class {
            ResultClass::Error(message) => Err(HarnessError::Gdb {
                command: command.to_string(),
                message,
            }),
            class => {
                tracing::debug!("gdb `{}` -> {:?}", command, class);
                Ok(class)
            }
        }
    }

    async fn wait_for_result(&mut self, command: &str, token: u32) -> Result<ResultClass> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await
                .map_err(|e| HarnessError::io("reading gdb output", e))?
                .ok_or_else(|| HarnessError::GdbExited {
                    command: command.to_string(),
                })?;

            if let Some(class) = parse_result_record(&line, token) {
                return Ok(class);
            }
            tracing::trace!("gdb: {}", line);
        }
    }
}

impl TargetLifecycle for GdbTarget {
    async fn select_target(&mut self) -> Result<()> {
        let command = format!("-target-select extended-remote {}", self.config.remote);
        self.execute(&command).await.map(drop)
    }

    async fn load_and_flash(&mut self, image: &Path) -> Result<()> {
        self.execute(&format!("-file-exec-and-symbols {}", mi_quote(image)))
            .await?;
        self.execute("-target-download").await?;
        self.execute("-interpreter-exec console \"monitor reset halt\"")
            .await
            .map(drop)
    }

    async fn set_breakpoint(&mut self, symbol: &str) -> Result<()> {
        self.execute(&format!("-break-insert {}", symbol)).await.map(drop)
    }

    async fn delete_breakpoints(&mut self) -> Result<()> {
        self.execute("-break-delete").await.map(drop)
    }

    async fn resume(&mut self) -> Result<()> {
        self.execute("-exec-continue").await.map(drop)
    }

    async fn terminate_session(mut self) -> Result<()> {
        // A running target makes gdb-exit slow to answer; the kill below covers it
        if let Err(e) = self.execute("-gdb-exit").await {
            tracing::debug!("gdb-exit did not complete cleanly: {}", e);
        }

        match tokio::time::timeout(self.config.command_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("gdb exited with {}", status);
                Ok(())
            }
            Ok(Err(e)) => Err(HarnessError::io("waiting for gdb", e)),
            Err(_) => {
                tracing::warn!("gdb did not exit, killing it");
                self.child
                    .kill()
                    .await
                    .map_err(|e| HarnessError::io("killing gdb", e))
            }
        }
    }
}

/// Spawns a fresh GDB per session
#[derive(Debug, Clone, Default)]
pub struct GdbConnector {
    /// GDB settings
    pub config: GdbConfig,
}

impl GdbConnector {
    /// Create a connector
    pub fn new(config: GdbConfig) -> Self {
        Self { config }
    }
}

impl TargetConnector for GdbConnector {
    type Target = GdbTarget;

    async fn connect(&self) -> Result<GdbTarget> {
        GdbTarget::spawn(&self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result_record() {
        assert_eq!(parse_result_record("3^done", 3), Some(ResultClass::Done));
        assert_eq!(
            parse_result_record("4^running\n", 4),
            Some(ResultClass::Running)
        );
        assert_eq!(
            parse_result_record("1^connected,frame={addr=\"0x0800\"}", 1),
            Some(ResultClass::Connected)
        );
        assert_eq!(
            parse_result_record("7^done,bkpt={number=\"1\"}", 7),
            Some(ResultClass::Done)
        );
    }

    #[test]
    fn test_parse_ignores_other_records() {
        assert_eq!(parse_result_record("(gdb) ", 1), None);
        assert_eq!(parse_result_record("*stopped,reason=\"breakpoint-hit\"", 1), None);
        assert_eq!(parse_result_record("~\"Loading section .text\\n\"", 1), None);
        assert_eq!(parse_result_record("2^done", 1), None);
        assert_eq!(parse_result_record("12^done", 1), None);
    }

    #[test]
    fn test_parse_error_message() {
        let record = r#"5^error,msg="No symbol \"post_main\" in current context.""#;
        assert_eq!(
            parse_result_record(record, 5),
            Some(ResultClass::Error(
                "No symbol \"post_main\" in current context.".to_string()
            ))
        );
    }

    #[test]
    fn test_mi_quote() {
        assert_eq!(mi_quote(Path::new("./build/wamr")), "\"./build/wamr\"");
        assert_eq!(mi_quote(Path::new("a \"b\"")), "\"a \\\"b\\\"\"");
    }

    #[test]
    fn test_gdb_config_default() {
        let config = GdbConfig::default();
        assert_eq!(config.remote, ":3333");
        assert_eq!(config.command_timeout, Duration::from_secs(10));
    }
}

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Outcome of one external process invocation.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub cmd: String,
    pub code: i32,
    /// Captured stdout, falling back to stderr when stdout is empty.
    pub output: String,
    pub error: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("command timed out after {timeout_secs}s: {cmd}")]
    Timeout { cmd: String, timeout_secs: u64 },

    #[error("command exited with status {code}: {cmd}")]
    ExitStatus {
        cmd: String,
        code: i32,
        output: String,
    },

    #[error("failed to run `{cmd}`: {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unbalanced quote in command: {cmd}")]
    Parse { cmd: String },

    #[error("empty command line")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct RunOpts {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout_secs: u64,
    pub capture_output: bool,
    pub raise_on_error: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            capture_output: false,
            raise_on_error: false,
        }
    }
}

impl RunOpts {
    pub fn capture() -> Self {
        Self {
            capture_output: true,
            ..Self::default()
        }
    }
}

/// Split a command line into an argv without going through a shell.
/// Single and double quotes group words; shell metacharacters stay literal.
/// Returns `None` on an unbalanced quote.
pub fn split_command_line(line: &str) -> Option<Vec<String>> {
    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;

    for ch in line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    in_arg = true;
                }
                c if c.is_whitespace() => {
                    if in_arg {
                        argv.push(std::mem::take(&mut current));
                        in_arg = false;
                    }
                }
                c => {
                    current.push(c);
                    in_arg = true;
                }
            },
        }
    }

    if quote.is_some() {
        return None;
    }
    if in_arg {
        argv.push(current);
    }
    Some(argv)
}

/// Seam for everything that shells out.
pub trait Runner {
    async fn run_argv(&self, argv: &[String], opts: &RunOpts) -> Result<ShellOutput, ShellError>;

    async fn run(&self, command_line: &str, opts: &RunOpts) -> Result<ShellOutput, ShellError> {
        let argv = split_command_line(command_line).ok_or_else(|| ShellError::Parse {
            cmd: command_line.to_string(),
        })?;
        self.run_argv(&argv, opts).await
    }
}

/// Production runner backed by `tokio::process`.
///
/// The wall-clock timeout is only enforced when output capture is requested;
/// attached commands (dev server, interactive REPL) run until they exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

impl Runner for ShellRunner {
    async fn run_argv(&self, argv: &[String], opts: &RunOpts) -> Result<ShellOutput, ShellError> {
        let (program, args) = argv.split_first().ok_or(ShellError::Empty)?;
        let cmd_text = argv.join(" ");
        let started = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = &opts.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let (code, stdout, stderr) = if opts.capture_output {
            cmd.stdout(Stdio::piped())
                .stderr(Stdio::piped())
                // Dropping the wait future on timeout reaps the child.
                .kill_on_drop(true);
            let child = cmd.spawn().map_err(|e| ShellError::Spawn {
                cmd: cmd_text.clone(),
                source: e,
            })?;
            let out = tokio::time::timeout(
                Duration::from_secs(opts.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| ShellError::Timeout {
                cmd: cmd_text.clone(),
                timeout_secs: opts.timeout_secs,
            })?
            .map_err(|e| ShellError::Spawn {
                cmd: cmd_text.clone(),
                source: e,
            })?;
            (
                out.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&out.stdout).into_owned(),
                String::from_utf8_lossy(&out.stderr).into_owned(),
            )
        } else {
            let status = cmd.status().await.map_err(|e| ShellError::Spawn {
                cmd: cmd_text.clone(),
                source: e,
            })?;
            (status.code().unwrap_or(-1), String::new(), String::new())
        };

        tracing::debug!(cmd = %cmd_text, code, "shell command finished");

        let output = if stdout.is_empty() { stderr } else { stdout };
        if code != 0 && opts.raise_on_error {
            return Err(ShellError::ExitStatus {
                cmd: cmd_text,
                code,
                output,
            });
        }

        Ok(ShellOutput {
            cmd: cmd_text,
            code,
            output,
            error: code != 0,
            elapsed: started.elapsed(),
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Scripted runner for provisioner/dispatcher tests: records every argv
    /// and fails commands whose joined text starts with a registered prefix.
    #[derive(Default)]
    pub struct SpyRunner {
        calls: Mutex<Vec<String>>,
        fail_prefixes: Vec<String>,
    }

    impl SpyRunner {
        pub fn failing_on(prefixes: &[&str]) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count_starting_with(&self, prefix: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    impl Runner for SpyRunner {
        async fn run_argv(
            &self,
            argv: &[String],
            opts: &RunOpts,
        ) -> Result<ShellOutput, ShellError> {
            let cmd = argv.join(" ");
            self.calls.lock().unwrap().push(cmd.clone());
            let fails = self.fail_prefixes.iter().any(|p| cmd.starts_with(p.as_str()));
            let code = if fails { 1 } else { 0 };
            if fails && opts.raise_on_error {
                return Err(ShellError::ExitStatus {
                    cmd,
                    code,
                    output: String::new(),
                });
            }
            Ok(ShellOutput {
                cmd,
                code,
                output: String::new(),
                error: fails,
                elapsed: Duration::ZERO,
            })
        }
    }
}

//! External command execution

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::AgentError;

/// Lines of output kept from each stream
const OUTPUT_TAIL_LINES: usize = 200;

/// A command to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render the command line for logs and error messages
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// First line of stdout, trimmed
    pub fn first_line(&self) -> &str {
        self.stdout.lines().next().unwrap_or("").trim()
    }
}

/// Runs external processes. Implemented by [`ProcessRunner`] and by fakes in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. A non-zero exit is reported in the output,
    /// spawn failures and timeouts are errors.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, AgentError>;

    /// Run a command and turn a non-zero exit into an error
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, AgentError> {
        let output = self.run(spec).await?;
        if output.success() {
            return Ok(output);
        }

        let detail = output
            .stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no output")
            .trim()
            .to_string();
        Err(AgentError::CommandError(format!(
            "`{}` exited with {}: {}",
            spec.display(),
            output
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            detail
        )))
    }
}

/// Runs commands as child processes of the agent
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, AgentError> {
        debug!("Running `{}`", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            AgentError::CommandError(format!("failed to spawn `{}`: {}", spec.display(), e))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let label = spec.program.clone();

        let finished = async {
            let (stdout, stderr) = tokio::join!(
                collect_lines(stdout, &label, "stdout"),
                collect_lines(stderr, &label, "stderr"),
            );
            let status = child.wait().await?;
            Ok::<_, std::io::Error>(CommandOutput {
                exit_code: status.code(),
                stdout,
                stderr,
            })
        };

        match tokio::time::timeout(spec.timeout, finished).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!("`{}` timed out after {:?}", spec.display(), spec.timeout);
                Err(AgentError::CommandTimeout(format!(
                    "`{}` did not finish within {:?}",
                    spec.display(),
                    spec.timeout
                )))
            }
        }
    }
}

/// Stream a child's output into the log and keep its tail
async fn collect_lines<R>(reader: Option<R>, program: &str, stream: &str) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return String::new();
    };

    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "pullagent::command", "[{} {}] {}", program, stream, line);
        push_tail(&mut tail, line);
    }
    Vec::from(tail).join("\n")
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == OUTPUT_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}

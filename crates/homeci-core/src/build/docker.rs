//! `docker build` driven through the CLI.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::{BuildError, BuildOutput, BuildRequest, ImageBuilder};
use crate::config::BuildSettings;

/// Lines of stderr kept in a failure report.
const STDERR_TAIL_LINES: usize = 20;

/// Runs `<docker> build -f <file> -t <tag> -` with the context on stdin.
#[derive(Debug, Clone)]
pub struct DockerCliBuilder {
    program: String,
    timeout: Option<Duration>,
}

impl Default for DockerCliBuilder {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCliBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
        }
    }

    pub fn from_settings(settings: &BuildSettings) -> Self {
        let builder = Self::new(settings.docker_bin.clone());
        if settings.timeout_secs > 0 {
            builder.with_timeout(Duration::from_secs(settings.timeout_secs))
        } else {
            builder
        }
    }

    /// Kill the build if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl ImageBuilder for DockerCliBuilder {
    async fn build(&self, request: BuildRequest) -> Result<BuildOutput, BuildError> {
        let start = Instant::now();
        let context_digest = request.context.digest().to_string();

        let mut child = Command::new(&self.program)
            .args(["build", "-f", &request.dockerfile, "-t", &request.tag, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BuildError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let (Some(mut stdin), Some(stdout), Some(mut stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(BuildError::Context("build process pipes unavailable".into()));
        };

        let archive = request.context.into_bytes();
        let tag = request.tag;

        let run = async {
            let feed = async move {
                stdin.write_all(&archive).await?;
                stdin.shutdown().await
            };
            let drain_stdout = async {
                let mut lines = BufReader::new(stdout).lines();
                let mut collected = Vec::new();
                while let Some(line) = lines.next_line().await? {
                    debug!(line = %line, "docker build");
                    collected.push(line);
                }
                Ok::<_, std::io::Error>(collected)
            };
            let drain_stderr = async {
                let mut text = String::new();
                stderr.read_to_string(&mut text).await?;
                Ok::<_, std::io::Error>(text)
            };

            let (fed, log_lines, stderr_text) = tokio::join!(feed, drain_stdout, drain_stderr);
            let status = child.wait().await?;
            Ok::<_, BuildError>((status, fed, log_lines?, stderr_text?))
        };

        let (status, fed, log_lines, stderr_text) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result?,
                Err(_) => {
                    let _ = child.start_kill();
                    return Err(BuildError::TimedOut {
                        secs: limit.as_secs(),
                    });
                }
            },
            None => run.await?,
        };

        if !status.success() {
            return Err(BuildError::Failed {
                code: status.code(),
                stderr: tail(&stderr_text, STDERR_TAIL_LINES),
            });
        }
        // A successful exit with a short write means the context was not fully read.
        fed?;

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(tag = %tag, duration_ms, lines = log_lines.len(), "Image built");

        Ok(BuildOutput {
            tag,
            context_digest,
            log_lines,
            duration_ms,
        })
    }
}

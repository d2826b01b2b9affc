//! opencode CLI adapter (primary classification backend).
//!
//! Runs `opencode run <prompt>` once per message and captures stdout/stderr.

use std::{
    collections::VecDeque,
    process::{ExitStatus, Stdio},
    sync::Arc,
};

use async_trait::async_trait;

use taskfeed_core::{
    classifier::{
        client::{Classifier, OpenCodePromptAdapter},
        types::{BackendKind, ClassificationOutcome, ClassificationRequest, OpenCodeConfig},
    },
    errors::Error,
    text::truncate_chars,
    Result,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    sync::Mutex,
};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;

#[derive(Clone, Debug)]
pub struct OpenCodeClassifier {
    cfg: OpenCodeConfig,
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

impl OpenCodeClassifier {
    pub fn new(cfg: OpenCodeConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Classifier for OpenCodeClassifier {
    fn backend(&self) -> BackendKind {
        BackendKind::OpenCodeCli
    }

    async fn classify(&self, req: ClassificationRequest) -> Result<ClassificationOutcome> {
        let adapter = OpenCodePromptAdapter {
            cfg: self.cfg.clone(),
        };
        let inv = adapter.build_invocation(&req);

        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .current_dir(&inv.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::External(format!(
                "error running opencode ({}): {e}",
                inv.program.display()
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("opencode stdout was not captured".to_string()))?;
        let stderr_tail: Arc<Mutex<StderrTail>> = Arc::new(Mutex::new(StderrTail::default()));

        // Drain stderr in background to avoid blocking on a full pipe.
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tail.lock().await.push_line(line);
                }
            })
        });

        let collected = match self.cfg.timeout {
            Some(limit) => match tokio::time::timeout(limit, collect(&mut child, stdout)).await {
                Ok(res) => res,
                Err(_) => {
                    let kill = child.kill().await;
                    let mut msg = format!("opencode timed out after {limit:?}");
                    if let Err(e) = kill {
                        msg.push_str(&format!(" (also failed to kill opencode process: {e})"));
                    }
                    return Err(Error::External(msg));
                }
            },
            None => collect(&mut child, stdout).await,
        };
        let (stdout, status) = collected?;

        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        let stderr = stderr_tail.lock().await.snapshot();

        if !status.success() {
            if !stderr.trim().is_empty() {
                return Err(Error::External(format!(
                    "opencode exited with status {status}\nstderr (tail):\n{stderr}"
                )));
            }
            return Err(Error::External(format!(
                "opencode exited with status {status}"
            )));
        }

        tracing::debug!(
            "opencode finished for message {}: {}",
            req.message_id,
            truncate_chars(stdout.trim(), 200)
        );

        Ok(ClassificationOutcome { stdout, stderr })
    }
}

async fn collect(child: &mut Child, stdout: ChildStdout) -> Result<(String, ExitStatus)> {
    let mut buf = Vec::new();
    BufReader::new(stdout).read_to_end(&mut buf).await?;
    let status = child.wait().await?;
    Ok((String::from_utf8_lossy(&buf).into_owned(), status))
}

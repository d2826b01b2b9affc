use std::{path::PathBuf, time::Duration};

use crate::{config::Config, domain::MessageId};

/// Analysis backend used for classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    OpenCodeCli,
    // Future: in-process model, remote HTTP service.
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::OpenCodeCli => "opencode",
        }
    }
}

#[derive(Clone, Debug)]
pub struct OpenCodeConfig {
    pub opencode_path: PathBuf,
    /// Kill the child if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl From<&Config> for OpenCodeConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            opencode_path: cfg.opencode_path.clone(),
            timeout: cfg.opencode_timeout,
        }
    }
}

/// Normalized request for classifying one message.
#[derive(Clone, Debug)]
pub struct ClassificationRequest {
    pub message_id: MessageId,
    pub prompt: String,
    /// Task-data root; the backend reads and writes task files relative to it.
    pub cwd: PathBuf,
}

/// Raw backend output. Nothing in it is parsed by the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassificationOutcome {
    pub stdout: String,
    pub stderr: String,
}

use std::path::PathBuf;

use async_trait::async_trait;

use crate::Result;

use super::types::*;

/// A concrete CLI invocation (used by the `opencode` runner).
#[derive(Clone, Debug)]
pub struct CliInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Prompt adapter for the opencode CLI.
#[derive(Clone, Debug)]
pub struct OpenCodePromptAdapter {
    pub cfg: OpenCodeConfig,
}

impl OpenCodePromptAdapter {
    /// `opencode run <prompt>`, executed from the task-data root.
    pub fn build_invocation(&self, req: &ClassificationRequest) -> CliInvocation {
        CliInvocation {
            program: self.cfg.opencode_path.clone(),
            args: vec!["run".to_string(), req.prompt.clone()],
            cwd: req.cwd.clone(),
        }
    }
}

/// Pluggable classification capability.
///
/// The forwarder only depends on this trait, so the subprocess backend can be
/// swapped for an in-process model or a remote service.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn backend(&self) -> BackendKind;

    async fn classify(&self, req: ClassificationRequest) -> Result<ClassificationOutcome>;
}

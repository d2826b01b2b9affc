use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    config::Config,
    domain::ChatMessage,
    errors::Error,
    text::truncate_chars,
    Result,
};

use super::{
    client::Classifier,
    prompt::{build_analysis_prompt, missing_file_marker, AnalysisContext},
    types::{ClassificationOutcome, ClassificationRequest},
};

pub const INSTRUCTIONS_FILE: &str = "instructions.md";
pub const CONFIG_FILE: &str = "config.json";

#[derive(Clone, Debug)]
pub struct ForwarderConfig {
    /// Holds the auxiliary context files.
    pub context_dir: PathBuf,
    /// Working directory of the analysis backend.
    pub task_root: PathBuf,
}

impl From<&Config> for ForwarderConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            context_dir: cfg.opencode_context_dir.clone(),
            task_root: cfg.tasks_dir.clone(),
        }
    }
}

/// Builds the analysis prompt for a message and hands it to a [`Classifier`].
///
/// Every failure is returned to the caller; nothing here aborts an ingestion run.
pub struct ClassificationForwarder {
    classifier: Arc<dyn Classifier>,
    cfg: ForwarderConfig,
}

impl ClassificationForwarder {
    pub fn new(classifier: Arc<dyn Classifier>, cfg: ForwarderConfig) -> Self {
        Self { classifier, cfg }
    }

    pub async fn forward(&self, msg: &ChatMessage) -> Result<ClassificationOutcome> {
        let dir = &self.cfg.context_dir;
        let is_dir = tokio::fs::metadata(dir)
            .await
            .map(|md| md.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(Error::InvalidPath {
                path: dir.clone(),
                reason: "analysis context directory does not exist".to_string(),
            });
        }

        // Read fresh on every call so edits apply without a restart.
        let ctx = AnalysisContext {
            instructions: read_context_file(&dir.join(INSTRUCTIONS_FILE)).await,
            config: read_context_file(&dir.join(CONFIG_FILE)).await,
        };
        let prompt = build_analysis_prompt(msg, &ctx, dir);

        tracing::info!(
            backend = self.classifier.backend().as_str(),
            "classifying message {} from {}: {}",
            msg.id,
            msg.author_name,
            truncate_chars(&msg.content, 100)
        );

        self.classifier
            .classify(ClassificationRequest {
                message_id: msg.id.clone(),
                prompt: prompt.into_string(),
                cwd: self.cfg.task_root.clone(),
            })
            .await
    }
}

async fn read_context_file(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("context file {} unavailable: {e}", path.display());
            missing_file_marker(path)
        }
    }
}

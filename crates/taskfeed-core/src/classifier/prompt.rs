use std::path::Path;

use crate::domain::ChatMessage;

/// Static auxiliary context read from the analysis context directory.
#[derive(Clone, Debug)]
pub struct AnalysisContext {
    pub instructions: String,
    pub config: String,
}

/// Composed prompt for one message. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalysisPrompt(pub String);

impl AnalysisPrompt {
    pub fn into_string(self) -> String {
        self.0
    }
}

/// Marker used in place of an auxiliary file that could not be read.
pub fn missing_file_marker(path: &Path) -> String {
    format!("[File not found: {}]", path.display())
}

pub fn build_analysis_prompt(
    msg: &ChatMessage,
    ctx: &AnalysisContext,
    context_dir: &Path,
) -> AnalysisPrompt {
    let guidance = classification_guidance(&msg.author_name, &msg.content);
    AnalysisPrompt(format!(
        "Context from {dir}:\n\n\
Instructions: {instructions}\n\
Config: {config}\n\n\
User query: {guidance}\n\n\
Respond based on the task management context above.",
        dir = context_dir.display(),
        instructions = ctx.instructions,
        config = ctx.config,
    ))
}

fn classification_guidance(author: &str, content: &str) -> String {
    format!(
        r#"Analyze this Discord message from {author}.

Decide whether it describes a new task, an update to an existing task, or neither.
- New task: create it as the instructions specify (new tasks go in Maintenance).
- Update to an existing task: add an update entry to that task's file. If the task
  has status "repeating", also refresh its "updated" and "next_occurance" fields.
- Neither (not actionable work, or outside the scope in the instructions): IGNORE it.

Message: "{content}"

Consider:
1. Does this describe work that needs to be done?
2. Does it state a priority (high/medium/low)? Otherwise default to medium.
3. Which category does it belong to?
4. Suggest a concise title for the task.
"#
    )
}

//! Worker prompt assembly.

use std::fmt::Write as _;
use std::path::Path;

use crate::orchestration::{ProjectContext, Subtask};

/// Render the prompt handed to a worker.
pub fn build_prompt(subtask: &Subtask, workdir: &Path, project: &ProjectContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "You are the {} agent on {}.", subtask.role, project.display_name());
    let _ = writeln!(out);
    let _ = writeln!(out, "## Task");
    let _ = writeln!(out, "{}", subtask.description);

    let ctx = &subtask.context;
    if !ctx.responsibilities.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Responsibilities");
        for item in &ctx.responsibilities {
            let _ = writeln!(out, "- {item}");
        }
    }
    if !ctx.best_practices.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Best practices");
        for item in &ctx.best_practices {
            let _ = writeln!(out, "- {item}");
        }
    }
    if !ctx.coordination_note.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Coordination");
        let _ = writeln!(out, "{}", ctx.coordination_note);
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Environment");
    let _ = writeln!(out, "- Working directory: {}", workdir.display());
    let _ = writeln!(out, "- Project type: {}", project.project_type);
    for (key, value) in &project.metadata {
        let _ = writeln!(out, "- {key}: {value}");
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Only modify files inside the working directory and commit your work when done."
    );
    out
}

/// Write `prompt` to `path`, creating parent directories.
pub(super) async fn write_prompt_file(path: &Path, prompt: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, prompt).await
}

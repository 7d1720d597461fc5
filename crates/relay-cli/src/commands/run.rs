use std::path::Path;

use anyhow::Context;
use relay_core::config::Config;
use tracing::info;

use super::{build_engine, follow, load_task};

/// Start the task and stream it until it lands in review (or is stopped).
pub async fn run(config: Config, project: &Path, spec_id: &str, description: Option<&str>) -> anyhow::Result<()> {
    let mut task = load_task(&config, project, spec_id)?;
    task.description = description.map(str::to_string);
    let task_id = task.id;

    let engine = build_engine(config)?;
    let events = engine.subscribe();
    engine.register_task(task);

    let process = engine
        .start_task(task_id, description)
        .with_context(|| format!("failed to start {spec_id}"))?;
    info!(task_id = %task_id, kind = %process.kind, pid = ?process.pid, "task started");

    let status = follow(&engine, events, task_id).await?;
    println!("{spec_id} finished in {status}");
    engine.shutdown().await;
    Ok(())
}

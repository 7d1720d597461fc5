use std::path::Path;

use relay_core::config::Config;
use relay_core::types::TaskStatus;
use relay_engine::recovery::RecoveryOptions;

use super::{build_engine, follow, load_task};

/// Recover a stuck task; with `auto_restart` keep streaming the new run.
pub async fn run(
    config: Config,
    project: &Path,
    spec_id: &str,
    target_status: Option<TaskStatus>,
    auto_restart: bool,
) -> anyhow::Result<()> {
    let task = load_task(&config, project, spec_id)?;
    let task_id = task.id;

    let engine = build_engine(config)?;
    let events = engine.subscribe();
    engine.register_task(task);

    let outcome = engine.recover_stuck_task(
        task_id,
        RecoveryOptions {
            target_status,
            auto_restart,
        },
    );
    anyhow::ensure!(outcome.success, "{}", outcome.message);

    println!("{}", outcome.message);
    if !outcome.reset_chunks.is_empty() {
        println!("reset chunks: {}", outcome.reset_chunks.join(", "));
    }

    if outcome.auto_restarted {
        let status = follow(&engine, events, task_id).await?;
        println!("{spec_id} finished in {status}");
    }
    engine.shutdown().await;
    Ok(())
}

use std::path::Path;

use anyhow::Context;
use relay_core::config::Config;
use relay_core::plan::{PlanLoad, PlanStore};

/// Print the persisted plan summary for a task.
pub fn run(config: &Config, project: &Path, spec_id: &str) -> anyhow::Result<()> {
    let store = PlanStore::for_project(project, config);
    let plan = match store
        .load(spec_id)
        .with_context(|| format!("failed to read plan for {spec_id}"))?
    {
        PlanLoad::Loaded(plan) => plan,
        PlanLoad::Missing => {
            println!("{spec_id}: no plan at {}", store.plan_path(spec_id).display());
            return Ok(());
        }
        PlanLoad::Corrupt(e) => anyhow::bail!("plan for {spec_id} is corrupt: {e}"),
    };

    let counts = plan.chunk_counts();
    println!("Spec:      {spec_id}");
    println!("Feature:   {}", plan.feature.as_deref().unwrap_or("-"));
    match (plan.status, plan.review_reason) {
        (Some(status), Some(reason)) => println!("Status:    {status} ({reason:?})"),
        (Some(status), None) => println!("Status:    {status}"),
        (None, _) => println!("Status:    -"),
    }
    println!("Inferred:  {}", plan.infer_status());
    if let Some(updated) = plan.updated_at {
        println!("Updated:   {}", updated.to_rfc3339());
    }
    if let Some(note) = &plan.recovery_note {
        println!("Recovery:  {note}");
    }
    println!();
    println!(
        "Chunks:    {} total, {} completed, {} in progress, {} pending, {} failed, {} other",
        counts.total, counts.completed, counts.in_progress, counts.pending, counts.failed, counts.other
    );
    for phase in &plan.phases {
        println!("  {}", phase.name);
        for chunk in &phase.chunks {
            println!("    [{}] {} {}", chunk.status, chunk.id, chunk.description);
        }
    }
    Ok(())
}

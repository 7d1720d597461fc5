use relay_core::types::Task;

/// Per-task worktree operations run after a human review decision. Branch,
/// merge and discard mechanics live outside the engine.
#[async_trait::async_trait]
pub trait WorktreeHooks: Send + Sync {
    async fn on_approved(&self, _task: &Task) -> Result<(), String> {
        Ok(())
    }

    async fn on_rejected(&self, _task: &Task) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWorktreeHooks;

impl WorktreeHooks for NoopWorktreeHooks {}

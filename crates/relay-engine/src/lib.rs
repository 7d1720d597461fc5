//! Task orchestration engine: supervises external agent processes, infers
//! their progress from output, reconciles task status against the persisted
//! plan, and recovers tasks whose process vanished.

pub mod engine;
pub mod launch;
pub mod phase_detector;
pub mod progress;
pub mod reconciler;
pub mod recovery;
pub mod registry;
pub mod spawner;
pub mod status_machine;
pub mod supervisor;
pub mod worktree;

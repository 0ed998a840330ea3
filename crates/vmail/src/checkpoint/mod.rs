//! Checkpointing of learner state.
//!
//! - `Checkpointable`: components exposing named tensors
//! - `CheckpointManager`: one archive per log directory, replaced atomically

mod manager;
mod state;

pub use manager::CheckpointManager;
pub use state::{CheckpointMeta, Checkpointable};

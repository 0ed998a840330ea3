//! Environment trait and wrappers.
//!
//! Tasks implement `Environment`; the run loop stacks `ActionRepeat`,
//! `NormalizeActions` (or `OneHotAction`), `TimeLimit` and `Collect` on top.

mod traits;
mod wrappers;

pub use traits::{EnvInfo, Environment, Observation, StepResult};
pub use wrappers::{ActionRepeat, Collect, EpisodeSink, NormalizeActions, OneHotAction, TimeLimit};

//! Cross-shard write coordination: the two-phase commit primitive and the
//! cascading-deletion estate walker built on it.

mod estate;
mod two_phase;

pub(crate) use estate::{remove_entity, remove_node};
pub(crate) use two_phase::{Else, TwoPhaseCommit};

pub use two_phase::{list_prepared, resolve_prepared};

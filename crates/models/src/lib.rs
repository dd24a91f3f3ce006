mod id;
mod value;

pub use id::Id;
pub use value::{StorageClass, Value};

/// Shard numbers as they appear in cluster configuration and in the high
/// bits of every [`Id`].
pub type ShardId = u64;

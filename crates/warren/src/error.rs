use models::ShardId;

use crate::Ctx;

pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds surfaced to callers. Backend errors are translated at
/// the coordinator boundary; the database driver's native errors are never
/// exposed beyond the `Db` carrier.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mutation attempted on a read-only pool")]
    ReadOnly,

    #[error("unknown or mismatched context {0}")]
    BadContext(Ctx),

    #[error("flag bit {bit} is not registered for context {ctx}")]
    BadFlag { ctx: Ctx, bit: u8 },

    #[error("value does not match the context's storage class: {0}")]
    StorageClass(String),

    #[error("no live object {0}")]
    NoObject(String),

    #[error("alias {value:?} is already in use under context {ctx}")]
    AliasInUse { ctx: Ctx, value: String },

    #[error("shard {0} is not in the cluster configuration")]
    NoShard(ShardId),

    #[error("operation deadline expired")]
    Timeout,

    #[error("context {0} requires a parent context and has none")]
    MissingParent(Ctx),

    #[error("context {0} is a root context and takes no parent")]
    IsRoot(Ctx),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Db(sqlx::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        // A query cancelled by the operation timer surfaces from the
        // backend as SQLSTATE 57014.
        if sqlstate(&err).as_deref() == Some("57014") {
            return Error::Timeout;
        }
        Error::Db(err)
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Whether the backend rejected a statement on a unique constraint, the
/// signal driving the alias compare-and-set and relationship-pair races.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

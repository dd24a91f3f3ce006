use std::time::Duration;

use models::Id;
use warren_sql::Table;

use super::Entity;
use crate::catalog::FlagSet;
use crate::error::Result;
use crate::pool::Pool;
use crate::timer::OpTimer;
use crate::txn;
use crate::Ctx;

/// Create a new free-standing entity on a shard chosen by the entity
/// insertion plan.
#[tracing::instrument(skip(pool))]
pub async fn create(
    pool: &Pool,
    ctx: Ctx,
    flags: &[u8],
    timeout: Option<Duration>,
) -> Result<Entity> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Entity)?;
    let bits = pool.catalog().flags_to_bits(ctx, flags)?;

    let timer = OpTimer::new(timeout);
    let shard = pool.router().entity_write_shard();
    let mut conn = pool.acquire(shard, &timer).await?;
    let id = warren_sql::entity::insert(ctx, bits, &mut conn).await?;

    Ok(Entity {
        id,
        ctx,
        flags: pool.catalog().bits_to_flags(ctx, bits),
    })
}

pub async fn get(
    pool: &Pool,
    id: Id,
    ctx: Ctx,
    timeout: Option<Duration>,
) -> Result<Option<Entity>> {
    pool.catalog().expect_kind(ctx, Table::Entity)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(id, &timer).await?;
    let flags = warren_sql::entity::select(id, ctx, &mut conn).await?;

    Ok(flags.map(|bits| Entity {
        id,
        ctx,
        flags: pool.catalog().bits_to_flags(ctx, bits),
    }))
}

/// Apply `(flags & ~clear) | add` to the entity's flag bitmap, returning
/// the resulting set, or None when no live entity matched.
pub async fn set_flags(
    pool: &Pool,
    id: Id,
    ctx: Ctx,
    add: &[u8],
    clear: &[u8],
    timeout: Option<Duration>,
) -> Result<Option<FlagSet>> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Entity)?;
    let add = pool.catalog().flags_to_bits(ctx, add)?;
    let clear = pool.catalog().flags_to_bits(ctx, clear)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(id, &timer).await?;
    let flags = warren_sql::entity::set_flags(id, ctx, add, clear, &mut conn).await?;

    Ok(flags.map(|bits| pool.catalog().bits_to_flags(ctx, bits)))
}

/// Cascading removal: tombstone the entity and every record transitively
/// reachable from it, across shards, in one two-phase-commit group.
#[tracing::instrument(skip(pool))]
pub async fn remove(pool: &Pool, id: Id, ctx: Ctx, timeout: Option<Duration>) -> Result<bool> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Entity)?;

    let timer = OpTimer::new(timeout);
    txn::remove_entity(pool, id, ctx, &timer).await
}

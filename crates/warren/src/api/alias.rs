use std::time::Duration;

use models::{Id, ShardId};
use warren_sql::Table;

use super::{no_object, Alias, AliasOwner};
use crate::catalog::FlagSet;
use crate::error::{is_unique_violation, Error, Result};
use crate::pool::Pool;
use crate::timer::OpTimer;
use crate::txn::{Else, TwoPhaseCommit};
use crate::Ctx;

fn validate(pool: &Pool, ctx: Ctx) -> Result<(Table, Ctx)> {
    pool.catalog().expect_kind(ctx, Table::Alias)?;
    pool.catalog().base(ctx)
}

/// Find which read-plan shard holds the live lookup row owned by
/// `base_id`, if any. `Ok(None)` covers both "no such alias" and "owned by
/// somebody else"; the flag and remove verbs treat those the same way.
async fn locate_lookup(
    pool: &Pool,
    digest: &[u8],
    ctx: Ctx,
    base_id: Id,
    timer: &OpTimer,
) -> Result<Option<ShardId>> {
    for shard in pool.router().alias_read_shards(digest) {
        let mut conn = pool.acquire(shard, timer).await?;
        let owner = warren_sql::alias::select_lookup(digest, ctx, &mut conn).await?;
        drop(conn);

        match owner {
            None => continue,
            Some(owner) if owner.base_id != base_id => return Ok(None),
            Some(_) => return Ok(Some(shard)),
        }
    }
    Ok(None)
}

/// Store an alias on an object, enforcing cluster-wide uniqueness of the
/// `(value, ctx)` pair.
///
/// The two-phase commit anchors on the lookup shard chosen by the current
/// write plan: the lookup row is inserted by compare-and-set and prepared,
/// then the primary row is written on the owner's shard, and the anchor
/// commits only once both inserts succeeded.
///
/// Returns false when `base_id` already holds this alias; raises
/// [`Error::AliasInUse`] when another object does.
#[tracing::instrument(skip(pool, value))]
pub async fn set(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &str,
    flags: &[u8],
    index: Option<i32>,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    let (base, base_ctx) = validate(pool, ctx)?;
    let bits = pool.catalog().flags_to_bits(ctx, flags)?;

    let timer = OpTimer::new(timeout);
    let digest = pool.router().digest(value);
    let insert_shard = pool.router().alias_write_shard(&digest);

    // Look for a pre-existing alias on any shard but the current insert
    // shard; the insert shard itself is covered by the compare-and-set.
    for shard in pool.router().alias_read_shards(&digest) {
        if shard == insert_shard {
            continue;
        }
        let mut conn = pool.acquire(shard, &timer).await?;
        let owner = warren_sql::alias::select_lookup(&digest, ctx, &mut conn).await?;
        drop(conn);

        if let Some(owner) = owner {
            if owner.base_id == base_id {
                return Ok(false);
            }
            return Err(Error::AliasInUse {
                ctx,
                value: value.to_owned(),
            });
        }
    }

    let mut tpc = TwoPhaseCommit::new(
        pool,
        insert_shard,
        "set_alias",
        format_args!("{base_id}.{ctx}.{}", hex::encode(digest)),
    );
    let mut guard = tpc.begin(&timer).await?;

    let (inserted, owner_id) =
        match warren_sql::alias::maybe_insert_lookup(&digest, ctx, base_id, bits, &mut guard).await
        {
            Ok(outcome) => outcome,
            Err(err) if is_unique_violation(&err) => {
                // Lost a race past the compare-and-set: the other writer's
                // row was not yet live when we selected, and our insert hit
                // the unique index. The now-committed row decides.
                tpc.abort(guard).await;
                let mut conn = pool.acquire(insert_shard, &timer).await?;
                let owner = warren_sql::alias::select_lookup(&digest, ctx, &mut conn).await?;
                drop(conn);

                match owner {
                    Some(owner) if owner.base_id == base_id => return Ok(false),
                    _ => {
                        return Err(Error::AliasInUse {
                            ctx,
                            value: value.to_owned(),
                        })
                    }
                }
            }
            Err(err) => {
                tpc.abort(guard).await;
                return Err(err.into());
            }
        };

    if !inserted {
        tpc.fail();
        tpc.finish(guard).await?;
        if owner_id == base_id {
            return Ok(false);
        }
        return Err(Error::AliasInUse {
            ctx,
            value: value.to_owned(),
        });
    }

    tpc.finish(guard).await?;

    tpc.elsewhere(&timer, async {
        let mut conn = pool.acquire_by_id(base_id, &timer).await?;
        let inserted =
            warren_sql::alias::insert(base_id, ctx, value, index, bits, base, base_ctx, &mut conn)
                .await?;
        if !inserted {
            return Err(no_object(base, base_ctx, base_id));
        }
        Ok(Else::Commit(true))
    })
    .await
}

/// Resolve an alias value to its owning object through the lookup table,
/// traversing every insertion plan newest-first.
pub async fn lookup(
    pool: &Pool,
    value: &str,
    ctx: Ctx,
    timeout: Option<Duration>,
) -> Result<Option<AliasOwner>> {
    pool.catalog().expect_kind(ctx, Table::Alias)?;

    let timer = OpTimer::new(timeout);
    let digest = pool.router().digest(value);

    for shard in pool.router().alias_read_shards(&digest) {
        let mut conn = pool.acquire(shard, &timer).await?;
        let owner = warren_sql::alias::select_lookup(&digest, ctx, &mut conn).await?;
        drop(conn);

        if let Some(owner) = owner {
            return Ok(Some(AliasOwner {
                base_id: owner.base_id,
                ctx,
                value: value.to_owned(),
                flags: pool.catalog().bits_to_flags(ctx, owner.flags),
            }));
        }
    }
    Ok(None)
}

/// List an object's aliases in position order. Returns the page and the
/// position to pass as `start` for the next page.
pub async fn list(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    limit: i64,
    start: i32,
    timeout: Option<Duration>,
) -> Result<(Vec<Alias>, i32)> {
    validate(pool, ctx)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    let rows = warren_sql::alias::select_many(base_id, ctx, limit, start, &mut conn).await?;

    let next = rows.last().map(|row| row.pos + 1).unwrap_or(0);
    let aliases = rows
        .into_iter()
        .map(|row| Alias {
            base_id,
            ctx,
            value: row.value,
            flags: pool.catalog().bits_to_flags(ctx, row.flags),
            pos: row.pos,
        })
        .collect();
    Ok((aliases, next))
}

/// Apply a flag change to an alias and its lookup row as one consistent
/// write: the change anchors on the lookup shard, and commits only if both
/// rows ended up with the same bitmap.
pub async fn set_flags(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &str,
    add: &[u8],
    clear: &[u8],
    timeout: Option<Duration>,
) -> Result<Option<FlagSet>> {
    pool.assert_writable()?;
    validate(pool, ctx)?;
    let add = pool.catalog().flags_to_bits(ctx, add)?;
    let clear = pool.catalog().flags_to_bits(ctx, clear)?;

    let timer = OpTimer::new(timeout);
    let digest = pool.router().digest(value);

    let Some(lookup_shard) = locate_lookup(pool, &digest, ctx, base_id, &timer).await? else {
        return Ok(None);
    };

    let mut tpc = TwoPhaseCommit::new(
        pool,
        lookup_shard,
        "set_alias_flags",
        format_args!("{base_id}.{ctx}.{}.{}", hex::encode(digest), add | clear),
    );
    let mut guard = tpc.begin(&timer).await?;

    let lookup_flags =
        match warren_sql::alias::set_lookup_flags(&digest, ctx, add, clear, &mut guard).await {
            Ok(flags) => flags,
            Err(err) => {
                tpc.abort(guard).await;
                return Err(err.into());
            }
        };
    let Some(lookup_flags) = lookup_flags else {
        tpc.fail();
        tpc.finish(guard).await?;
        return Ok(None);
    };
    tpc.finish(guard).await?;

    tpc.elsewhere(&timer, async {
        let mut conn = pool.acquire_by_id(base_id, &timer).await?;
        let flags =
            warren_sql::alias::set_flags(base_id, ctx, value, add, clear, &mut conn).await?;

        // Commit only when the two rows agree on the resulting bitmap.
        if flags != Some(lookup_flags) {
            return Ok(Else::Fail(None));
        }
        Ok(Else::Commit(Some(
            pool.catalog().bits_to_flags(ctx, lookup_flags),
        )))
    })
    .await
}

/// Relocate an alias within its object's ordered list, clamped to the
/// list tail.
pub async fn shift(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &str,
    index: i32,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    validate(pool, ctx)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    warren_sql::alias::reorder(base_id, ctx, value, index, &mut conn)
        .await
        .map_err(Into::into)
}

/// Tombstone an alias and its lookup row together, anchoring on the
/// lookup shard.
#[tracing::instrument(skip(pool, value))]
pub async fn remove(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &str,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    validate(pool, ctx)?;

    let timer = OpTimer::new(timeout);
    let digest = pool.router().digest(value);

    let Some(lookup_shard) = locate_lookup(pool, &digest, ctx, base_id, &timer).await? else {
        return Ok(false);
    };

    let mut tpc = TwoPhaseCommit::new(
        pool,
        lookup_shard,
        "remove_alias",
        format_args!("{base_id}.{ctx}.{}", hex::encode(digest)),
    );
    let mut guard = tpc.begin(&timer).await?;

    let removed = match warren_sql::alias::remove_lookup(&digest, ctx, base_id, &mut guard).await {
        Ok(removed) => removed,
        Err(err) => {
            tpc.abort(guard).await;
            return Err(err.into());
        }
    };
    if !removed {
        tpc.fail();
        tpc.finish(guard).await?;
        return Ok(false);
    }
    tpc.finish(guard).await?;

    tpc.elsewhere(&timer, async {
        let mut conn = pool.acquire_by_id(base_id, &timer).await?;
        let removed = warren_sql::alias::remove(base_id, ctx, value, &mut conn).await?;
        if !removed {
            // The primary vanished concurrently; put the lookup back.
            return Ok(Else::Fail(false));
        }
        Ok(Else::Commit(true))
    })
    .await
}

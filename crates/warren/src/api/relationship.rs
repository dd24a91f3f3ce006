use std::time::Duration;

use models::Id;
use warren_sql::Table;

use super::{no_object, Relationship};
use crate::catalog::FlagSet;
use crate::error::{is_unique_violation, Result};
use crate::pool::Pool;
use crate::timer::OpTimer;
use crate::txn::{Else, TwoPhaseCommit};
use crate::Ctx;

/// Create the symmetric row pair tying `base_id` to `rel_id`.
///
/// The forward row anchors the two-phase commit on `base_id`'s shard; the
/// reverse row is written on `rel_id`'s shard before the anchor commits.
/// Returns false when the pair already exists.
#[tracing::instrument(skip(pool))]
pub async fn create(
    pool: &Pool,
    ctx: Ctx,
    base_id: Id,
    rel_id: Id,
    flags: &[u8],
    forward_index: Option<i32>,
    reverse_index: Option<i32>,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Relationship)?;
    let (base, base_ctx) = pool.catalog().base(ctx)?;
    let (rel, rel_ctx) = pool.catalog().rel(ctx)?;
    let bits = pool.catalog().flags_to_bits(ctx, flags)?;

    let timer = OpTimer::new(timeout);
    let mut tpc = TwoPhaseCommit::new(
        pool,
        pool.router().shard_of(base_id),
        "create_relationship",
        format_args!("{base_id}.{rel_id}.{ctx}"),
    );
    let mut guard = tpc.begin(&timer).await?;

    let inserted = match warren_sql::relationship::insert(
        base_id,
        rel_id,
        ctx,
        true,
        forward_index,
        bits,
        base,
        base_ctx,
        &mut guard,
    )
    .await
    {
        Ok(inserted) => inserted,
        Err(err) if is_unique_violation(&err) => {
            tpc.abort(guard).await;
            return Ok(false);
        }
        Err(err) => {
            tpc.abort(guard).await;
            return Err(err.into());
        }
    };
    if !inserted {
        tpc.fail();
        tpc.finish(guard).await?;
        return Err(no_object(base, base_ctx, base_id));
    }
    tpc.finish(guard).await?;

    tpc.elsewhere(&timer, async {
        let mut conn = pool.acquire_by_id(rel_id, &timer).await?;
        let inserted = match warren_sql::relationship::insert(
            base_id,
            rel_id,
            ctx,
            false,
            reverse_index,
            bits,
            rel,
            rel_ctx,
            &mut conn,
        )
        .await
        {
            Ok(inserted) => inserted,
            Err(err) if is_unique_violation(&err) => return Ok(Else::Fail(false)),
            Err(err) => return Err(err.into()),
        };
        if !inserted {
            return Err(no_object(rel, rel_ctx, rel_id));
        }
        Ok(Else::Commit(true))
    })
    .await
}

/// Fetch one pair by its forward row.
pub async fn get(
    pool: &Pool,
    ctx: Ctx,
    base_id: Id,
    rel_id: Id,
    timeout: Option<Duration>,
) -> Result<Option<Relationship>> {
    pool.catalog().expect_kind(ctx, Table::Relationship)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    let row = warren_sql::relationship::select(base_id, rel_id, ctx, true, &mut conn).await?;

    Ok(row.map(|row| Relationship {
        base_id,
        rel_id,
        ctx,
        forward: true,
        flags: pool.catalog().bits_to_flags(ctx, row.flags),
        pos: row.pos,
    }))
}

/// Page one anchor's relationship list by position; `forward` selects
/// which direction's list `id` anchors. Returns the page and the next
/// start position.
pub async fn list(
    pool: &Pool,
    id: Id,
    ctx: Ctx,
    forward: bool,
    limit: i64,
    start: i32,
    peer: Option<Id>,
    timeout: Option<Duration>,
) -> Result<(Vec<Relationship>, i32)> {
    pool.catalog().expect_kind(ctx, Table::Relationship)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(id, &timer).await?;
    let rows =
        warren_sql::relationship::select_many(id, ctx, forward, limit, start, peer, &mut conn)
            .await?;

    let next = rows.last().map(|row| row.pos + 1).unwrap_or(0);
    let relationships = rows
        .into_iter()
        .map(|row| Relationship {
            base_id: row.base_id,
            rel_id: row.rel_id,
            ctx,
            forward,
            flags: pool.catalog().bits_to_flags(ctx, row.flags),
            pos: row.pos,
        })
        .collect();
    Ok((relationships, next))
}

/// Apply a flag change to both rows of a pair as one consistent write;
/// commits only if forward and reverse ended up with the same bitmap.
pub async fn set_flags(
    pool: &Pool,
    base_id: Id,
    rel_id: Id,
    ctx: Ctx,
    add: &[u8],
    clear: &[u8],
    timeout: Option<Duration>,
) -> Result<Option<FlagSet>> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Relationship)?;
    let add = pool.catalog().flags_to_bits(ctx, add)?;
    let clear = pool.catalog().flags_to_bits(ctx, clear)?;

    let timer = OpTimer::new(timeout);
    let mut tpc = TwoPhaseCommit::new(
        pool,
        pool.router().shard_of(base_id),
        "set_relationship_flags",
        format_args!("{base_id}.{rel_id}.{ctx}.{}", add | clear),
    );
    let mut guard = tpc.begin(&timer).await?;

    let flags = match warren_sql::relationship::set_flags(
        base_id, rel_id, ctx, true, add, clear, &mut guard,
    )
    .await
    {
        Ok(flags) => flags,
        Err(err) => {
            tpc.abort(guard).await;
            return Err(err.into());
        }
    };
    let Some(result_flags) = flags else {
        tpc.fail();
        tpc.finish(guard).await?;
        return Ok(None);
    };
    tpc.finish(guard).await?;

    tpc.elsewhere(&timer, async {
        let mut conn = pool.acquire_by_id(rel_id, &timer).await?;
        let flags = warren_sql::relationship::set_flags(
            base_id, rel_id, ctx, false, add, clear, &mut conn,
        )
        .await?;
        if flags != Some(result_flags) {
            return Ok(Else::Fail(None));
        }
        Ok(Else::Commit(Some(
            pool.catalog().bits_to_flags(ctx, result_flags),
        )))
    })
    .await
}

/// Relocate one direction's row within its anchor's ordered list, clamped
/// to the list tail. Positions are per-direction; the peer row is
/// untouched.
pub async fn shift(
    pool: &Pool,
    base_id: Id,
    rel_id: Id,
    ctx: Ctx,
    forward: bool,
    index: i32,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Relationship)?;

    let timer = OpTimer::new(timeout);
    let anchor = if forward { base_id } else { rel_id };
    let mut conn = pool.acquire_by_id(anchor, &timer).await?;
    warren_sql::relationship::reorder(base_id, rel_id, ctx, forward, index, &mut conn)
        .await
        .map_err(Into::into)
}

/// Tombstone both rows of a pair together, anchored on the forward side.
#[tracing::instrument(skip(pool))]
pub async fn remove(
    pool: &Pool,
    base_id: Id,
    rel_id: Id,
    ctx: Ctx,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Relationship)?;

    let timer = OpTimer::new(timeout);
    let mut tpc = TwoPhaseCommit::new(
        pool,
        pool.router().shard_of(base_id),
        "remove_relationship",
        format_args!("{base_id}.{rel_id}.{ctx}"),
    );
    let mut guard = tpc.begin(&timer).await?;

    let removed =
        match warren_sql::relationship::remove(base_id, rel_id, ctx, true, &mut guard).await {
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
        let mut conn = pool.acquire_by_id(rel_id, &timer).await?;
        let removed =
            warren_sql::relationship::remove(base_id, rel_id, ctx, false, &mut conn).await?;
        if !removed {
            return Ok(Else::Fail(false));
        }
        Ok(Else::Commit(true))
    })
    .await
}

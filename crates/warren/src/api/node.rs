use std::collections::HashMap;
use std::time::Duration;

use models::{Id, StorageClass, Value};
use warren_sql::{StoredValue, Table};

use super::Node;
use crate::catalog::FlagSet;
use crate::error::{Error, Result};
use crate::pool::{ConnGuard, Pool};
use crate::timer::OpTimer;
use crate::txn::{self, Else, TwoPhaseCommit};
use crate::Ctx;

fn validate(pool: &Pool, ctx: Ctx) -> Result<(Table, Ctx)> {
    pool.catalog().expect_kind(ctx, Table::Node)?;
    if pool.catalog().base_ctx(ctx).is_none() {
        return Err(Error::MissingParent(ctx));
    }
    pool.catalog().base(ctx)
}

async fn create_in_txn(
    base_id: Id,
    ctx: Ctx,
    stored: &StoredValue,
    bits: i32,
    base: Table,
    base_ctx: Ctx,
    conn: &mut ConnGuard,
) -> Result<Option<Id>> {
    let id = warren_sql::node::insert(ctx, stored, bits, base_id, base, base_ctx, &mut *conn).await?;
    let Some(id) = id else {
        return Ok(None);
    };

    // Same transaction as the parent-checked node insert, so the edge
    // needs no second existence predicate.
    let attached = warren_sql::edge::insert(base_id, ctx, id, None, None, &mut *conn).await?;
    if !attached {
        return Ok(None);
    }
    Ok(Some(id))
}

/// Create a node under a parent entity or node. The node row and its edge
/// land on the parent's shard in one local transaction; a missing or
/// tombstoned parent raises [`Error::NoObject`].
#[tracing::instrument(skip(pool, value))]
pub async fn create(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &Value,
    flags: &[u8],
    timeout: Option<Duration>,
) -> Result<Node> {
    pool.assert_writable()?;
    let (base, base_ctx) = validate(pool, ctx)?;
    let bits = pool.catalog().flags_to_bits(ctx, flags)?;
    let stored = pool.catalog().wrap(ctx, value)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;

    if let Err(err) = sqlx::query("begin").execute(&mut *conn).await {
        conn.mark_broken();
        return Err(err.into());
    }
    match create_in_txn(base_id, ctx, &stored, bits, base, base_ctx, &mut conn).await {
        Err(err) => {
            conn.rollback_quietly().await;
            Err(err)
        }
        Ok(None) => {
            conn.rollback_quietly().await;
            Err(super::no_object(base, base_ctx, base_id))
        }
        Ok(Some(id)) => {
            if let Err(err) = sqlx::query("commit").execute(&mut *conn).await {
                conn.mark_broken();
                return Err(err.into());
            }
            Ok(Node {
                id,
                ctx,
                value: value.clone(),
                flags: pool.catalog().bits_to_flags(ctx, bits),
            })
        }
    }
}

pub async fn get(pool: &Pool, id: Id, ctx: Ctx, timeout: Option<Duration>) -> Result<Option<Node>> {
    pool.catalog().expect_kind(ctx, Table::Node)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(id, &timer).await?;
    let row = warren_sql::node::select(id, ctx, &mut conn).await?;

    row.map(|row| {
        Ok(Node {
            id,
            ctx,
            value: pool.catalog().unwrap(ctx, row.value)?,
            flags: pool.catalog().bits_to_flags(ctx, row.flags),
        })
    })
    .transpose()
}

/// Batch fetch nodes by `(id, ctx)` pairs, grouped per shard; results come
/// back in input order with None for absent rows.
pub async fn get_many(
    pool: &Pool,
    pairs: &[(Id, Ctx)],
    timeout: Option<Duration>,
) -> Result<Vec<Option<Node>>> {
    for (_, ctx) in pairs {
        pool.catalog().expect_kind(*ctx, Table::Node)?;
    }

    let timer = OpTimer::new(timeout);
    let mut by_shard: HashMap<models::ShardId, Vec<(Id, Ctx)>> = HashMap::new();
    for &(id, ctx) in pairs {
        by_shard
            .entry(pool.router().shard_of(id))
            .or_default()
            .push((id, ctx));
    }

    let mut found = HashMap::new();
    for (shard, shard_pairs) in by_shard {
        let mut conn = pool.acquire(shard, &timer).await?;
        let rows = warren_sql::node::select_many(&shard_pairs, &mut conn).await?;
        drop(conn);

        for row in rows {
            let node = Node {
                id: row.id,
                ctx: row.ctx,
                value: pool.catalog().unwrap(row.ctx, row.value)?,
                flags: pool.catalog().bits_to_flags(row.ctx, row.flags),
            };
            found.insert((row.id, row.ctx), node);
        }
    }

    Ok(pairs.iter().map(|key| found.remove(key)).collect())
}

/// Page a parent's child ids in edge-position order. Returns the ids and
/// the next start position.
pub async fn list_children(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    limit: i64,
    start: i32,
    timeout: Option<Duration>,
) -> Result<(Vec<Id>, i32)> {
    pool.catalog().expect_kind(ctx, Table::Node)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    let rows = warren_sql::edge::select_children(base_id, ctx, limit, start, &mut conn).await?;

    let next = rows.last().map(|(_, pos)| pos + 1).unwrap_or(0);
    Ok((rows.into_iter().map(|(id, _)| id).collect(), next))
}

/// Fetch a parent's children as full nodes, preserving edge order. A moved
/// node keeps its original shard, so the fetch fans out as needed.
pub async fn get_children(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    limit: i64,
    start: i32,
    timeout: Option<Duration>,
) -> Result<(Vec<Node>, i32)> {
    let (ids, next) = list_children(pool, base_id, ctx, limit, start, timeout).await?;
    let pairs: Vec<(Id, Ctx)> = ids.iter().map(|&id| (id, ctx)).collect();
    let nodes = get_many(pool, &pairs, timeout).await?;
    Ok((nodes.into_iter().flatten().collect(), next))
}

/// Overwrite a node's value; with `old_value` given, only when the stored
/// value still matches it (compare-and-set).
pub async fn update(
    pool: &Pool,
    id: Id,
    ctx: Ctx,
    value: &Value,
    old_value: Option<&Value>,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Node)?;
    let stored = pool.catalog().wrap(ctx, value)?;
    let old_stored = old_value.map(|v| pool.catalog().wrap(ctx, v)).transpose()?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(id, &timer).await?;
    warren_sql::node::update(id, ctx, &stored, old_stored.as_ref(), &mut conn)
        .await
        .map_err(Into::into)
}

/// Add `by` to an integer node, optionally saturating at `limit`.
pub async fn increment(
    pool: &Pool,
    id: Id,
    ctx: Ctx,
    by: i64,
    limit: Option<i64>,
    timeout: Option<Duration>,
) -> Result<Option<i64>> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Node)?;
    if pool.catalog().storage(ctx) != StorageClass::Int {
        return Err(Error::StorageClass(format!(
            "increment requires int storage on context {ctx}"
        )));
    }

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(id, &timer).await?;
    warren_sql::node::increment(id, ctx, by, limit, &mut conn)
        .await
        .map_err(Into::into)
}

pub async fn set_flags(
    pool: &Pool,
    id: Id,
    ctx: Ctx,
    add: &[u8],
    clear: &[u8],
    timeout: Option<Duration>,
) -> Result<Option<FlagSet>> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Node)?;
    let add = pool.catalog().flags_to_bits(ctx, add)?;
    let clear = pool.catalog().flags_to_bits(ctx, clear)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(id, &timer).await?;
    let flags = warren_sql::node::set_flags(id, ctx, add, clear, &mut conn).await?;

    Ok(flags.map(|bits| pool.catalog().bits_to_flags(ctx, bits)))
}

/// Relocate a child within its parent's ordered list, clamped to the tail.
pub async fn shift(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    id: Id,
    index: i32,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Node)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    warren_sql::edge::reorder(base_id, ctx, id, index, &mut conn)
        .await
        .map_err(Into::into)
}

/// Move a node to a new parent. The move is logical: only the edge rows
/// change, the node's shard of residence is fixed for its lifetime.
///
/// Parents on one shard move in a single local transaction; otherwise the
/// edge removal anchors a two-phase commit and the insert on the new
/// parent's shard decides it.
#[tracing::instrument(skip(pool))]
pub async fn move_node(
    pool: &Pool,
    id: Id,
    ctx: Ctx,
    base_id: Id,
    new_base_id: Id,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    let (base, base_ctx) = validate(pool, ctx)?;

    let timer = OpTimer::new(timeout);
    let old_shard = pool.router().shard_of(base_id);
    let new_shard = pool.router().shard_of(new_base_id);

    if old_shard == new_shard {
        let mut conn = pool.acquire(old_shard, &timer).await?;
        if let Err(err) = sqlx::query("begin").execute(&mut *conn).await {
            conn.mark_broken();
            return Err(err.into());
        }

        let moved = async {
            if !warren_sql::edge::remove(base_id, ctx, id, &mut conn).await? {
                return Ok(false);
            }
            warren_sql::edge::insert(
                new_base_id,
                ctx,
                id,
                None,
                Some((base, base_ctx)),
                &mut conn,
            )
            .await
        }
        .await;

        return match moved {
            Err(err) => {
                conn.rollback_quietly().await;
                Err(err.into())
            }
            Ok(false) => {
                conn.rollback_quietly().await;
                Ok(false)
            }
            Ok(true) => {
                if let Err(err) = sqlx::query("commit").execute(&mut *conn).await {
                    conn.mark_broken();
                    return Err(err.into());
                }
                Ok(true)
            }
        };
    }

    let mut tpc = TwoPhaseCommit::new(
        pool,
        old_shard,
        "move_node",
        format_args!("{id}.{ctx}.{base_id}.{new_base_id}"),
    );
    let mut guard = tpc.begin(&timer).await?;

    let removed = match warren_sql::edge::remove(base_id, ctx, id, &mut guard).await {
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
        let mut conn = pool.acquire(new_shard, &timer).await?;
        let attached = warren_sql::edge::insert(
            new_base_id,
            ctx,
            id,
            None,
            Some((base, base_ctx)),
            &mut conn,
        )
        .await?;
        if !attached {
            return Ok(Else::Fail(false));
        }
        Ok(Else::Commit(true))
    })
    .await
}

/// Cascading removal: tombstone the node's edge, the node, and everything
/// transitively reachable from it.
#[tracing::instrument(skip(pool))]
pub async fn remove(
    pool: &Pool,
    id: Id,
    ctx: Ctx,
    base_id: Id,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Node)?;

    let timer = OpTimer::new(timeout);
    txn::remove_node(pool, id, ctx, base_id, &timer).await
}

use sqlx::{PgConnection, Row};

use super::{flags, Id, Table};

pub struct RelationshipRow {
    pub base_id: Id,
    pub rel_id: Id,
    pub ctx: i32,
    pub forward: bool,
    pub flags: i32,
    pub pos: i32,
}

/// One end of a removed pair, as reported by the cascade helpers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationshipRef {
    pub base_id: Id,
    pub ctx: i32,
    pub forward: bool,
    pub rel_id: Id,
}

impl RelationshipRef {
    /// The id whose list this row belongs to.
    pub fn anchor(&self) -> Id {
        if self.forward {
            self.base_id
        } else {
            self.rel_id
        }
    }

    /// The matching row of the opposite direction.
    pub fn peer(&self) -> RelationshipRef {
        RelationshipRef {
            base_id: self.base_id,
            ctx: self.ctx,
            forward: !self.forward,
            rel_id: self.rel_id,
        }
    }
}

/// Insert one direction of a relationship pair. The existence predicate
/// runs against the anchor of the direction being written: `base_id` for
/// forward rows, `rel_id` for reverse rows.
pub async fn insert(
    base_id: Id,
    rel_id: Id,
    ctx: i32,
    forward: bool,
    index: Option<i32>,
    flag_bits: i32,
    anchor: Table,
    anchor_ctx: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let anchor_col = if forward { "base_id" } else { "rel_id" };
    let anchor_id = if forward { base_id } else { rel_id };

    let done = match index {
        None => {
            let sql = format!(
                r#"
                insert into relationship (base_id, rel_id, ctx, forward, pos, flags)
                select $1, $2, $3, $4, (
                    select count(*)
                    from relationship
                    where
                        time_removed is null
                        and {anchor_col} = $5
                        and ctx = $3
                        and forward = $4
                ), $6
                where exists (
                    select 1
                    from {anchor}
                    where
                        time_removed is null
                        and id = $5
                        and ctx = $7
                )
                returning 1
                "#,
            );
            sqlx::query(&sql)
                .bind(base_id)
                .bind(rel_id)
                .bind(ctx)
                .bind(forward)
                .bind(anchor_id)
                .bind(flag_bits)
                .bind(anchor_ctx)
                .execute(conn)
                .await?
        }
        Some(index) => {
            let sql = format!(
                r#"
                with eligible as (
                    select 1
                    from {anchor}
                    where
                        time_removed is null
                        and id = $5
                        and ctx = $7
                ), bump as (
                    update relationship
                    set pos = pos + 1
                    where
                        exists (select 1 from eligible)
                        and time_removed is null
                        and forward = $4
                        and {anchor_col} = $5
                        and ctx = $3
                        and pos >= $8
                )
                insert into relationship (base_id, rel_id, ctx, forward, pos, flags)
                select $1, $2, $3, $4, $8, $6
                where exists (select 1 from eligible)
                returning 1
                "#,
            );
            sqlx::query(&sql)
                .bind(base_id)
                .bind(rel_id)
                .bind(ctx)
                .bind(forward)
                .bind(anchor_id)
                .bind(flag_bits)
                .bind(anchor_ctx)
                .bind(index)
                .execute(conn)
                .await?
        }
    };

    Ok(done.rows_affected() > 0)
}

pub async fn select(
    base_id: Id,
    rel_id: Id,
    ctx: i32,
    forward: bool,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<RelationshipRow>> {
    let row = sqlx::query(
        r#"
        select flags, pos
        from relationship
        where
            time_removed is null
            and base_id = $1
            and rel_id = $2
            and ctx = $3
            and forward = $4
        "#,
    )
    .bind(base_id)
    .bind(rel_id)
    .bind(ctx)
    .bind(forward)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|r| RelationshipRow {
        base_id,
        rel_id,
        ctx,
        forward,
        flags: r.get(0),
        pos: r.get(1),
    }))
}

/// Page one anchor's list by position, optionally pinned to a single peer.
pub async fn select_many(
    anchor_id: Id,
    ctx: i32,
    forward: bool,
    limit: i64,
    start_pos: i32,
    peer: Option<Id>,
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<RelationshipRow>> {
    let (anchor_col, peer_col) = if forward {
        ("base_id", "rel_id")
    } else {
        ("rel_id", "base_id")
    };
    let peer_clause = if peer.is_some() {
        format!("and {peer_col} = $6")
    } else {
        String::new()
    };
    let sql = format!(
        r#"
        select {peer_col}, flags, pos
        from relationship
        where
            time_removed is null
            and {anchor_col} = $1
            and ctx = $2
            and forward = $3
            and pos >= $4
            {peer_clause}
        order by pos asc
        limit $5
        "#,
    );

    let mut query = sqlx::query(&sql)
        .bind(anchor_id)
        .bind(ctx)
        .bind(forward)
        .bind(start_pos)
        .bind(limit);
    if let Some(peer) = peer {
        query = query.bind(peer);
    }
    let rows = query.fetch_all(conn).await?;

    Ok(rows
        .into_iter()
        .map(|r| {
            let peer_id: Id = r.get(0);
            let (base_id, rel_id) = if forward {
                (anchor_id, peer_id)
            } else {
                (peer_id, anchor_id)
            };
            RelationshipRow {
                base_id,
                rel_id,
                ctx,
                forward,
                flags: r.get(1),
                pos: r.get(2),
            }
        })
        .collect())
}

pub async fn reorder(
    base_id: Id,
    rel_id: Id,
    ctx: i32,
    forward: bool,
    pos: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let anchor_col = if forward { "base_id" } else { "rel_id" };
    let anchor_id = if forward { base_id } else { rel_id };
    let sql = format!(
        r#"
        with target as (
            select least($6, count(*)::int - 1) as pos
            from relationship
            where
                time_removed is null
                and forward = $3
                and {anchor_col} = $4
                and ctx = $5
        ), oldpos as (
            select pos
            from relationship
            where
                time_removed is null
                and forward = $3
                and base_id = $1
                and ctx = $5
                and rel_id = $2
        ), bump as (
            update relationship
            set pos = pos + (case
                when (select pos from oldpos) < pos
                then -1
                else 1
                end)
            where
                exists (select 1 from oldpos)
                and time_removed is null
                and forward = $3
                and {anchor_col} = $4
                and ctx = $5
                and not (base_id = $1 and rel_id = $2)
                and pos between symmetric
                    (select pos from oldpos) and (select pos from target)
        ), move as (
            update relationship
            set pos = (select pos from target)
            where
                time_removed is null
                and forward = $3
                and base_id = $1
                and ctx = $5
                and rel_id = $2
            returning 1
        )
        select exists (select 1 from move)
        "#,
    );

    sqlx::query_scalar::<_, bool>(&sql)
        .bind(base_id)
        .bind(rel_id)
        .bind(forward)
        .bind(anchor_id)
        .bind(ctx)
        .bind(pos)
        .fetch_one(conn)
        .await
}

pub async fn remove(
    base_id: Id,
    rel_id: Id,
    ctx: i32,
    forward: bool,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let anchor_col = if forward { "base_id" } else { "rel_id" };
    let anchor_id = if forward { base_id } else { rel_id };
    let sql = format!(
        r#"
        with removal as (
            update relationship
            set time_removed = now()
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
                and forward = $3
                and rel_id = $4
            returning pos
        ), bump as (
            update relationship
            set pos = pos - 1
            where
                exists (select 1 from removal)
                and time_removed is null
                and {anchor_col} = $5
                and ctx = $2
                and forward = $3
                and pos > (select pos from removal)
        )
        select exists (select 1 from removal)
        "#,
    );

    sqlx::query_scalar::<_, bool>(&sql)
        .bind(base_id)
        .bind(ctx)
        .bind(forward)
        .bind(rel_id)
        .bind(anchor_id)
        .fetch_one(conn)
        .await
}

/// Cascade helper: tombstone every row anchored at the listed ids in either
/// direction, returning each removed row so its peer can be chased to the
/// peer's shard.
pub async fn remove_multiple_bases(
    ids: &[Id],
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<RelationshipRef>> {
    let rows = sqlx::query(
        r#"
        with forwardrels (base_id, ctx, forward, rel_id) as (
            update relationship
            set time_removed = now()
            where
                time_removed is null
                and forward = true
                and base_id = any($1)
            returning base_id, ctx, forward, rel_id
        ),
        backwardrels (base_id, ctx, forward, rel_id) as (
            update relationship
            set time_removed = now()
            where
                time_removed is null
                and forward = false
                and rel_id = any($1)
            returning base_id, ctx, forward, rel_id
        )
        select base_id, ctx, forward, rel_id from forwardrels
        union all
        select base_id, ctx, forward, rel_id from backwardrels
        "#,
    )
    .bind(ids)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| RelationshipRef {
            base_id: r.get(0),
            ctx: r.get(1),
            forward: r.get(2),
            rel_id: r.get(3),
        })
        .collect())
}

/// Cascade helper: tombstone an exact batch of rows on this shard.
pub async fn remove_multi(rows: &[RelationshipRef], conn: &mut PgConnection) -> sqlx::Result<u64> {
    let bases: Vec<Id> = rows.iter().map(|r| r.base_id).collect();
    let ctxs: Vec<i32> = rows.iter().map(|r| r.ctx).collect();
    let forwards: Vec<bool> = rows.iter().map(|r| r.forward).collect();
    let rels: Vec<Id> = rows.iter().map(|r| r.rel_id).collect();

    let done = sqlx::query(
        r#"
        update relationship
        set time_removed = now()
        where
            time_removed is null
            and (base_id, ctx, forward, rel_id) in (
                select * from unnest($1::bigint[], $2::int[], $3::bool[], $4::bigint[])
            )
        "#,
    )
    .bind(bases)
    .bind(ctxs)
    .bind(forwards)
    .bind(rels)
    .execute(conn)
    .await?;

    Ok(done.rows_affected())
}

/// Re-densify the position order of whole lists after a cascade punched
/// holes in them: every live row of each `(anchor, ctx)` list is renumbered
/// 0..N-1 preserving relative order.
#[tracing::instrument(err, level = "debug", skip(pairs, conn))]
pub async fn bulk_reorder(
    pairs: &[(Id, i32)],
    forward: bool,
    conn: &mut PgConnection,
) -> sqlx::Result<u64> {
    let anchor_col = if forward { "base_id" } else { "rel_id" };
    let data_col = if forward { "rel_id" } else { "base_id" };

    let anchors: Vec<Id> = pairs.iter().map(|(id, _)| *id).collect();
    let ctxs: Vec<i32> = pairs.iter().map(|(_, c)| *c).collect();

    let sql = format!(
        r#"
        update relationship
        set pos = ordering.counter - 1
        from (
            select row_number() over (
                partition by {anchor_col}, ctx
                order by pos asc
            ) counter, {anchor_col}, ctx, {data_col}
            from relationship
            where
                time_removed is null
                and forward = $1
                and ({anchor_col}, ctx) in (
                    select * from unnest($2::bigint[], $3::int[])
                )
        ) as ordering
        where
            relationship.{anchor_col} = ordering.{anchor_col}
            and relationship.ctx = ordering.ctx
            and relationship.{data_col} = ordering.{data_col}
            and relationship.time_removed is null
            and relationship.forward = $1
        "#,
    );

    let done = sqlx::query(&sql)
        .bind(forward)
        .bind(anchors)
        .bind(ctxs)
        .execute(conn)
        .await?;

    Ok(done.rows_affected())
}

pub async fn set_flags(
    base_id: Id,
    rel_id: Id,
    ctx: i32,
    forward: bool,
    add: i32,
    clear: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i32>> {
    let (expr, masks) = flags::expr(add, clear, 5);
    let sql = format!(
        r#"
        update relationship
        set flags = {expr}
        where
            time_removed is null
            and base_id = $1
            and rel_id = $2
            and ctx = $3
            and forward = $4
        returning flags
        "#,
    );

    let mut query = sqlx::query(&sql)
        .bind(base_id)
        .bind(rel_id)
        .bind(ctx)
        .bind(forward);
    for mask in masks {
        query = query.bind(mask);
    }
    let row = query.fetch_optional(conn).await?;
    Ok(row.map(|r| r.get(0)))
}

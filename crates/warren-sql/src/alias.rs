use sqlx::{PgConnection, Row};

use super::{flags, Id, Table};

pub struct AliasRow {
    pub base_id: Id,
    pub ctx: i32,
    pub value: String,
    pub flags: i32,
    pub pos: i32,
}

pub struct LookupOwner {
    pub base_id: Id,
    pub ctx: i32,
    pub flags: i32,
}

/// Insert a primary alias row. The parent-existence predicate is part of
/// the statement; appends take the next position, explicit indexes bump
/// everything at or above the slot up by one first.
pub async fn insert(
    base_id: Id,
    ctx: i32,
    value: &str,
    index: Option<i32>,
    flag_bits: i32,
    base: Table,
    base_ctx: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let done = match index {
        None => {
            let sql = format!(
                r#"
                insert into alias (base_id, ctx, value, pos, flags)
                select $1, $2, $3, (
                    select count(*)
                    from alias
                    where
                        time_removed is null
                        and base_id = $1
                        and ctx = $2
                ), $4
                where exists (
                    select 1 from {base}
                    where
                        time_removed is null
                        and id = $1
                        and ctx = $5
                )
                "#,
            );
            sqlx::query(&sql)
                .bind(base_id)
                .bind(ctx)
                .bind(value)
                .bind(flag_bits)
                .bind(base_ctx)
                .execute(conn)
                .await?
        }
        Some(index) => {
            let sql = format!(
                r#"
                with existence as (
                    select 1 from {base}
                    where
                        time_removed is null
                        and id = $1
                        and ctx = $5
                ), increment as (
                    update alias
                    set pos = pos + 1
                    where
                        exists (select 1 from existence)
                        and time_removed is null
                        and base_id = $1
                        and ctx = $2
                        and pos >= $6
                )
                insert into alias (base_id, ctx, value, pos, flags)
                select $1, $2, $3, $6, $4
                where exists (select 1 from existence)
                "#,
            );
            sqlx::query(&sql)
                .bind(base_id)
                .bind(ctx)
                .bind(value)
                .bind(flag_bits)
                .bind(base_ctx)
                .bind(index)
                .execute(conn)
                .await?
        }
    };

    Ok(done.rows_affected() > 0)
}

pub async fn select_many(
    base_id: Id,
    ctx: i32,
    limit: i64,
    start_pos: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<AliasRow>> {
    let rows = sqlx::query(
        r#"
        select flags, value, pos
        from alias
        where
            time_removed is null
            and base_id = $1
            and ctx = $2
            and pos >= $3
        order by pos asc
        limit $4
        "#,
    )
    .bind(base_id)
    .bind(ctx)
    .bind(start_pos)
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| AliasRow {
            base_id,
            ctx,
            flags: r.get(0),
            value: r.get(1),
            pos: r.get(2),
        })
        .collect())
}

/// Slide the row identified by value to `pos`, clamped to the list tail,
/// shifting the rows in between by one toward the vacated slot.
pub async fn reorder(
    base_id: Id,
    ctx: i32,
    value: &str,
    pos: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    sqlx::query_scalar::<_, bool>(
        r#"
        with target as (
            select least($4, count(*)::int - 1) as pos
            from alias
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
        ), oldpos as (
            select pos
            from alias
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
                and value = $3
        ), bump as (
            update alias
            set pos = pos + (case
                when (select pos from oldpos) < pos
                then -1
                else 1
                end)
            where
                exists (select 1 from oldpos)
                and time_removed is null
                and base_id = $1
                and ctx = $2
                and value <> $3
                and pos between symmetric
                    (select pos from oldpos) and (select pos from target)
        ), move as (
            update alias
            set pos = (select pos from target)
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
                and value = $3
            returning 1
        )
        select exists (select 1 from move)
        "#,
    )
    .bind(base_id)
    .bind(ctx)
    .bind(value)
    .bind(pos)
    .fetch_one(conn)
    .await
}

/// Tombstone one alias and close the hole it leaves in the position order.
pub async fn remove(
    base_id: Id,
    ctx: i32,
    value: &str,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    sqlx::query_scalar::<_, bool>(
        r#"
        with removal as (
            update alias
            set time_removed = now()
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
                and value = $3
            returning pos
        ), bump as (
            update alias
            set pos = pos - 1
            where
                exists (select 1 from removal)
                and time_removed is null
                and base_id = $1
                and ctx = $2
                and pos > (select pos from removal)
        )
        select exists (select 1 from removal)
        "#,
    )
    .bind(base_id)
    .bind(ctx)
    .bind(value)
    .fetch_one(conn)
    .await
}

/// Cascade helper: tombstone every alias of every listed base, returning
/// the `(value, ctx)` pairs so lookup rows can be chased across shards.
pub async fn remove_multiple_bases(
    base_ids: &[Id],
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<(String, i32)>> {
    let rows = sqlx::query(
        r#"
        update alias
        set time_removed = now()
        where
            time_removed is null
            and base_id = any($1)
        returning value, ctx
        "#,
    )
    .bind(base_ids)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|r| (r.get(0), r.get(1))).collect())
}

pub async fn set_flags(
    base_id: Id,
    ctx: i32,
    value: &str,
    add: i32,
    clear: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i32>> {
    let (expr, masks) = flags::expr(add, clear, 4);
    let sql = format!(
        r#"
        update alias
        set flags = {expr}
        where
            time_removed is null
            and base_id = $1
            and ctx = $2
            and value = $3
        returning flags
        "#,
    );

    let mut query = sqlx::query(&sql).bind(base_id).bind(ctx).bind(value);
    for mask in masks {
        query = query.bind(mask);
    }
    let row = query.fetch_optional(conn).await?;
    Ok(row.map(|r| r.get(0)))
}

/// Compare-and-set insert of the lookup row enforcing global alias
/// uniqueness. Returns `(inserted, owner)`: when a live row already holds
/// the key, nothing is written and the current owner comes back.
#[tracing::instrument(err, level = "debug", skip(digest, conn))]
pub async fn maybe_insert_lookup(
    digest: &[u8],
    ctx: i32,
    base_id: Id,
    flag_bits: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<(bool, Id)> {
    let row = sqlx::query(
        r#"
        with selectquery (base_id) as (
            select base_id
            from alias_lookup
            where
                time_removed is null
                and hash = $1
                and ctx = $2
        ),
        insertquery as (
            insert into alias_lookup (hash, ctx, base_id, flags)
            select $1, $2, $3, $4
            where not exists (select 1 from selectquery)
        )
        select base_id
        from selectquery
        "#,
    )
    .bind(digest)
    .bind(ctx)
    .bind(base_id)
    .bind(flag_bits)
    .fetch_optional(conn)
    .await?;

    match row {
        Some(r) => Ok((false, r.get(0))),
        None => Ok((true, base_id)),
    }
}

pub async fn select_lookup(
    digest: &[u8],
    ctx: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<LookupOwner>> {
    let row = sqlx::query(
        r#"
        select base_id, flags
        from alias_lookup
        where
            time_removed is null
            and hash = $1
            and ctx = $2
        "#,
    )
    .bind(digest)
    .bind(ctx)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|r| LookupOwner {
        base_id: r.get(0),
        ctx,
        flags: r.get(1),
    }))
}

pub async fn remove_lookup(
    digest: &[u8],
    ctx: i32,
    base_id: Id,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update alias_lookup
        set time_removed = now()
        where
            time_removed is null
            and hash = $1
            and ctx = $2
            and base_id = $3
        "#,
    )
    .bind(digest)
    .bind(ctx)
    .bind(base_id)
    .execute(conn)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// Cascade helper: tombstone a batch of lookup keys on this shard,
/// returning the keys actually removed so optimistic entries queued for
/// other shards can be discarded.
pub async fn remove_lookups_multi(
    keys: &[(Vec<u8>, i32)],
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<(Vec<u8>, i32)>> {
    let hashes: Vec<Vec<u8>> = keys.iter().map(|(h, _)| h.clone()).collect();
    let ctxs: Vec<i32> = keys.iter().map(|(_, c)| *c).collect();

    let rows = sqlx::query(
        r#"
        update alias_lookup
        set time_removed = now()
        where
            time_removed is null
            and (hash, ctx) in (select * from unnest($1::bytea[], $2::int[]))
        returning hash, ctx
        "#,
    )
    .bind(hashes)
    .bind(ctxs)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|r| (r.get(0), r.get(1))).collect())
}

pub async fn set_lookup_flags(
    digest: &[u8],
    ctx: i32,
    add: i32,
    clear: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i32>> {
    let (expr, masks) = flags::expr(add, clear, 3);
    let sql = format!(
        r#"
        update alias_lookup
        set flags = {expr}
        where
            time_removed is null
            and hash = $1
            and ctx = $2
        returning flags
        "#,
    );

    let mut query = sqlx::query(&sql).bind(digest).bind(ctx);
    for mask in masks {
        query = query.bind(mask);
    }
    let row = query.fetch_optional(conn).await?;
    Ok(row.map(|r| r.get(0)))
}

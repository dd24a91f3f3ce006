use sqlx::{PgConnection, Row};

use super::{flags, Id, Table};

pub struct NameRow {
    pub base_id: Id,
    pub ctx: i32,
    pub value: String,
    pub flags: i32,
    pub pos: i32,
}

/// A row of `prefix_lookup` or `phonetic_lookup` as returned by a search.
pub struct SearchRow {
    pub base_id: Id,
    pub ctx: i32,
    pub value: String,
    pub flags: i32,
}

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
                insert into name (base_id, ctx, value, flags, pos)
                select $1, $2, $3, $4, (
                    select count(*)
                    from name
                    where
                        time_removed is null
                        and base_id = $1
                        and ctx = $2
                )
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
                    update name
                    set pos = pos + 1
                    where
                        exists (select 1 from existence)
                        and time_removed is null
                        and base_id = $1
                        and ctx = $2
                        and pos >= $6
                )
                insert into name (base_id, ctx, value, flags, pos)
                select $1, $2, $3, $4, $6
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
) -> sqlx::Result<Vec<NameRow>> {
    let rows = sqlx::query(
        r#"
        select flags, value, pos
        from name
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
        .map(|r| NameRow {
            base_id,
            ctx,
            flags: r.get(0),
            value: r.get(1),
            pos: r.get(2),
        })
        .collect())
}

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
            from name
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
        ), oldpos as (
            select pos
            from name
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
                and value = $3
        ), bump as (
            update name
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
            update name
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

pub async fn remove(
    base_id: Id,
    ctx: i32,
    value: &str,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    sqlx::query_scalar::<_, bool>(
        r#"
        with removal as (
            update name
            set time_removed = now()
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
                and value = $3
            returning pos
        ), bump as (
            update name
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

/// Cascade helper: tombstone every name of every listed base, returning
/// `(base_id, value, ctx)` rows for lookup chasing.
pub async fn remove_multiple_bases(
    base_ids: &[Id],
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<(Id, String, i32)>> {
    let rows = sqlx::query(
        r#"
        update name
        set time_removed = now()
        where
            time_removed is null
            and base_id = any($1)
        returning base_id, value, ctx
        "#,
    )
    .bind(base_ids)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| (r.get(0), r.get(1), r.get(2)))
        .collect())
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
        update name
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

pub async fn insert_prefix_lookup(
    value: &str,
    flag_bits: i32,
    ctx: i32,
    base_id: Id,
    conn: &mut PgConnection,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into prefix_lookup (value, flags, ctx, base_id)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(value)
    .bind(flag_bits)
    .bind(ctx)
    .bind(base_id)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn select_prefix_lookup(
    value: &str,
    ctx: i32,
    base_id: Id,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i32>> {
    sqlx::query_scalar::<_, i32>(
        r#"
        select flags
        from prefix_lookup
        where
            time_removed is null
            and ctx = $1
            and value = $2
            and base_id = $3
        "#,
    )
    .bind(ctx)
    .bind(value)
    .bind(base_id)
    .fetch_optional(conn)
    .await
}

/// Page matching prefixes in value order; `start` is the last value of the
/// previous page (exclusive).
pub async fn search_prefix(
    value: &str,
    ctx: i32,
    limit: i64,
    start: &str,
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<SearchRow>> {
    let rows = sqlx::query(
        r#"
        select base_id, flags, value
        from prefix_lookup
        where
            time_removed is null
            and ctx = $1
            and value like $2 || '%'
            and value > $3
        order by value
        limit $4
        "#,
    )
    .bind(ctx)
    .bind(value)
    .bind(start)
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| SearchRow {
            base_id: r.get(0),
            ctx,
            flags: r.get(1),
            value: r.get(2),
        })
        .collect())
}

pub async fn remove_prefix_lookup(
    value: &str,
    ctx: i32,
    base_id: Id,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update prefix_lookup
        set time_removed = now()
        where
            time_removed is null
            and ctx = $1
            and value = $2
            and base_id = $3
        "#,
    )
    .bind(ctx)
    .bind(value)
    .bind(base_id)
    .execute(conn)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// Cascade helper over `(value, ctx, base_id)` triples; returns the triples
/// actually removed on this shard.
pub async fn remove_prefix_lookups_multi(
    keys: &[(String, i32, Id)],
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<(String, i32, Id)>> {
    let values: Vec<&str> = keys.iter().map(|(v, _, _)| v.as_str()).collect();
    let ctxs: Vec<i32> = keys.iter().map(|(_, c, _)| *c).collect();
    let bases: Vec<Id> = keys.iter().map(|(_, _, b)| *b).collect();

    let rows = sqlx::query(
        r#"
        update prefix_lookup
        set time_removed = now()
        where
            time_removed is null
            and (value, ctx, base_id) in (
                select * from unnest($1::text[], $2::int[], $3::bigint[])
            )
        returning value, ctx, base_id
        "#,
    )
    .bind(values)
    .bind(ctxs)
    .bind(bases)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| (r.get(0), r.get(1), r.get(2)))
        .collect())
}

pub async fn set_prefix_lookup_flags(
    value: &str,
    ctx: i32,
    base_id: Id,
    add: i32,
    clear: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i32>> {
    let (expr, masks) = flags::expr(add, clear, 4);
    let sql = format!(
        r#"
        update prefix_lookup
        set flags = {expr}
        where
            time_removed is null
            and ctx = $1
            and value = $2
            and base_id = $3
        returning flags
        "#,
    );

    let mut query = sqlx::query(&sql).bind(ctx).bind(value).bind(base_id);
    for mask in masks {
        query = query.bind(mask);
    }
    let row = query.fetch_optional(conn).await?;
    Ok(row.map(|r| r.get(0)))
}

pub async fn insert_phonetic_lookup(
    value: &str,
    code: &str,
    flag_bits: i32,
    ctx: i32,
    base_id: Id,
    conn: &mut PgConnection,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        insert into phonetic_lookup (value, code, flags, ctx, base_id)
        values ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(value)
    .bind(code)
    .bind(flag_bits)
    .bind(ctx)
    .bind(base_id)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn select_phonetic_lookup(
    code: &str,
    value: &str,
    ctx: i32,
    base_id: Id,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i32>> {
    sqlx::query_scalar::<_, i32>(
        r#"
        select flags
        from phonetic_lookup
        where
            time_removed is null
            and ctx = $1
            and code = $2
            and value = $3
            and base_id = $4
        "#,
    )
    .bind(ctx)
    .bind(code)
    .bind(value)
    .bind(base_id)
    .fetch_optional(conn)
    .await
}

/// Page phonetic matches in `base_id` order, the merge key used by the
/// cross-shard search.
pub async fn search_phonetic(
    code: &str,
    ctx: i32,
    limit: i64,
    start_base: Option<Id>,
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<SearchRow>> {
    let rows = sqlx::query(
        r#"
        select base_id, flags, value
        from phonetic_lookup
        where
            time_removed is null
            and ctx = $1
            and code = $2
            and base_id > $3
        order by base_id asc
        limit $4
        "#,
    )
    .bind(ctx)
    .bind(code)
    .bind(start_base.unwrap_or(Id::from_i64(i64::MIN)))
    .bind(limit)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| SearchRow {
            base_id: r.get(0),
            ctx,
            flags: r.get(1),
            value: r.get(2),
        })
        .collect())
}

pub async fn remove_phonetic_lookup(
    code: &str,
    value: &str,
    ctx: i32,
    base_id: Id,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update phonetic_lookup
        set time_removed = now()
        where
            time_removed is null
            and ctx = $1
            and code = $2
            and value = $3
            and base_id = $4
        "#,
    )
    .bind(ctx)
    .bind(code)
    .bind(value)
    .bind(base_id)
    .execute(conn)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// Cascade helper over `(code, value, ctx, base_id)` rows.
pub async fn remove_phonetic_lookups_multi(
    keys: &[(String, String, i32, Id)],
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<(String, String, i32, Id)>> {
    let codes: Vec<&str> = keys.iter().map(|(c, _, _, _)| c.as_str()).collect();
    let values: Vec<&str> = keys.iter().map(|(_, v, _, _)| v.as_str()).collect();
    let ctxs: Vec<i32> = keys.iter().map(|(_, _, c, _)| *c).collect();
    let bases: Vec<Id> = keys.iter().map(|(_, _, _, b)| *b).collect();

    let rows = sqlx::query(
        r#"
        update phonetic_lookup
        set time_removed = now()
        where
            time_removed is null
            and (code, value, ctx, base_id) in (
                select * from unnest($1::text[], $2::text[], $3::int[], $4::bigint[])
            )
        returning code, value, ctx, base_id
        "#,
    )
    .bind(codes)
    .bind(values)
    .bind(ctxs)
    .bind(bases)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| (r.get(0), r.get(1), r.get(2), r.get(3)))
        .collect())
}

pub async fn set_phonetic_lookup_flags(
    code: &str,
    value: &str,
    ctx: i32,
    base_id: Id,
    add: i32,
    clear: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i32>> {
    let (expr, masks) = flags::expr(add, clear, 5);
    let sql = format!(
        r#"
        update phonetic_lookup
        set flags = {expr}
        where
            time_removed is null
            and ctx = $1
            and code = $2
            and value = $3
            and base_id = $4
        returning flags
        "#,
    );

    let mut query = sqlx::query(&sql)
        .bind(ctx)
        .bind(code)
        .bind(value)
        .bind(base_id);
    for mask in masks {
        query = query.bind(mask);
    }
    let row = query.fetch_optional(conn).await?;
    Ok(row.map(|r| r.get(0)))
}

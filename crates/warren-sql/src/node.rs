use sqlx::{PgConnection, Row};

use super::{flags, Id, StoredValue, Table};

pub struct NodeRow {
    pub id: Id,
    pub ctx: i32,
    pub value: StoredValue,
    pub flags: i32,
}

/// Insert a node row on the parent's shard. Returns the new id, or None
/// when the parent is absent or tombstoned.
pub async fn insert(
    ctx: i32,
    value: &StoredValue,
    flag_bits: i32,
    base_id: Id,
    base: Table,
    base_ctx: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<Id>> {
    let sql = format!(
        r#"
        insert into node (ctx, num, value, flags)
        select $1, $2, $3, $4
        where exists (
            select 1
            from {base}
            where
                time_removed is null
                and id = $5
                and ctx = $6
        )
        returning id
        "#,
    );

    sqlx::query_scalar::<_, Id>(&sql)
        .bind(ctx)
        .bind(value.num)
        .bind(value.bytes.as_deref())
        .bind(flag_bits)
        .bind(base_id)
        .bind(base_ctx)
        .fetch_optional(conn)
        .await
}

pub async fn select(id: Id, ctx: i32, conn: &mut PgConnection) -> sqlx::Result<Option<NodeRow>> {
    let row = sqlx::query(
        r#"
        select flags, num, value
        from node
        where
            time_removed is null
            and id = $1
            and ctx = $2
        "#,
    )
    .bind(id)
    .bind(ctx)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|r| NodeRow {
        id,
        ctx,
        flags: r.get(0),
        value: StoredValue {
            num: r.get(1),
            bytes: r.get(2),
        },
    }))
}

/// Batch fetch by exact `(id, ctx)` pairs.
pub async fn select_many(
    pairs: &[(Id, i32)],
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<NodeRow>> {
    let ids: Vec<Id> = pairs.iter().map(|(id, _)| *id).collect();
    let ctxs: Vec<i32> = pairs.iter().map(|(_, c)| *c).collect();

    let rows = sqlx::query(
        r#"
        select id, ctx, flags, num, value
        from node
        where
            time_removed is null
            and (id, ctx) in (select * from unnest($1::bigint[], $2::int[]))
        "#,
    )
    .bind(ids)
    .bind(ctxs)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| NodeRow {
            id: r.get(0),
            ctx: r.get(1),
            flags: r.get(2),
            value: StoredValue {
                num: r.get(3),
                bytes: r.get(4),
            },
        })
        .collect())
}

/// Overwrite the node's value, optionally compare-and-set against the
/// caller's last-seen value.
pub async fn update(
    id: Id,
    ctx: i32,
    value: &StoredValue,
    old_value: Option<&StoredValue>,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let guard = match old_value {
        None => "",
        Some(StoredValue { num: Some(_), .. }) => "and num = $5",
        Some(StoredValue {
            num: None,
            bytes: Some(_),
        }) => "and value = $5",
        Some(StoredValue {
            num: None,
            bytes: None,
        }) => "and num is null and value is null",
    };
    let sql = format!(
        r#"
        update node
        set num = $3, value = $4
        where
            time_removed is null
            and id = $1
            and ctx = $2
            {guard}
        "#,
    );

    let mut query = sqlx::query(&sql)
        .bind(id)
        .bind(ctx)
        .bind(value.num)
        .bind(value.bytes.as_deref());
    match old_value {
        Some(StoredValue { num: Some(num), .. }) => query = query.bind(*num),
        Some(StoredValue {
            num: None,
            bytes: Some(bytes),
        }) => query = query.bind(bytes.as_slice()),
        _ => (),
    }

    let done = query.execute(conn).await?;
    Ok(done.rows_affected() > 0)
}

pub async fn increment(
    id: Id,
    ctx: i32,
    by: i64,
    limit: Option<i64>,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i64>> {
    let Some(limit) = limit else {
        return sqlx::query_scalar::<_, i64>(
            r#"
            update node
            set num = num + $3
            where
                time_removed is null
                and id = $1
                and ctx = $2
            returning num
            "#,
        )
        .bind(id)
        .bind(ctx)
        .bind(by)
        .fetch_optional(conn)
        .await;
    };

    let op = if by < 0 { ">" } else { "<" };
    let sql = format!(
        r#"
        update node
        set num = case
            when (num + $3 {op} $4)
            then num + $3
            else $4
            end
        where
            time_removed is null
            and id = $1
            and ctx = $2
        returning num
        "#,
    );

    sqlx::query_scalar::<_, i64>(&sql)
        .bind(id)
        .bind(ctx)
        .bind(by)
        .bind(limit)
        .fetch_optional(conn)
        .await
}

pub async fn set_flags(
    id: Id,
    ctx: i32,
    add: i32,
    clear: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i32>> {
    let (expr, masks) = flags::expr(add, clear, 3);
    let sql = format!(
        r#"
        update node
        set flags = {expr}
        where
            time_removed is null
            and id = $1
            and ctx = $2
        returning flags
        "#,
    );

    let mut query = sqlx::query(&sql).bind(id).bind(ctx);
    for mask in masks {
        query = query.bind(mask);
    }
    let row = query.fetch_optional(conn).await?;
    Ok(row.map(|r| r.get(0)))
}

pub async fn remove(id: Id, ctx: i32, conn: &mut PgConnection) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update node
        set time_removed = now()
        where
            time_removed is null
            and id = $1
            and ctx = $2
        "#,
    )
    .bind(id)
    .bind(ctx)
    .execute(conn)
    .await?;

    Ok(done.rows_affected() > 0)
}

/// Cascade helper: tombstone a batch of nodes, returning the ids actually
/// removed so the walker only descends through live rows.
#[tracing::instrument(err, level = "debug", skip(conn))]
pub async fn remove_many(ids: &[Id], conn: &mut PgConnection) -> sqlx::Result<Vec<Id>> {
    let rows = sqlx::query(
        r#"
        update node
        set time_removed = now()
        where
            time_removed is null
            and id = any($1)
        returning id
        "#,
    )
    .bind(ids)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|r| r.get(0)).collect())
}

use sqlx::{PgConnection, Row};

use super::{flags, Id, StoredValue, Table};

pub struct PropertyRow {
    pub base_id: Id,
    pub ctx: i32,
    pub value: StoredValue,
    pub flags: i32,
}

/// Insert-or-update the single property row for `(base_id, ctx)`.
///
/// Returns `(inserted, updated)`, at most one of which is true. Both are
/// false iff the parent row is absent or tombstoned; the existence check is
/// part of the statement so a concurrently removed parent cannot have a
/// property re-attached to it.
pub async fn upsert(
    base_id: Id,
    ctx: i32,
    value: &StoredValue,
    flag_bits: i32,
    base: Table,
    base_ctx: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<(bool, bool)> {
    let sql = format!(
        r#"
        with existencequery as (
            select 1
            from {base}
            where
                time_removed is null
                and id = $1
                and ctx = $2
        ),
        updatequery as (
            update property
            set num = $4, value = $5, flags = $6
            where
                time_removed is null
                and base_id = $1
                and ctx = $3
                and exists (select 1 from existencequery)
            returning 1
        ),
        insertquery as (
            insert into property (base_id, ctx, num, value, flags)
            select $1, $3, $4, $5, $6
            where
                not exists (select 1 from updatequery)
                and exists (select 1 from existencequery)
            returning 1
        )
        select
            exists (select 1 from insertquery),
            exists (select 1 from updatequery)
        "#,
    );

    let row = sqlx::query(&sql)
        .bind(base_id)
        .bind(base_ctx)
        .bind(ctx)
        .bind(value.num)
        .bind(value.bytes.as_deref())
        .bind(flag_bits)
        .fetch_one(conn)
        .await?;

    Ok((row.get(0), row.get(1)))
}

/// Plain update, used when a concurrent upsert lost the insert race.
pub async fn update(
    base_id: Id,
    ctx: i32,
    value: &StoredValue,
    flag_bits: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update property
        set num = $3, value = $4, flags = $5
        where
            time_removed is null
            and base_id = $1
            and ctx = $2
        "#,
    )
    .bind(base_id)
    .bind(ctx)
    .bind(value.num)
    .bind(value.bytes.as_deref())
    .bind(flag_bits)
    .execute(conn)
    .await?;

    Ok(done.rows_affected() > 0)
}

pub async fn select(
    base_id: Id,
    ctx: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<PropertyRow>> {
    let row = sqlx::query(
        r#"
        select num, value, flags
        from property
        where
            time_removed is null
            and base_id = $1
            and ctx = $2
        "#,
    )
    .bind(base_id)
    .bind(ctx)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(|r| PropertyRow {
        base_id,
        ctx,
        value: StoredValue {
            num: r.get(0),
            bytes: r.get(1),
        },
        flags: r.get(2),
    }))
}

/// Fetch the properties of one base across several contexts in one round trip.
pub async fn select_many(
    base_id: Id,
    ctxs: &[i32],
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<PropertyRow>> {
    let rows = sqlx::query(
        r#"
        select ctx, num, value, flags
        from property
        where
            time_removed is null
            and base_id = $1
            and ctx = any($2)
        "#,
    )
    .bind(base_id)
    .bind(ctxs)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| PropertyRow {
            base_id,
            ctx: r.get(0),
            value: StoredValue {
                num: r.get(1),
                bytes: r.get(2),
            },
            flags: r.get(3),
        })
        .collect())
}

/// Add `by` to the integer value, optionally pinning at `limit`. The sign
/// of `by` selects the comparison so incrementing toward a ceiling and
/// decrementing toward a floor share one statement.
pub async fn increment(
    base_id: Id,
    ctx: i32,
    by: i64,
    limit: Option<i64>,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i64>> {
    let Some(limit) = limit else {
        return sqlx::query_scalar::<_, i64>(
            r#"
            update property
            set num = num + $3
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
            returning num
            "#,
        )
        .bind(base_id)
        .bind(ctx)
        .bind(by)
        .fetch_optional(conn)
        .await;
    };

    let op = if by < 0 { ">" } else { "<" };
    let sql = format!(
        r#"
        update property
        set num = case
            when (num + $3 {op} $4)
            then num + $3
            else $4
            end
        where
            time_removed is null
            and base_id = $1
            and ctx = $2
        returning num
        "#,
    );

    sqlx::query_scalar::<_, i64>(&sql)
        .bind(base_id)
        .bind(ctx)
        .bind(by)
        .bind(limit)
        .fetch_optional(conn)
        .await
}

/// Tombstone the property, optionally only when its current value matches.
pub async fn remove(
    base_id: Id,
    ctx: i32,
    value: Option<&StoredValue>,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    let done = match value {
        None => {
            sqlx::query(
                r#"
                update property
                set time_removed = now()
                where
                    time_removed is null
                    and base_id = $1
                    and ctx = $2
                "#,
            )
            .bind(base_id)
            .bind(ctx)
            .execute(conn)
            .await?
        }
        Some(StoredValue {
            num: Some(num),
            bytes: _,
        }) => {
            sqlx::query(
                r#"
                update property
                set time_removed = now()
                where
                    time_removed is null
                    and base_id = $1
                    and ctx = $2
                    and num = $3
                "#,
            )
            .bind(base_id)
            .bind(ctx)
            .bind(num)
            .execute(conn)
            .await?
        }
        Some(StoredValue {
            num: None,
            bytes: Some(bytes),
        }) => {
            sqlx::query(
                r#"
                update property
                set time_removed = now()
                where
                    time_removed is null
                    and base_id = $1
                    and ctx = $2
                    and value = $3
                "#,
            )
            .bind(base_id)
            .bind(ctx)
            .bind(bytes.as_slice())
            .execute(conn)
            .await?
        }
        Some(StoredValue {
            num: None,
            bytes: None,
        }) => {
            sqlx::query(
                r#"
                update property
                set time_removed = now()
                where
                    time_removed is null
                    and base_id = $1
                    and ctx = $2
                    and num is null
                    and value is null
                "#,
            )
            .bind(base_id)
            .bind(ctx)
            .execute(conn)
            .await?
        }
    };

    Ok(done.rows_affected() > 0)
}

/// Cascade helper: tombstone every property of every listed base in one
/// statement.
pub async fn remove_multiple_bases(base_ids: &[Id], conn: &mut PgConnection) -> sqlx::Result<u64> {
    let done = sqlx::query(
        r#"
        update property
        set time_removed = now()
        where
            time_removed is null
            and base_id = any($1)
        "#,
    )
    .bind(base_ids)
    .execute(conn)
    .await?;

    Ok(done.rows_affected())
}

pub async fn set_flags(
    base_id: Id,
    ctx: i32,
    add: i32,
    clear: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Option<i32>> {
    let (expr, masks) = flags::expr(add, clear, 3);
    let sql = format!(
        r#"
        update property
        set flags = {expr}
        where
            time_removed is null
            and base_id = $1
            and ctx = $2
        returning flags
        "#,
    );

    let mut query = sqlx::query(&sql).bind(base_id).bind(ctx);
    for mask in masks {
        query = query.bind(mask);
    }
    let row = query.fetch_optional(conn).await?;
    Ok(row.map(|r| r.get(0)))
}

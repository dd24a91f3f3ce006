use sqlx::{PgConnection, Row};

use super::{flags, Id};

/// Insert a new entity row; its id comes from the shard's sequence.
pub async fn insert(ctx: i32, flag_bits: i32, conn: &mut PgConnection) -> sqlx::Result<Id> {
    sqlx::query_scalar::<_, Id>(
        r#"
        insert into entity (ctx, flags)
        values ($1, $2)
        returning id
        "#,
    )
    .bind(ctx)
    .bind(flag_bits)
    .fetch_one(conn)
    .await
}

pub async fn select(id: Id, ctx: i32, conn: &mut PgConnection) -> sqlx::Result<Option<i32>> {
    sqlx::query_scalar::<_, i32>(
        r#"
        select flags
        from entity
        where
            time_removed is null
            and id = $1
            and ctx = $2
        "#,
    )
    .bind(id)
    .bind(ctx)
    .fetch_optional(conn)
    .await
}

pub async fn remove(id: Id, ctx: i32, conn: &mut PgConnection) -> sqlx::Result<bool> {
    let done = sqlx::query(
        r#"
        update entity
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
        update entity
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

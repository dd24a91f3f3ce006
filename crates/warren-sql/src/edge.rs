use sqlx::{PgConnection, Row};

use super::{Id, Table};

/// Insert the parentage row tying `child_id` under `(base_id, ctx)`.
///
/// `parent` optionally names the parent table and context for an existence
/// predicate; node creation inserts the edge in the same transaction as a
/// parent-checked node insert and skips the second check.
pub async fn insert(
    base_id: Id,
    ctx: i32,
    child_id: Id,
    index: Option<i32>,
    parent: Option<(Table, i32)>,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    // The parent-context bind is always last so the predicate-free form
    // binds one fewer parameter.
    let existence = |parent_param: usize| match parent {
        None => "true".to_owned(),
        Some((table, _)) => format!(
            r#"exists (
                select 1 from {table}
                where
                    time_removed is null
                    and id = $1
                    and ctx = ${parent_param}
            )"#,
        ),
    };

    let done = match index {
        None => {
            let existence = existence(4);
            let sql = format!(
                r#"
                insert into edge (base_id, ctx, child_id, pos)
                select $1, $2, $3, (
                    select count(*)
                    from edge
                    where
                        time_removed is null
                        and base_id = $1
                        and ctx = $2
                )
                where {existence}
                "#,
            );
            let mut query = sqlx::query(&sql).bind(base_id).bind(ctx).bind(child_id);
            if let Some((_, parent_ctx)) = parent {
                query = query.bind(parent_ctx);
            }
            query.execute(conn).await?
        }
        Some(index) => {
            let existence = existence(5);
            let sql = format!(
                r#"
                with bump as (
                    update edge
                    set pos = pos + 1
                    where
                        time_removed is null
                        and base_id = $1
                        and ctx = $2
                        and pos >= $4
                        and {existence}
                )
                insert into edge (base_id, ctx, child_id, pos)
                select $1, $2, $3, $4
                where {existence}
                "#,
            );
            let mut query = sqlx::query(&sql)
                .bind(base_id)
                .bind(ctx)
                .bind(child_id)
                .bind(index);
            if let Some((_, parent_ctx)) = parent {
                query = query.bind(parent_ctx);
            }
            query.execute(conn).await?
        }
    };

    Ok(done.rows_affected() > 0)
}

pub async fn select_children(
    base_id: Id,
    ctx: i32,
    limit: i64,
    start_pos: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<(Id, i32)>> {
    let rows = sqlx::query(
        r#"
        select child_id, pos
        from edge
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

    Ok(rows.into_iter().map(|r| (r.get(0), r.get(1))).collect())
}

pub async fn reorder(
    base_id: Id,
    ctx: i32,
    child_id: Id,
    pos: i32,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    sqlx::query_scalar::<_, bool>(
        r#"
        with target as (
            select least($4, count(*)::int - 1) as pos
            from edge
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
        ), oldpos as (
            select pos
            from edge
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
                and child_id = $3
        ), bump as (
            update edge
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
                and child_id <> $3
                and pos between symmetric
                    (select pos from oldpos) and (select pos from target)
        ), move as (
            update edge
            set pos = (select pos from target)
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
                and child_id = $3
            returning 1
        )
        select exists (select 1 from move)
        "#,
    )
    .bind(base_id)
    .bind(ctx)
    .bind(child_id)
    .bind(pos)
    .fetch_one(conn)
    .await
}

pub async fn remove(
    base_id: Id,
    ctx: i32,
    child_id: Id,
    conn: &mut PgConnection,
) -> sqlx::Result<bool> {
    sqlx::query_scalar::<_, bool>(
        r#"
        with removal as (
            update edge
            set time_removed = now()
            where
                time_removed is null
                and base_id = $1
                and ctx = $2
                and child_id = $3
            returning pos
        ), bump as (
            update edge
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
    .bind(child_id)
    .fetch_one(conn)
    .await
}

/// Cascade helper: tombstone every edge under the listed bases, returning
/// the orphaned child ids for the walker to descend into.
pub async fn remove_multiple_bases(
    base_ids: &[Id],
    conn: &mut PgConnection,
) -> sqlx::Result<Vec<Id>> {
    let rows = sqlx::query(
        r#"
        update edge
        set time_removed = now()
        where
            time_removed is null
            and base_id = any($1)
        returning child_id
        "#,
    )
    .bind(base_ids)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|r| r.get(0)).collect())
}

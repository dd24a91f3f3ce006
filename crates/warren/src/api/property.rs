use std::time::Duration;

use models::{Id, StorageClass, Value};
use warren_sql::Table;

use super::Property;
use crate::catalog::FlagSet;
use crate::error::{is_unique_violation, Error, Result};
use crate::pool::Pool;
use crate::timer::OpTimer;
use crate::Ctx;

fn validate(pool: &Pool, ctx: Ctx) -> Result<(Table, Ctx)> {
    pool.catalog().expect_kind(ctx, Table::Property)?;
    pool.catalog().base(ctx)
}

/// Set the single property value for `(base_id, ctx)`.
///
/// Returns `(inserted, updated)`; both false means the parent object is
/// absent or tombstoned. A concurrent writer racing the insert falls back
/// to a plain update.
#[tracing::instrument(skip(pool, value))]
pub async fn set(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &Value,
    flags: &[u8],
    timeout: Option<Duration>,
) -> Result<(bool, bool)> {
    pool.assert_writable()?;
    let (base, base_ctx) = validate(pool, ctx)?;
    let bits = pool.catalog().flags_to_bits(ctx, flags)?;
    let stored = pool.catalog().wrap(ctx, value)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;

    match warren_sql::property::upsert(base_id, ctx, &stored, bits, base, base_ctx, &mut conn).await
    {
        Ok(outcome) => Ok(outcome),
        Err(err) if is_unique_violation(&err) => {
            let updated =
                warren_sql::property::update(base_id, ctx, &stored, bits, &mut conn).await?;
            Ok((false, updated))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn get(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    timeout: Option<Duration>,
) -> Result<Option<Property>> {
    validate(pool, ctx)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    let row = warren_sql::property::select(base_id, ctx, &mut conn).await?;

    row.map(|row| {
        Ok(Property {
            base_id,
            ctx,
            value: pool.catalog().unwrap(ctx, row.value)?,
            flags: pool.catalog().bits_to_flags(ctx, row.flags),
        })
    })
    .transpose()
}

/// Fetch several of one object's properties in a single round trip,
/// returned in the order of `ctxs` with None for absent rows.
pub async fn get_many(
    pool: &Pool,
    base_id: Id,
    ctxs: &[Ctx],
    timeout: Option<Duration>,
) -> Result<Vec<Option<Property>>> {
    for &ctx in ctxs {
        validate(pool, ctx)?;
    }

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    let rows = warren_sql::property::select_many(base_id, ctxs, &mut conn).await?;

    let mut by_ctx = std::collections::HashMap::new();
    for row in rows {
        let property = Property {
            base_id,
            ctx: row.ctx,
            value: pool.catalog().unwrap(row.ctx, row.value)?,
            flags: pool.catalog().bits_to_flags(row.ctx, row.flags),
        };
        by_ctx.insert(row.ctx, property);
    }
    Ok(ctxs.iter().map(|ctx| by_ctx.remove(ctx)).collect())
}

pub async fn has(pool: &Pool, base_id: Id, ctx: Ctx, timeout: Option<Duration>) -> Result<bool> {
    validate(pool, ctx)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    let row = warren_sql::property::select(base_id, ctx, &mut conn).await?;
    Ok(row.is_some())
}

/// Add `by` to an integer property, optionally saturating at `limit`
/// (a ceiling for positive deltas, a floor for negative ones). Returns the
/// resulting value, or None when no live row matched.
pub async fn increment(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    by: i64,
    limit: Option<i64>,
    timeout: Option<Duration>,
) -> Result<Option<i64>> {
    pool.assert_writable()?;
    validate(pool, ctx)?;
    if pool.catalog().storage(ctx) != StorageClass::Int {
        return Err(Error::StorageClass(format!(
            "increment requires int storage on context {ctx}"
        )));
    }

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    warren_sql::property::increment(base_id, ctx, by, limit, &mut conn)
        .await
        .map_err(Into::into)
}

pub async fn set_flags(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    add: &[u8],
    clear: &[u8],
    timeout: Option<Duration>,
) -> Result<Option<FlagSet>> {
    pool.assert_writable()?;
    validate(pool, ctx)?;
    let add = pool.catalog().flags_to_bits(ctx, add)?;
    let clear = pool.catalog().flags_to_bits(ctx, clear)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    let flags = warren_sql::property::set_flags(base_id, ctx, add, clear, &mut conn).await?;

    Ok(flags.map(|bits| pool.catalog().bits_to_flags(ctx, bits)))
}

/// Tombstone the property; with `value` given, only when the stored value
/// still matches it.
pub async fn remove(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: Option<&Value>,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    validate(pool, ctx)?;
    let stored = value.map(|v| pool.catalog().wrap(ctx, v)).transpose()?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    warren_sql::property::remove(base_id, ctx, stored.as_ref(), &mut conn)
        .await
        .map_err(Into::into)
}

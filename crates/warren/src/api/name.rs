use std::time::Duration;

use models::{Id, ShardId};
use warren_sql::Table;

use super::{Name, NameMatch, SearchCursor};
use crate::catalog::{FlagSet, SearchStrategy};
use crate::error::{Error, Result};
use crate::phonetic;
use crate::pool::Pool;
use crate::timer::OpTimer;
use crate::txn::{Else, TwoPhaseCommit};
use crate::Ctx;

fn validate(pool: &Pool, ctx: Ctx) -> Result<(Table, Ctx, SearchStrategy)> {
    pool.catalog().expect_kind(ctx, Table::Name)?;
    let (base, base_ctx) = pool.catalog().base(ctx)?;
    let search = pool.catalog().search(ctx).ok_or(Error::BadContext(ctx))?;
    Ok((base, base_ctx, search))
}

/// The lookup rows a name value is discoverable through, each with the
/// shard the current write plan assigns it.
fn lookup_writes(pool: &Pool, ctx: Ctx, value: &str, search: SearchStrategy) -> Vec<(ShardId, Option<String>)> {
    match search {
        SearchStrategy::Prefix => {
            vec![(pool.router().prefix_write_shard(value), None)]
        }
        SearchStrategy::Phonetic => {
            let (primary, alternate) = phonetic::codes(value, pool.catalog().phonetic_loose(ctx));
            std::iter::once(primary)
                .chain(alternate)
                .map(|code| (pool.router().phonetic_write_shard(&code), Some(code)))
                .collect()
        }
    }
}

/// Store a name on an object.
///
/// The primary row is prepared first on the object's shard; each lookup
/// row (one for prefix contexts, one per metaphone code for phonetic
/// contexts) is then prepared on its write-plan shard, and the whole group
/// commits together.
#[tracing::instrument(skip(pool, value))]
pub async fn create(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &str,
    flags: &[u8],
    index: Option<i32>,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    let (base, base_ctx, search) = validate(pool, ctx)?;
    let bits = pool.catalog().flags_to_bits(ctx, flags)?;

    let timer = OpTimer::new(timeout);
    let primary_shard = pool.router().shard_of(base_id);

    let mut tpc = TwoPhaseCommit::new(
        pool,
        primary_shard,
        "create_name",
        format_args!("{base_id}.{ctx}"),
    );
    let mut guard = tpc.begin(&timer).await?;

    let inserted = match warren_sql::name::insert(
        base_id, ctx, value, index, bits, base, base_ctx, &mut guard,
    )
    .await
    {
        Ok(inserted) => inserted,
        Err(err) => {
            tpc.abort(guard).await;
            return Err(err.into());
        }
    };
    if !inserted {
        tpc.fail();
        tpc.finish(guard).await?;
        return Ok(false);
    }
    tpc.finish(guard).await?;

    let mut tpcs = vec![tpc];
    let work: Result<()> = async {
        for (shard, code) in lookup_writes(pool, ctx, value, search) {
            let mut tpc = TwoPhaseCommit::new(
                pool,
                shard,
                "create_name_lookup",
                format_args!("{base_id}.{ctx}.{}", code.as_deref().unwrap_or("prefix")),
            );
            let mut guard = tpc.begin(&timer).await?;

            let written = match &code {
                None => {
                    warren_sql::name::insert_prefix_lookup(value, bits, ctx, base_id, &mut guard)
                        .await
                }
                Some(code) => {
                    warren_sql::name::insert_phonetic_lookup(
                        value, code, bits, ctx, base_id, &mut guard,
                    )
                    .await
                }
            };
            if let Err(err) = written {
                tpc.abort(guard).await;
                return Err(err.into());
            }
            tpc.finish(guard).await?;
            tpcs.push(tpc);
        }
        Ok(())
    }
    .await;

    match work {
        Err(err) => {
            for tpc in &tpcs {
                if let Err(rollback_err) = tpc.rollback(&timer).await {
                    tracing::warn!(gid = %tpc.gid(), ?rollback_err, "name rollback failed");
                }
            }
            Err(err)
        }
        Ok(()) => {
            for tpc in &tpcs {
                tpc.commit(&timer).await?;
            }
            Ok(true)
        }
    }
}

/// Search the names of a context.
///
/// Prefix contexts match values starting with the query and merge shard
/// results by value; phonetic contexts match the query's metaphone codes
/// and merge by `(code, base_id)`. `start` continues from a previous
/// page's cursor.
pub async fn search(
    pool: &Pool,
    value: &str,
    ctx: Ctx,
    limit: usize,
    start: Option<SearchCursor>,
    timeout: Option<Duration>,
) -> Result<(Vec<NameMatch>, Option<SearchCursor>)> {
    pool.catalog().expect_kind(ctx, Table::Name)?;
    let search = pool.catalog().search(ctx).ok_or(Error::BadContext(ctx))?;
    let timer = OpTimer::new(timeout);

    match search {
        SearchStrategy::Prefix => {
            let start_value = match start {
                None => String::new(),
                Some(SearchCursor::Prefix { value }) => value,
                Some(SearchCursor::Phonetic { .. }) => return Err(Error::BadContext(ctx)),
            };

            let mut rows = Vec::new();
            for shard in pool.router().prefix_read_shards(value) {
                let mut conn = pool.acquire(shard, &timer).await?;
                rows.extend(
                    warren_sql::name::search_prefix(
                        value,
                        ctx,
                        limit as i64,
                        &start_value,
                        &mut conn,
                    )
                    .await?,
                );
            }
            rows.sort_by(|a, b| (&a.value, a.base_id).cmp(&(&b.value, b.base_id)));
            rows.dedup_by(|a, b| a.value == b.value && a.base_id == b.base_id);
            rows.truncate(limit);

            let cursor = rows.last().map(|row| SearchCursor::Prefix {
                value: row.value.clone(),
            });
            let matches = rows
                .into_iter()
                .map(|row| NameMatch {
                    base_id: row.base_id,
                    ctx,
                    value: row.value,
                    flags: pool.catalog().bits_to_flags(ctx, row.flags),
                })
                .collect();
            Ok((matches, cursor))
        }
        SearchStrategy::Phonetic => {
            let (primary, alternate) =
                phonetic::codes(value, pool.catalog().phonetic_loose(ctx));
            let codes: Vec<String> = std::iter::once(primary).chain(alternate).collect();

            let resume = match start {
                None => None,
                Some(SearchCursor::Phonetic { code, base_id }) => codes
                    .iter()
                    .position(|c| *c == code)
                    .map(|index| (index, base_id)),
                Some(SearchCursor::Prefix { .. }) => return Err(Error::BadContext(ctx)),
            };

            let mut matches = Vec::new();
            let mut cursor = None;
            'codes: for (index, code) in codes.iter().enumerate() {
                let start_base = match resume {
                    Some((resume_index, _)) if index < resume_index => continue,
                    Some((resume_index, base_id)) if index == resume_index => Some(base_id),
                    _ => None,
                };

                let mut rows = Vec::new();
                for shard in pool.router().phonetic_read_shards(code) {
                    let mut conn = pool.acquire(shard, &timer).await?;
                    rows.extend(
                        warren_sql::name::search_phonetic(
                            code,
                            ctx,
                            limit as i64,
                            start_base,
                            &mut conn,
                        )
                        .await?,
                    );
                }
                // Merge in backend id order so paging is stable across shards.
                rows.sort_by_key(|row| row.base_id.as_i64());
                rows.dedup_by_key(|row| row.base_id);

                for row in rows {
                    if matches.len() == limit {
                        break 'codes;
                    }
                    cursor = Some(SearchCursor::Phonetic {
                        code: code.clone(),
                        base_id: row.base_id,
                    });
                    matches.push(NameMatch {
                        base_id: row.base_id,
                        ctx,
                        value: row.value,
                        flags: pool.catalog().bits_to_flags(ctx, row.flags),
                    });
                }
            }

            let cursor = if matches.is_empty() { None } else { cursor };
            Ok((matches, cursor))
        }
    }
}

/// List an object's names in position order.
pub async fn list(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    limit: i64,
    start: i32,
    timeout: Option<Duration>,
) -> Result<(Vec<Name>, i32)> {
    pool.catalog().expect_kind(ctx, Table::Name)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    let rows = warren_sql::name::select_many(base_id, ctx, limit, start, &mut conn).await?;

    let next = rows.last().map(|row| row.pos + 1).unwrap_or(0);
    let names = rows
        .into_iter()
        .map(|row| Name {
            base_id,
            ctx,
            value: row.value,
            flags: pool.catalog().bits_to_flags(ctx, row.flags),
            pos: row.pos,
        })
        .collect();
    Ok((names, next))
}

/// The located lookup rows backing one name value, found by walking the
/// read plans; used by the flag and remove verbs to pin their shards.
async fn locate_lookups(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &str,
    search: SearchStrategy,
    timer: &OpTimer,
) -> Result<Option<Vec<(ShardId, Option<String>)>>> {
    match search {
        SearchStrategy::Prefix => {
            for shard in pool.router().prefix_read_shards(value) {
                let mut conn = pool.acquire(shard, timer).await?;
                let found =
                    warren_sql::name::select_prefix_lookup(value, ctx, base_id, &mut conn).await?;
                drop(conn);
                if found.is_some() {
                    return Ok(Some(vec![(shard, None)]));
                }
            }
            Ok(None)
        }
        SearchStrategy::Phonetic => {
            let (primary, alternate) = phonetic::codes(value, pool.catalog().phonetic_loose(ctx));
            let mut located = Vec::new();

            for code in std::iter::once(primary).chain(alternate) {
                let mut found_shard = None;
                for shard in pool.router().phonetic_read_shards(&code) {
                    let mut conn = pool.acquire(shard, timer).await?;
                    let found = warren_sql::name::select_phonetic_lookup(
                        &code, value, ctx, base_id, &mut conn,
                    )
                    .await?;
                    drop(conn);
                    if found.is_some() {
                        found_shard = Some(shard);
                        break;
                    }
                }
                match found_shard {
                    Some(shard) => located.push((shard, Some(code))),
                    None => return Ok(None),
                }
            }
            Ok(Some(located))
        }
    }
}

/// Apply a flag change to a name and all of its lookup rows as one
/// consistent write, anchored on the primary shard; commits only if every
/// row ended up with the same bitmap.
pub async fn set_flags(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &str,
    add: &[u8],
    clear: &[u8],
    timeout: Option<Duration>,
) -> Result<Option<FlagSet>> {
    pool.assert_writable()?;
    let (_, _, search) = validate(pool, ctx)?;
    let add = pool.catalog().flags_to_bits(ctx, add)?;
    let clear = pool.catalog().flags_to_bits(ctx, clear)?;

    let timer = OpTimer::new(timeout);
    let Some(located) = locate_lookups(pool, base_id, ctx, value, search, &timer).await? else {
        return Ok(None);
    };

    let mut tpc = TwoPhaseCommit::new(
        pool,
        pool.router().shard_of(base_id),
        "set_name_flags",
        format_args!("{base_id}.{ctx}.{}", add | clear),
    );
    let mut guard = tpc.begin(&timer).await?;

    let flags =
        match warren_sql::name::set_flags(base_id, ctx, value, add, clear, &mut guard).await {
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
        for (shard, code) in &located {
            let mut conn = pool.acquire(*shard, &timer).await?;
            let flags = match code {
                None => {
                    warren_sql::name::set_prefix_lookup_flags(
                        value, ctx, base_id, add, clear, &mut conn,
                    )
                    .await?
                }
                Some(code) => {
                    warren_sql::name::set_phonetic_lookup_flags(
                        code, value, ctx, base_id, add, clear, &mut conn,
                    )
                    .await?
                }
            };
            if flags != Some(result_flags) {
                return Ok(Else::Fail(None));
            }
        }
        Ok(Else::Commit(Some(
            pool.catalog().bits_to_flags(ctx, result_flags),
        )))
    })
    .await
}

/// Relocate a name within its object's ordered list, clamped to the tail.
pub async fn shift(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &str,
    index: i32,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    pool.catalog().expect_kind(ctx, Table::Name)?;

    let timer = OpTimer::new(timeout);
    let mut conn = pool.acquire_by_id(base_id, &timer).await?;
    warren_sql::name::reorder(base_id, ctx, value, index, &mut conn)
        .await
        .map_err(Into::into)
}

/// Tombstone a name and its lookup rows together, anchored on the primary
/// shard.
#[tracing::instrument(skip(pool, value))]
pub async fn remove(
    pool: &Pool,
    base_id: Id,
    ctx: Ctx,
    value: &str,
    timeout: Option<Duration>,
) -> Result<bool> {
    pool.assert_writable()?;
    let (_, _, search) = validate(pool, ctx)?;

    let timer = OpTimer::new(timeout);
    let Some(located) = locate_lookups(pool, base_id, ctx, value, search, &timer).await? else {
        return Ok(false);
    };

    let mut tpc = TwoPhaseCommit::new(
        pool,
        pool.router().shard_of(base_id),
        "remove_name",
        format_args!("{base_id}.{ctx}"),
    );
    let mut guard = tpc.begin(&timer).await?;

    let removed = match warren_sql::name::remove(base_id, ctx, value, &mut guard).await {
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
        for (shard, code) in &located {
            let mut conn = pool.acquire(*shard, &timer).await?;
            let removed = match code {
                None => {
                    warren_sql::name::remove_prefix_lookup(value, ctx, base_id, &mut conn).await?
                }
                Some(code) => {
                    warren_sql::name::remove_phonetic_lookup(code, value, ctx, base_id, &mut conn)
                        .await?
                }
            };
            if !removed {
                return Ok(Else::Fail(false));
            }
        }
        Ok(Else::Commit(true))
    })
    .await
}

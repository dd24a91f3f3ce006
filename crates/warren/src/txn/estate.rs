use std::collections::{BTreeSet, HashMap, HashSet};

use models::{Id, ShardId};
use warren_sql::relationship::RelationshipRef;

use crate::catalog::{Catalog, SearchStrategy};
use crate::error::Result;
use crate::phonetic;
use crate::pool::{ConnGuard, Pool};
use crate::router::Router;
use crate::timer::OpTimer;
use crate::txn::TwoPhaseCommit;
use crate::Ctx;

/// One shard's slice of a removed record's estate: lookup rows to
/// tombstone here, relationship peer rows to tombstone here, and node ids
/// residing here that still need to be descended into.
///
/// Lookup entries are optimistic: a key is queued on every shard any
/// insertion plan could have put it on, and the extra entries are
/// discarded once the row is found and removed.
#[derive(Default)]
pub(crate) struct ShardEstate {
    alias_lookups: HashSet<(Vec<u8>, Ctx)>,
    prefix_lookups: HashSet<(String, Ctx, Id)>,
    phonetic_lookups: HashSet<(String, String, Ctx, Id)>,
    rels: Vec<RelationshipRef>,
    nodes: Vec<Id>,
}

impl ShardEstate {
    fn is_empty(&self) -> bool {
        self.alias_lookups.is_empty()
            && self.prefix_lookups.is_empty()
            && self.phonetic_lookups.is_empty()
            && self.rels.is_empty()
            && self.nodes.is_empty()
    }
}

pub(crate) type EstateMap = HashMap<ShardId, ShardEstate>;

fn deposit_alias_rows(estates: &mut EstateMap, router: &Router, removed: &[(String, Ctx)]) {
    for (value, ctx) in removed {
        let digest = router.digest(value);
        for shard in router.alias_read_shards(&digest) {
            estates
                .entry(shard)
                .or_default()
                .alias_lookups
                .insert((digest.to_vec(), *ctx));
        }
    }
}

fn deposit_name_rows(
    estates: &mut EstateMap,
    router: &Router,
    catalog: &Catalog,
    removed: &[(Id, String, Ctx)],
) {
    for (base_id, value, ctx) in removed {
        match catalog.search(*ctx) {
            Some(SearchStrategy::Prefix) => {
                for shard in router.prefix_read_shards(value) {
                    estates.entry(shard).or_default().prefix_lookups.insert((
                        value.clone(),
                        *ctx,
                        *base_id,
                    ));
                }
            }
            Some(SearchStrategy::Phonetic) => {
                let (primary, alternate) = phonetic::codes(value, catalog.phonetic_loose(*ctx));
                for code in std::iter::once(primary).chain(alternate) {
                    for shard in router.phonetic_read_shards(&code) {
                        estates.entry(shard).or_default().phonetic_lookups.insert((
                            code.clone(),
                            value.clone(),
                            *ctx,
                            *base_id,
                        ));
                    }
                }
            }
            None => (),
        }
    }
}

fn deposit_rel_rows(estates: &mut EstateMap, router: &Router, removed: &[RelationshipRef]) {
    for rel in removed {
        // The peer row of the opposite direction lives on the far end's shard.
        let far_end = if rel.forward { rel.rel_id } else { rel.base_id };
        estates
            .entry(router.shard_of(far_end))
            .or_default()
            .rels
            .push(rel.peer());
    }
}

fn deposit_children(estates: &mut EstateMap, router: &Router, children: &[Id]) {
    for &child in children {
        estates
            .entry(router.shard_of(child))
            .or_default()
            .nodes
            .push(child);
    }
}

/// Drain one shard's estate inside an open anchor transaction.
///
/// Pending node ids are tombstoned and their properties, aliases, names,
/// relationships and edges chased; discoveries are deposited back into the
/// map, including this shard's own buckets, which are drained before the
/// caller advances to another shard. `skip_first_batch` covers the entity
/// root, whose row was already tombstoned by the first 2PC and is not a
/// node.
async fn drain_local_estate(
    pool: &Pool,
    shard: ShardId,
    estates: &mut EstateMap,
    conn: &mut ConnGuard,
    skip_first_batch: bool,
) -> Result<()> {
    let router = pool.router();
    let mut skip_tombstone = skip_first_batch;

    let mut pending: Vec<Id> = match estates.get_mut(&shard) {
        Some(estate) => std::mem::take(&mut estate.nodes),
        None => Vec::new(),
    };

    while !pending.is_empty() {
        let removed = if skip_tombstone {
            skip_tombstone = false;
            pending
        } else {
            warren_sql::node::remove_many(&pending, &mut *conn).await?
        };

        if !removed.is_empty() {
            warren_sql::property::remove_multiple_bases(&removed, &mut *conn).await?;

            let aliases = warren_sql::alias::remove_multiple_bases(&removed, &mut *conn).await?;
            deposit_alias_rows(estates, router, &aliases);

            let names = warren_sql::name::remove_multiple_bases(&removed, &mut *conn).await?;
            deposit_name_rows(estates, router, pool.catalog(), &names);

            let rels =
                warren_sql::relationship::remove_multiple_bases(&removed, &mut *conn).await?;
            deposit_rel_rows(estates, router, &rels);

            let children = warren_sql::edge::remove_multiple_bases(&removed, &mut *conn).await?;
            deposit_children(estates, router, &children);
        }

        pending = match estates.get_mut(&shard) {
            Some(estate) => std::mem::take(&mut estate.nodes),
            None => Vec::new(),
        };
    }

    let estate = estates.remove(&shard).unwrap_or_default();

    if !estate.alias_lookups.is_empty() {
        let keys: Vec<(Vec<u8>, i32)> = estate.alias_lookups.into_iter().collect();
        let removed = warren_sql::alias::remove_lookups_multi(&keys, &mut *conn).await?;
        for (hash, ctx) in removed {
            for other in router.alias_read_shards(&hash) {
                if other == shard {
                    continue;
                }
                if let Some(estate) = estates.get_mut(&other) {
                    estate.alias_lookups.remove(&(hash.clone(), ctx));
                }
            }
        }
    }

    if !estate.prefix_lookups.is_empty() {
        let keys: Vec<(String, i32, Id)> = estate.prefix_lookups.into_iter().collect();
        let removed = warren_sql::name::remove_prefix_lookups_multi(&keys, &mut *conn).await?;
        for key in removed {
            for other in router.prefix_read_shards(&key.0) {
                if other == shard {
                    continue;
                }
                if let Some(estate) = estates.get_mut(&other) {
                    estate.prefix_lookups.remove(&key);
                }
            }
        }
    }

    if !estate.phonetic_lookups.is_empty() {
        let keys: Vec<(String, String, i32, Id)> =
            estate.phonetic_lookups.into_iter().collect();
        let removed = warren_sql::name::remove_phonetic_lookups_multi(&keys, &mut *conn).await?;
        for key in removed {
            for other in router.phonetic_read_shards(&key.0) {
                if other == shard {
                    continue;
                }
                if let Some(estate) = estates.get_mut(&other) {
                    estate.phonetic_lookups.remove(&key);
                }
            }
        }
    }

    if !estate.rels.is_empty() {
        warren_sql::relationship::remove_multi(&estate.rels, &mut *conn).await?;

        // Re-densify the lists the removals punched holes in.
        let mut forward_anchors = BTreeSet::new();
        let mut reverse_anchors = BTreeSet::new();
        for rel in &estate.rels {
            if rel.forward {
                forward_anchors.insert((rel.base_id, rel.ctx));
            } else {
                reverse_anchors.insert((rel.rel_id, rel.ctx));
            }
        }
        if !forward_anchors.is_empty() {
            let pairs: Vec<(Id, i32)> = forward_anchors.into_iter().collect();
            warren_sql::relationship::bulk_reorder(&pairs, true, &mut *conn).await?;
        }
        if !reverse_anchors.is_empty() {
            let pairs: Vec<(Id, i32)> = reverse_anchors.into_iter().collect();
            warren_sql::relationship::bulk_reorder(&pairs, false, &mut *conn).await?;
        }
    }

    Ok(())
}

/// Walk every shard with pending estate work, opening one 2PC anchor per
/// drained shard. The anchors accumulate in `tpcs` for the caller to
/// commit together or roll back together.
async fn walk_estates<'p>(
    pool: &'p Pool,
    estates: &mut EstateMap,
    tpcs: &mut Vec<TwoPhaseCommit<'p>>,
    root: Id,
    ctx: Ctx,
    op_name: &str,
    root_is_node: bool,
    timer: &OpTimer,
) -> Result<()> {
    let mut first_drain = true;

    while let Some(&shard) = estates.keys().next() {
        // A bucket can empty out entirely through optimistic-entry
        // discards; don't spend a 2PC on it.
        if estates.get(&shard).is_some_and(|estate| estate.is_empty()) {
            estates.remove(&shard);
            continue;
        }

        let mut tpc =
            TwoPhaseCommit::new(pool, shard, op_name, format_args!("{root}.{ctx}.{shard}"));
        let mut guard = tpc.begin(timer).await?;

        let skip_first_batch = first_drain && !root_is_node;
        first_drain = false;

        match drain_local_estate(pool, shard, estates, &mut guard, skip_first_batch).await {
            Ok(()) => {
                tpc.finish(guard).await?;
                tpcs.push(tpc);
            }
            Err(err) => {
                tpc.abort(guard).await;
                return Err(err);
            }
        }
    }

    Ok(())
}

/// Commit every anchor accumulated by a walk, or roll them all back after
/// a failure (each attempt independently; secondary failures are logged
/// and swallowed so every anchor gets its chance).
async fn finish_walk(
    tpcs: Vec<TwoPhaseCommit<'_>>,
    walk: Result<()>,
    timer: &OpTimer,
) -> Result<bool> {
    match walk {
        Err(err) => {
            for tpc in &tpcs {
                if let Err(rollback_err) = tpc.rollback(timer).await {
                    tracing::warn!(
                        gid = %tpc.gid(),
                        ?rollback_err,
                        "cascade rollback left a prepared transaction behind"
                    );
                }
            }
            Err(err)
        }
        Ok(()) => {
            for tpc in &tpcs {
                tpc.commit(timer).await?;
            }
            Ok(true)
        }
    }
}

/// Cascading removal of an entity: tombstone the entity row in a first
/// anchor, then walk the estate across shards.
pub(crate) async fn remove_entity(pool: &Pool, id: Id, ctx: Ctx, timer: &OpTimer) -> Result<bool> {
    let shard = pool.router().shard_of(id);
    let mut root_tpc = TwoPhaseCommit::new(
        pool,
        shard,
        "remove_entity_start",
        format_args!("{id}.{ctx}.{shard}"),
    );

    let mut guard = root_tpc.begin(timer).await?;
    let removed = match warren_sql::entity::remove(id, ctx, &mut guard).await {
        Ok(removed) => removed,
        Err(err) => {
            root_tpc.abort(guard).await;
            return Err(err.into());
        }
    };
    if !removed {
        root_tpc.fail();
        root_tpc.finish(guard).await?;
        return Ok(false);
    }
    root_tpc.finish(guard).await?;

    let mut tpcs = vec![root_tpc];
    let mut estates = EstateMap::new();
    estates.entry(shard).or_default().nodes.push(id);

    let walk = walk_estates(
        pool,
        &mut estates,
        &mut tpcs,
        id,
        ctx,
        "remove_entity_shard",
        false,
        timer,
    )
    .await;
    finish_walk(tpcs, walk, timer).await
}

/// Cascading removal of a node: tombstone its incoming edge on the parent's
/// shard in a first anchor, then walk from the node itself.
pub(crate) async fn remove_node(
    pool: &Pool,
    id: Id,
    ctx: Ctx,
    base_id: Id,
    timer: &OpTimer,
) -> Result<bool> {
    let edge_shard = pool.router().shard_of(base_id);
    let mut edge_tpc = TwoPhaseCommit::new(
        pool,
        edge_shard,
        "remove_node_edge",
        format_args!("{id}.{ctx}.{base_id}"),
    );

    let mut guard = edge_tpc.begin(timer).await?;
    let removed = match warren_sql::edge::remove(base_id, ctx, id, &mut guard).await {
        Ok(removed) => removed,
        Err(err) => {
            edge_tpc.abort(guard).await;
            return Err(err.into());
        }
    };
    if !removed {
        edge_tpc.fail();
        edge_tpc.finish(guard).await?;
        return Ok(false);
    }
    edge_tpc.finish(guard).await?;

    let mut tpcs = vec![edge_tpc];
    let mut estates = EstateMap::new();
    estates
        .entry(pool.router().shard_of(id))
        .or_default()
        .nodes
        .push(id);

    let walk = walk_estates(
        pool,
        &mut estates,
        &mut tpcs,
        id,
        ctx,
        "remove_node_shard",
        true,
        timer,
    )
    .await;
    finish_walk(tpcs, walk, timer).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::ContextConfig;
    use crate::config::{DbConfig, ShardConfig};
    use warren_sql::Table;

    fn router(lookup_plans: Vec<Vec<(ShardId, u32)>>) -> Router {
        let shards = (0..4)
            .map(|n| ShardConfig {
                shard: n,
                count: 1,
                host: "localhost".into(),
                port: 5432,
                user: "warren".into(),
                password: "warren".into(),
                database: format!("warren_{n}"),
            })
            .collect();
        Router::new(&DbConfig {
            shards,
            shard_bits: 8,
            lookup_insertion_plans: lookup_plans,
            entity_insertion_plan: vec![],
            digest_key: "key".into(),
        })
        .unwrap()
    }

    fn id_on(shard: u64, seq: u64) -> Id {
        Id::from_i64(((shard << 56) | seq) as i64)
    }

    #[test]
    fn alias_rows_queue_on_every_plan_shard() {
        let router = router(vec![vec![(0, 1)], vec![(1, 1)], vec![(2, 1)]]);
        let mut estates = EstateMap::new();

        deposit_alias_rows(&mut estates, &router, &[("hello".into(), 5)]);

        let digest = router.digest("hello");
        let shards = router.alias_read_shards(&digest);
        assert_eq!(estates.len(), shards.len());
        for shard in shards {
            assert!(estates[&shard]
                .alias_lookups
                .contains(&(digest.to_vec(), 5)));
        }
    }

    #[test]
    fn rel_peers_queue_on_the_far_shard_without_descending() {
        let router = router(vec![vec![(0, 1)]]);
        let mut estates = EstateMap::new();

        let forward = RelationshipRef {
            base_id: id_on(1, 10),
            ctx: 9,
            forward: true,
            rel_id: id_on(3, 44),
        };
        deposit_rel_rows(&mut estates, &router, &[forward.clone()]);

        let estate = &estates[&3];
        assert_eq!(estate.rels, vec![forward.peer()]);
        assert_eq!(estate.rels[0].forward, false);
        // Relationship discoveries are tombstone-only: no node descent.
        assert!(estate.nodes.is_empty());
    }

    #[test]
    fn children_queue_on_their_own_shard() {
        let router = router(vec![vec![(0, 1)]]);
        let mut estates = EstateMap::new();

        deposit_children(&mut estates, &router, &[id_on(2, 1), id_on(2, 2), id_on(0, 3)]);

        assert_eq!(estates[&2].nodes, vec![id_on(2, 1), id_on(2, 2)]);
        assert_eq!(estates[&0].nodes, vec![id_on(0, 3)]);
    }

    #[test]
    fn name_rows_split_by_search_strategy() {
        let router = router(vec![vec![(0, 1), (1, 1)]]);
        let mut catalog = Catalog::new();
        catalog
            .register_context(1, Table::Entity, ContextConfig::default())
            .unwrap();
        catalog
            .register_context(
                2,
                Table::Name,
                ContextConfig {
                    base_ctx: Some(1),
                    search: Some(SearchStrategy::Prefix),
                    ..Default::default()
                },
            )
            .unwrap();
        catalog
            .register_context(
                3,
                Table::Name,
                ContextConfig {
                    base_ctx: Some(1),
                    search: Some(SearchStrategy::Phonetic),
                    phonetic_loose: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let base = id_on(0, 7);
        let mut estates = EstateMap::new();
        deposit_name_rows(
            &mut estates,
            &router,
            &catalog,
            &[(base, "foo".into(), 2), (base, "window".into(), 3)],
        );

        let prefixes: usize = estates.values().map(|e| e.prefix_lookups.len()).sum();
        assert_eq!(prefixes, 1);
        let phonetics: usize = estates.values().map(|e| e.phonetic_lookups.len()).sum();
        // Loose phonetic contexts queue one row per metaphone code.
        assert!(phonetics >= 1);
        for estate in estates.values() {
            for (code, value, ctx, base_id) in &estate.phonetic_lookups {
                assert_eq!(code.len(), 4);
                assert_eq!(value, "window");
                assert_eq!(*ctx, 3);
                assert_eq!(*base_id, base);
            }
        }
    }
}

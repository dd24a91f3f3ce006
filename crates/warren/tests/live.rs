//! End-to-end tests against a real Postgres instance.
//!
//! These need a database with `schema.sql` applied and
//! `max_prepared_transactions > 0`, named by the `WARREN_TEST_DATABASE`
//! environment variable (host/port/user/password via the usual
//! `WARREN_TEST_*` variables, defaulting to a local instance). Without it
//! every test is a no-op so the suite passes on machines with no cluster.

use std::time::Duration;

use warren::{
    api, Catalog, ContextConfig, DbConfig, Pool, SearchStrategy, ShardConfig, StorageClass, Table,
    Value,
};

const ENTITY: i32 = 1;
const PROP: i32 = 2;
const ALIAS: i32 = 3;
const CHILD: i32 = 4;
const REL: i32 = 5;
const NAME: i32 = 6;

fn test_config() -> Option<DbConfig> {
    let database = std::env::var("WARREN_TEST_DATABASE").ok()?;
    let env = |key: &str, default: &str| {
        std::env::var(format!("WARREN_TEST_{key}")).unwrap_or_else(|_| default.to_owned())
    };

    Some(DbConfig {
        shards: vec![ShardConfig {
            shard: 0,
            count: 4,
            host: env("HOST", "localhost"),
            port: env("PORT", "5432").parse().expect("invalid test port"),
            user: env("USER", "postgres"),
            password: env("PASSWORD", "postgres"),
            database,
        }],
        shard_bits: 8,
        lookup_insertion_plans: vec![vec![(0, 1)]],
        entity_insertion_plan: vec![],
        digest_key: "warren test digest key".into(),
    })
}

fn catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog
        .register_context(ENTITY, Table::Entity, ContextConfig::default())
        .unwrap();
    catalog
        .register_context(
            PROP,
            Table::Property,
            ContextConfig {
                base_ctx: Some(ENTITY),
                storage: Some(StorageClass::Int),
                ..Default::default()
            },
        )
        .unwrap();
    catalog
        .register_context(
            ALIAS,
            Table::Alias,
            ContextConfig {
                base_ctx: Some(ENTITY),
                ..Default::default()
            },
        )
        .unwrap();
    catalog
        .register_context(
            CHILD,
            Table::Node,
            ContextConfig {
                base_ctx: Some(ENTITY),
                storage: Some(StorageClass::Text),
                ..Default::default()
            },
        )
        .unwrap();
    catalog
        .register_context(
            REL,
            Table::Relationship,
            ContextConfig {
                base_ctx: Some(ENTITY),
                rel_ctx: Some(ENTITY),
                ..Default::default()
            },
        )
        .unwrap();
    catalog
        .register_context(
            NAME,
            Table::Name,
            ContextConfig {
                base_ctx: Some(ENTITY),
                search: Some(SearchStrategy::Prefix),
                ..Default::default()
            },
        )
        .unwrap();
    for ctx in [ENTITY, PROP, ALIAS, CHILD, REL, NAME] {
        catalog.register_flag(ctx, 1, "one").unwrap();
        catalog.register_flag(ctx, 2, "two").unwrap();
    }
    catalog
}

async fn pool() -> Option<Pool> {
    let config = test_config()?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let pool = Pool::new(config, catalog()).unwrap();
    pool.start();
    assert!(
        pool.wait_ready(Some(Duration::from_secs(10))).await,
        "test database did not come up",
    );
    Some(pool)
}

/// A distinct suffix per test run keeps alias/name values from colliding
/// with earlier runs against the same database.
fn unique(tag: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{tag}-{nanos}")
}

#[tokio::test]
async fn property_upsert_then_update() {
    let Some(pool) = pool().await else { return };

    let entity = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();

    let outcome = api::property::set(&pool, entity.id, PROP, &Value::Int(10), &[], None)
        .await
        .unwrap();
    assert_eq!(outcome, (true, false));

    let outcome = api::property::set(&pool, entity.id, PROP, &Value::Int(20), &[], None)
        .await
        .unwrap();
    assert_eq!(outcome, (false, true));

    let property = api::property::get(&pool, entity.id, PROP, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(property.value, Value::Int(20));

    // Parent-less writes report (false, false).
    let orphan = api::property::set(
        &pool,
        warren::Id::from_i64(0x7a7a7a),
        PROP,
        &Value::Int(1),
        &[],
        None,
    )
    .await
    .unwrap();
    assert_eq!(orphan, (false, false));
}

#[tokio::test]
async fn increment_saturates_at_limit() {
    let Some(pool) = pool().await else { return };

    let entity = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();
    api::property::set(&pool, entity.id, PROP, &Value::Int(8), &[], None)
        .await
        .unwrap();

    let value = api::property::increment(&pool, entity.id, PROP, 5, Some(10), None)
        .await
        .unwrap();
    assert_eq!(value, Some(10));
    let value = api::property::increment(&pool, entity.id, PROP, -4, Some(7), None)
        .await
        .unwrap();
    assert_eq!(value, Some(7));
}

#[tokio::test]
async fn alias_set_is_globally_unique() {
    let Some(pool) = pool().await else { return };

    let a = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();
    let b = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();
    let value = unique("handle");

    assert!(api::alias::set(&pool, a.id, ALIAS, &value, &[], None, None)
        .await
        .unwrap());
    // Setting the same alias again on the same owner reports "already ours".
    assert!(!api::alias::set(&pool, a.id, ALIAS, &value, &[], None, None)
        .await
        .unwrap());
    // Any other owner collides.
    let collision = api::alias::set(&pool, b.id, ALIAS, &value, &[], None, None).await;
    assert!(matches!(collision, Err(warren::Error::AliasInUse { .. })));

    let owner = api::alias::lookup(&pool, &value, ALIAS, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(owner.base_id, a.id);
}

#[tokio::test]
async fn shift_clamps_to_tail_and_preserves_order() {
    let Some(pool) = pool().await else { return };

    let entity = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();
    let (a, b, c) = (unique("a"), unique("b"), unique("c"));
    for value in [&a, &b, &c] {
        api::alias::set(&pool, entity.id, ALIAS, value, &[], None, None)
            .await
            .unwrap();
    }

    // [a b c] -> shift c to the front -> [c a b].
    assert!(api::alias::shift(&pool, entity.id, ALIAS, &c, 0, None)
        .await
        .unwrap());
    let (aliases, _) = api::alias::list(&pool, entity.id, ALIAS, 10, 0, None)
        .await
        .unwrap();
    let values: Vec<&str> = aliases.iter().map(|alias| alias.value.as_str()).collect();
    assert_eq!(values, vec![c.as_str(), a.as_str(), b.as_str()]);
    assert_eq!(
        aliases.iter().map(|alias| alias.pos).collect::<Vec<_>>(),
        vec![0, 1, 2],
    );

    // A shift past the tail clamps to the last slot.
    assert!(api::alias::shift(&pool, entity.id, ALIAS, &c, 99, None)
        .await
        .unwrap());
    let (aliases, _) = api::alias::list(&pool, entity.id, ALIAS, 10, 0, None)
        .await
        .unwrap();
    let values: Vec<&str> = aliases.iter().map(|alias| alias.value.as_str()).collect();
    assert_eq!(values, vec![a.as_str(), b.as_str(), c.as_str()]);
}

#[tokio::test]
async fn set_then_clear_flags_round_trips() {
    let Some(pool) = pool().await else { return };

    let entity = api::entity::create(&pool, ENTITY, &[1], None).await.unwrap();

    let flags = api::entity::set_flags(&pool, entity.id, ENTITY, &[2], &[], None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flags, warren::FlagSet::from([1, 2]));

    let flags = api::entity::set_flags(&pool, entity.id, ENTITY, &[], &[1, 2], None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flags, warren::FlagSet::new());
}

#[tokio::test]
async fn relationship_pair_stays_symmetric() {
    let Some(pool) = pool().await else { return };

    let a = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();
    let b = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();

    assert!(
        api::relationship::create(&pool, REL, a.id, b.id, &[], None, None, None)
            .await
            .unwrap()
    );
    // The pair already exists.
    assert!(
        !api::relationship::create(&pool, REL, a.id, b.id, &[], None, None, None)
            .await
            .unwrap()
    );

    let flags = api::relationship::set_flags(&pool, a.id, b.id, REL, &[1], &[], None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flags, warren::FlagSet::from([1]));

    let (forward, _) = api::relationship::list(&pool, a.id, REL, true, 10, 0, None, None)
        .await
        .unwrap();
    let (reverse, _) = api::relationship::list(&pool, b.id, REL, false, 10, 0, None, None)
        .await
        .unwrap();
    assert_eq!(forward.len(), 1);
    assert_eq!(reverse.len(), 1);
    assert_eq!(forward[0].flags, reverse[0].flags);

    assert!(api::relationship::remove(&pool, a.id, b.id, REL, None)
        .await
        .unwrap());
    let (forward, _) = api::relationship::list(&pool, a.id, REL, true, 10, 0, None, None)
        .await
        .unwrap();
    assert!(forward.is_empty());
}

#[tokio::test]
async fn node_lifecycle_and_move() {
    let Some(pool) = pool().await else { return };

    let parent = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();
    let other = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();

    let node = api::node::create(&pool, parent.id, CHILD, &Value::from("v1"), &[], None)
        .await
        .unwrap();

    assert!(api::node::update(
        &pool,
        node.id,
        CHILD,
        &Value::from("v2"),
        Some(&Value::from("v1")),
        None,
    )
    .await
    .unwrap());
    // Compare-and-set against a stale value refuses.
    assert!(!api::node::update(
        &pool,
        node.id,
        CHILD,
        &Value::from("v3"),
        Some(&Value::from("v1")),
        None,
    )
    .await
    .unwrap());

    assert!(
        api::node::move_node(&pool, node.id, CHILD, parent.id, other.id, None)
            .await
            .unwrap()
    );
    let (children, _) = api::node::list_children(&pool, other.id, CHILD, 10, 0, None)
        .await
        .unwrap();
    assert_eq!(children, vec![node.id]);
    let (children, _) = api::node::list_children(&pool, parent.id, CHILD, 10, 0, None)
        .await
        .unwrap();
    assert!(children.is_empty());

    assert!(api::node::remove(&pool, node.id, CHILD, other.id, None)
        .await
        .unwrap());
    assert!(api::node::get(&pool, node.id, CHILD, None)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn entity_removal_reaches_the_whole_estate() {
    let Some(pool) = pool().await else { return };

    let entity = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();
    let peer = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();
    let alias_value = unique("estate");

    api::property::set(&pool, entity.id, PROP, &Value::Int(1), &[], None)
        .await
        .unwrap();
    api::alias::set(&pool, entity.id, ALIAS, &alias_value, &[], None, None)
        .await
        .unwrap();
    api::relationship::create(&pool, REL, entity.id, peer.id, &[], None, None, None)
        .await
        .unwrap();
    let node = api::node::create(&pool, entity.id, CHILD, &Value::from("child"), &[], None)
        .await
        .unwrap();

    assert!(api::entity::remove(&pool, entity.id, ENTITY, None)
        .await
        .unwrap());

    assert!(api::entity::get(&pool, entity.id, ENTITY, None)
        .await
        .unwrap()
        .is_none());
    assert!(api::alias::lookup(&pool, &alias_value, ALIAS, None)
        .await
        .unwrap()
        .is_none());
    assert!(api::node::get(&pool, node.id, CHILD, None)
        .await
        .unwrap()
        .is_none());
    // The peer's reverse list no longer reaches the removed entity.
    let (reverse, _) = api::relationship::list(&pool, peer.id, REL, false, 10, 0, None, None)
        .await
        .unwrap();
    assert!(reverse.is_empty());
}

#[tokio::test]
async fn prefix_names_are_searchable() {
    let Some(pool) = pool().await else { return };

    let entity = api::entity::create(&pool, ENTITY, &[], None).await.unwrap();
    let value = unique("finch");

    assert!(
        api::name::create(&pool, entity.id, NAME, &value, &[], None, None)
            .await
            .unwrap()
    );

    let (matches, cursor) = api::name::search(&pool, &value, NAME, 10, None, None)
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].base_id, entity.id);
    assert_eq!(matches[0].value, value);
    assert!(cursor.is_some());

    assert!(api::name::remove(&pool, entity.id, NAME, &value, None)
        .await
        .unwrap());
    let (matches, _) = api::name::search(&pool, &value, NAME, 10, None, None)
        .await
        .unwrap();
    assert!(matches.is_empty());
}

#[tokio::test]
async fn readonly_pools_refuse_mutations() {
    let Some(config) = test_config() else { return };
    let pool = Pool::readonly(config, catalog()).unwrap();

    // Refusal happens before any connection is touched, so no start().
    let result = api::entity::create(&pool, ENTITY, &[], None).await;
    assert!(matches!(result, Err(warren::Error::ReadOnly)));
}

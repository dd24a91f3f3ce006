use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;

use models::{Id, ShardId};

use crate::config::DbConfig;
use crate::error::{Error, Result};

/// A weighted insertion plan, prepared once into a cumulative-sum vector.
/// Selection is a binary search for the least entry whose partial sum
/// strictly exceeds `key % total`.
#[derive(Debug, Clone)]
struct Plan {
    cumulative: Vec<(u64, ShardId)>,
    total: u64,
}

impl Plan {
    fn prepare(weighted: &[(ShardId, u32)]) -> Result<Self> {
        if weighted.is_empty() {
            return Err(Error::Config("empty insertion plan".into()));
        }
        let mut partial = 0u64;
        let cumulative = weighted
            .iter()
            .map(|&(shard, weight)| {
                partial += weight as u64;
                (partial, shard)
            })
            .collect();
        Ok(Plan {
            cumulative,
            total: partial,
        })
    }

    fn pick(&self, key: u64) -> ShardId {
        let key = key % self.total;
        let index = self.cumulative.partition_point(|&(sum, _)| sum <= key);
        self.cumulative[index].1
    }

    /// Pick keyed by a digest interpreted as a big-endian integer, folded
    /// modulo the plan's total weight.
    fn pick_digest(&self, digest: &[u8]) -> ShardId {
        let key = digest.iter().fold(0u64, |acc, &byte| {
            (((acc as u128) << 8 | byte as u128) % self.total as u128) as u64
        });
        self.pick(key)
    }
}

/// Routes identifiers and lookup keys to shards. Pure functions of the
/// configuration; every operation goes through here exactly once per key.
pub struct Router {
    shard_bits: u32,
    digest_key: Vec<u8>,
    /// In configured order, oldest first; writes use the last plan, reads
    /// traverse all of them newest-first.
    lookup_plans: Vec<Plan>,
    entity_plan: Plan,
}

impl Router {
    pub fn new(config: &DbConfig) -> Result<Self> {
        config.validate()?;
        let lookup_plans = config
            .lookup_insertion_plans
            .iter()
            .map(|plan| Plan::prepare(plan))
            .collect::<Result<Vec<_>>>()?;
        let entity_plan = Plan::prepare(&config.effective_entity_plan())?;

        Ok(Router {
            shard_bits: config.shard_bits,
            digest_key: config.digest_key.clone().into_bytes(),
            lookup_plans,
            entity_plan,
        })
    }

    pub fn shard_bits(&self) -> u32 {
        self.shard_bits
    }

    pub fn shard_of(&self, id: Id) -> ShardId {
        id.shard(self.shard_bits)
    }

    /// The keyed 160-bit digest sharding alias values.
    pub fn digest(&self, value: &str) -> [u8; 20] {
        let mut mac = Hmac::<Sha1>::new_from_slice(&self.digest_key)
            .expect("hmac accepts keys of any length");
        mac.update(value.as_bytes());
        mac.finalize().into_bytes().into()
    }

    /// Weighted-random placement for a new entity.
    pub fn entity_write_shard(&self) -> ShardId {
        let key = rand::thread_rng().gen_range(0..self.entity_plan.total);
        self.entity_plan.pick(key)
    }

    pub fn alias_write_shard(&self, digest: &[u8]) -> ShardId {
        self.write_plan().pick_digest(digest)
    }

    pub fn alias_read_shards(&self, digest: &[u8]) -> Vec<ShardId> {
        self.read_shards(|plan| plan.pick_digest(digest))
    }

    pub fn prefix_write_shard(&self, value: &str) -> ShardId {
        self.write_plan().pick(first_byte(value))
    }

    pub fn prefix_read_shards(&self, value: &str) -> Vec<ShardId> {
        self.read_shards(|plan| plan.pick(first_byte(value)))
    }

    // Pass the phonetic code and these are the prefix implementations.
    pub fn phonetic_write_shard(&self, code: &str) -> ShardId {
        self.prefix_write_shard(code)
    }

    pub fn phonetic_read_shards(&self, code: &str) -> Vec<ShardId> {
        self.prefix_read_shards(code)
    }

    fn write_plan(&self) -> &Plan {
        self.lookup_plans.last().expect("validated as non-empty")
    }

    /// Newest-first over all plans, de-duplicating shards: a lookup written
    /// under an older plan stays reachable after shard additions.
    fn read_shards(&self, pick: impl Fn(&Plan) -> ShardId) -> Vec<ShardId> {
        let mut seen = Vec::new();
        for plan in self.lookup_plans.iter().rev() {
            let shard = pick(plan);
            if !seen.contains(&shard) {
                seen.push(shard);
            }
        }
        seen
    }
}

fn first_byte(value: &str) -> u64 {
    value.as_bytes().first().copied().unwrap_or(0) as u64
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ShardConfig;

    fn config(plans: Vec<Vec<(ShardId, u32)>>) -> DbConfig {
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
        DbConfig {
            shards,
            shard_bits: 8,
            lookup_insertion_plans: plans,
            entity_insertion_plan: vec![],
            digest_key: "key".into(),
        }
    }

    #[test]
    fn weighted_pick_follows_cumulative_sums() {
        let plan = Plan::prepare(&[(0, 2), (1, 1), (2, 3)]).unwrap();
        // total 6: keys 0,1 -> shard 0; 2 -> shard 1; 3,4,5 -> shard 2.
        assert_eq!(plan.pick(0), 0);
        assert_eq!(plan.pick(1), 0);
        assert_eq!(plan.pick(2), 1);
        assert_eq!(plan.pick(3), 2);
        assert_eq!(plan.pick(5), 2);
        assert_eq!(plan.pick(6), 0); // wraps modulo total
    }

    #[test]
    fn digest_fold_matches_big_endian_mod() {
        let plan = Plan::prepare(&[(0, 1), (1, 1), (2, 1)]).unwrap();
        // 0x0102 = 258; 258 % 3 = 0.
        assert_eq!(plan.pick_digest(&[0x01, 0x02]), 0);
        // 0x0103 = 259; 259 % 3 = 1.
        assert_eq!(plan.pick_digest(&[0x01, 0x03]), 1);
    }

    #[test]
    fn read_shards_are_newest_first_and_deduplicated() {
        let router = Router::new(&config(vec![
            vec![(0, 1)],
            vec![(1, 1)],
            vec![(1, 2), (2, 1)],
        ]))
        .unwrap();

        // The key folds to the same pick within plans 2 and 1.
        let shards = router.prefix_read_shards("\u{0}");
        assert_eq!(shards[0], router.prefix_write_shard("\u{0}"));
        assert!(shards.ends_with(&[0]));
        let mut deduped = shards.clone();
        deduped.dedup();
        assert_eq!(shards, deduped);
    }

    #[test]
    fn alias_write_shard_heads_the_read_order() {
        let router = Router::new(&config(vec![
            vec![(0, 1), (1, 1)],
            vec![(2, 1), (3, 2)],
        ]))
        .unwrap();

        let digest = router.digest("some alias value");
        let reads = router.alias_read_shards(&digest);
        assert_eq!(reads[0], router.alias_write_shard(&digest));
        assert!(!reads.is_empty() && reads.len() <= 2);
    }

    #[test]
    fn digest_is_keyed() {
        let a = Router::new(&config(vec![vec![(0, 1)]])).unwrap();
        let mut cfg = config(vec![vec![(0, 1)]]);
        cfg.digest_key = "other key".into();
        let b = Router::new(&cfg).unwrap();
        assert_ne!(a.digest("hello"), b.digest("hello"));
        assert_eq!(a.digest("hello"), a.digest("hello"));
    }

    #[test]
    fn entity_writes_respect_plan_membership() {
        let mut cfg = config(vec![vec![(0, 1)]]);
        cfg.entity_insertion_plan = vec![(1, 1), (3, 2)];
        let router = Router::new(&cfg).unwrap();
        for _ in 0..64 {
            let shard = router.entity_write_shard();
            assert!(shard == 1 || shard == 3);
        }
    }

    #[test]
    fn shard_of_id_is_top_bits() {
        let router = Router::new(&config(vec![vec![(0, 1)]])).unwrap();
        let id = Id::from_i64(((2u64 << 56) | 99) as i64);
        assert_eq!(router.shard_of(id), 2);
    }
}

use serde::Deserialize;

use models::ShardId;

use crate::error::{Error, Result};

/// Cluster configuration: shard membership, the id layout, and the
/// insertion plans routing lookups and new entities to shards.
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    /// Connection credentials and pool quota per shard.
    pub shards: Vec<ShardConfig>,

    /// Bits at the top of every 64-bit id reserved for the shard number.
    /// Fixed for the cluster's lifetime; 8 is a good value.
    pub shard_bits: u32,

    /// Weighted plans for placing alias/name lookup rows. The last plan is
    /// used for writes; reads traverse every plan newest-first, so plans
    /// that made it to production may only ever be appended to.
    pub lookup_insertion_plans: Vec<Vec<(ShardId, u32)>>,

    /// Weighted plan for placing new entities. Defaults to uniform weight
    /// over all shards.
    #[serde(default)]
    pub entity_insertion_plan: Vec<(ShardId, u32)>,

    /// Key for the HMAC over alias values; keyed hashing keeps outside
    /// writers from aiming values at a chosen shard.
    pub digest_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardConfig {
    pub shard: ShardId,
    /// Number of pooled connections to hold for this shard.
    pub count: usize,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DbConfig {
    /// Check the configuration once at startup; routing assumes it holds.
    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(Error::Config("missing or empty required key 'shards'".into()));
        }
        if !(1..=63).contains(&self.shard_bits) {
            return Err(Error::Config(format!(
                "'shard_bits' must be in 1..=63, got {}",
                self.shard_bits
            )));
        }
        if self.digest_key.is_empty() {
            return Err(Error::Config(
                "missing or empty required key 'digest_key'".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.shard) {
                return Err(Error::Config(format!(
                    "duplicate shard number {}",
                    shard.shard
                )));
            }
            if shard.count == 0 {
                return Err(Error::Config(format!(
                    "shard {} has a zero connection count",
                    shard.shard
                )));
            }
        }

        if self.lookup_insertion_plans.is_empty() {
            return Err(Error::Config(
                "missing or empty required key 'lookup_insertion_plans'".into(),
            ));
        }
        for plan in &self.lookup_insertion_plans {
            self.validate_plan(plan, "lookup_insertion_plans", &seen)?;
        }
        if !self.entity_insertion_plan.is_empty() {
            self.validate_plan(&self.entity_insertion_plan, "entity_insertion_plan", &seen)?;
        }

        Ok(())
    }

    fn validate_plan(
        &self,
        plan: &[(ShardId, u32)],
        key: &str,
        members: &std::collections::HashSet<ShardId>,
    ) -> Result<()> {
        if plan.is_empty() {
            return Err(Error::Config(format!("empty plan under '{key}'")));
        }
        for (shard, weight) in plan {
            if *weight == 0 {
                return Err(Error::Config(format!(
                    "zero weight for shard {shard} under '{key}'"
                )));
            }
            if !members.contains(shard) {
                return Err(Error::Config(format!(
                    "plan under '{key}' names unconfigured shard {shard}"
                )));
            }
        }
        Ok(())
    }

    /// The entity plan actually in effect: the configured one, or uniform
    /// weight over all shards.
    pub(crate) fn effective_entity_plan(&self) -> Vec<(ShardId, u32)> {
        if self.entity_insertion_plan.is_empty() {
            self.shards.iter().map(|s| (s.shard, 1)).collect()
        } else {
            self.entity_insertion_plan.clone()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn shard(n: ShardId) -> ShardConfig {
        ShardConfig {
            shard: n,
            count: 2,
            host: "localhost".into(),
            port: 5432,
            user: "warren".into(),
            password: "warren".into(),
            database: format!("warren_{n}"),
        }
    }

    fn config() -> DbConfig {
        DbConfig {
            shards: vec![shard(0), shard(1)],
            shard_bits: 8,
            lookup_insertion_plans: vec![vec![(0, 1), (1, 1)]],
            entity_insertion_plan: vec![],
            digest_key: "super secret".into(),
        }
    }

    #[test]
    fn accepts_a_sound_config() {
        config().validate().unwrap();
    }

    #[test]
    fn rejects_bad_shard_bits() {
        let mut cfg = config();
        cfg.shard_bits = 64;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        cfg.shard_bits = 0;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_empty_and_unknown_plans() {
        let mut cfg = config();
        cfg.lookup_insertion_plans = vec![];
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = config();
        cfg.lookup_insertion_plans = vec![vec![]];
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = config();
        cfg.lookup_insertion_plans = vec![vec![(7, 1)]];
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = config();
        cfg.lookup_insertion_plans = vec![vec![(0, 0)]];
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn errors_name_the_offending_key() {
        let mut cfg = config();
        cfg.lookup_insertion_plans = vec![vec![(7, 1)]];
        let err = cfg.validate().unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"invalid configuration: plan under 'lookup_insertion_plans' names unconfigured shard 7"
        );
    }

    #[test]
    fn entity_plan_defaults_to_uniform() {
        let cfg = config();
        assert_eq!(cfg.effective_entity_plan(), vec![(0, 1), (1, 1)]);
    }

    #[test]
    fn deserializes_from_json() {
        let cfg: DbConfig = serde_json::from_value(serde_json::json!({
            "shards": [{
                "shard": 0,
                "count": 4,
                "host": "db0.internal",
                "port": 5432,
                "user": "warren",
                "password": "hunter2",
                "database": "warren",
            }],
            "shard_bits": 8,
            "lookup_insertion_plans": [[[0, 1]]],
            "digest_key": "super secret",
        }))
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.shards[0].count, 4);
    }
}

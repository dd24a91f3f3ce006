use std::future::Future;
use std::time::Duration;

use models::ShardId;

use crate::error::Result;
use crate::pool::{ConnGuard, Pool};
use crate::timer::OpTimer;

/// The outcome of dependent-shard work run under [`TwoPhaseCommit::elsewhere`]:
/// either commit the prepared anchor, or roll it back while still returning
/// a value ("nothing to do" is a result, not an error).
pub(crate) enum Else<T> {
    Commit(T),
    Fail(T),
}

/// A two-phase commit over one anchor shard.
///
/// The transaction identifier is derived from a random nonce, the operation
/// name and a business key: the nonce protects against collision within one
/// run, and the business key lets an operator recognise what a dangling
/// prepared transaction was doing.
///
/// The connection that prepares is returned to the pool immediately; the
/// identifier is the only link, so any later connection to the anchor shard
/// can commit or roll back.
pub(crate) struct TwoPhaseCommit<'p> {
    pool: &'p Pool,
    shard: ShardId,
    gid: String,
    failed: bool,
}

impl<'p> TwoPhaseCommit<'p> {
    pub fn new(
        pool: &'p Pool,
        shard: ShardId,
        name: &str,
        business_key: impl std::fmt::Display,
    ) -> Self {
        let gid = format!("{:08x}.{name}.{business_key}", rand::random::<u32>());
        TwoPhaseCommit {
            pool,
            shard,
            gid,
            failed: false,
        }
    }

    pub fn gid(&self) -> &str {
        &self.gid
    }

    /// Mark the 2PC as failed; `finish`/`elsewhere` will roll back.
    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// Acquire an anchor connection and open the transaction on it.
    pub async fn begin(&self, timer: &OpTimer) -> Result<ConnGuard> {
        let mut guard = self.pool.acquire(self.shard, timer).await?;
        match sqlx::query("begin").execute(&mut *guard).await {
            Ok(_) => Ok(guard),
            Err(err) => {
                guard.mark_broken();
                Err(err.into())
            }
        }
    }

    /// Close the anchor transaction: prepare it under the gid, or roll it
    /// back when the 2PC was marked failed. Either way the connection goes
    /// back to the pool.
    pub async fn finish(&mut self, mut guard: ConnGuard) -> Result<()> {
        if self.failed {
            guard.rollback_quietly().await;
            return Ok(());
        }

        let sql = format!("prepare transaction '{}'", self.gid);
        match sqlx::query(&sql).execute(&mut *guard).await {
            Ok(_) => {
                tracing::debug!(gid = %self.gid, shard = self.shard, "prepared anchor transaction");
                Ok(())
            }
            Err(err) => {
                // A failed prepare aborts the transaction server-side.
                self.failed = true;
                guard.mark_broken();
                Err(err.into())
            }
        }
    }

    /// Roll back the open (not yet prepared) anchor transaction after a
    /// mutation error, marking the 2PC failed.
    pub async fn abort(&mut self, mut guard: ConnGuard) {
        self.failed = true;
        guard.rollback_quietly().await;
    }

    /// Commit the prepared anchor from any connection to its shard.
    pub async fn commit(&self, timer: &OpTimer) -> Result<()> {
        let mut guard = self.pool.acquire(self.shard, timer).await?;
        let sql = format!("commit prepared '{}'", self.gid);
        match sqlx::query(&sql).execute(&mut *guard).await {
            Ok(_) => Ok(()),
            Err(err) => {
                guard.mark_broken();
                Err(err.into())
            }
        }
    }

    /// Roll back the prepared anchor from any connection to its shard.
    pub async fn rollback(&self, timer: &OpTimer) -> Result<()> {
        let mut guard = self.pool.acquire(self.shard, timer).await?;
        let sql = format!("rollback prepared '{}'", self.gid);
        match sqlx::query(&sql).execute(&mut *guard).await {
            Ok(_) => Ok(()),
            Err(err) => {
                guard.mark_broken();
                Err(err.into())
            }
        }
    }

    /// Run dependent work on other shards between prepare and commit.
    ///
    /// An error rolls the anchor back (a secondary rollback failure is
    /// swallowed) and propagates. `Else::Fail` rolls back but still
    /// returns its value; `Else::Commit` commits the anchor.
    pub async fn elsewhere<T>(
        &mut self,
        timer: &OpTimer,
        work: impl Future<Output = Result<Else<T>>>,
    ) -> Result<T> {
        debug_assert!(!self.failed, "elsewhere on an already-failed 2PC");

        match work.await {
            Err(err) => {
                if let Err(rollback_err) = self.rollback(timer).await {
                    tracing::warn!(
                        gid = %self.gid,
                        ?rollback_err,
                        "anchor rollback after a dependent failure also failed"
                    );
                }
                Err(err)
            }
            Ok(Else::Fail(value)) => {
                self.fail();
                self.rollback(timer).await?;
                Ok(value)
            }
            Ok(Else::Commit(value)) => {
                if self.failed {
                    self.rollback(timer).await?;
                } else {
                    self.commit(timer).await?;
                }
                Ok(value)
            }
        }
    }
}

/// List this store's prepared-but-unresolved transactions on one shard
/// older than a threshold, for operator garbage collection after a timeout
/// fired between prepare and commit.
pub async fn list_prepared(
    pool: &Pool,
    shard: ShardId,
    older_than: Duration,
    timeout: Option<Duration>,
) -> Result<Vec<String>> {
    let timer = OpTimer::new(timeout);
    let mut guard = pool.acquire(shard, &timer).await?;

    let gids = sqlx::query_scalar::<_, String>(
        r#"
        select gid
        from pg_prepared_xacts
        where
            database = current_database()
            and prepared < now() - make_interval(secs => $1)
        order by prepared asc
        "#,
    )
    .bind(older_than.as_secs_f64())
    .fetch_all(&mut *guard)
    .await?;

    Ok(gids)
}

/// Resolve one dangling prepared transaction by gid.
pub async fn resolve_prepared(
    pool: &Pool,
    shard: ShardId,
    gid: &str,
    commit: bool,
    timeout: Option<Duration>,
) -> Result<()> {
    let timer = OpTimer::new(timeout);
    let mut guard = pool.acquire(shard, &timer).await?;

    let verb = if commit { "commit" } else { "rollback" };
    let sql = format!("{verb} prepared '{}'", gid.replace('\'', "''"));
    match sqlx::query(&sql).execute(&mut *guard).await {
        Ok(_) => Ok(()),
        Err(err) => {
            guard.mark_broken();
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::{DbConfig, ShardConfig};

    fn pool() -> Pool {
        let config = DbConfig {
            shards: vec![ShardConfig {
                shard: 0,
                count: 1,
                host: "localhost".into(),
                port: 5432,
                user: "warren".into(),
                password: "warren".into(),
                database: "warren".into(),
            }],
            shard_bits: 8,
            lookup_insertion_plans: vec![vec![(0, 1)]],
            entity_insertion_plan: vec![],
            digest_key: "key".into(),
        };
        Pool::new(config, Catalog::new()).unwrap()
    }

    #[test]
    fn gid_carries_name_and_business_key() {
        let pool = pool();
        let tpc = TwoPhaseCommit::new(&pool, 0, "set_alias", format_args!("{}.{}", 123, 7));
        let gid = tpc.gid();

        let (nonce, rest) = gid.split_once('.').unwrap();
        assert_eq!(nonce.len(), 8);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rest, "set_alias.123.7");
        assert!(gid.len() < 200);
    }

    #[test]
    fn gids_do_not_collide_within_a_run() {
        let pool = pool();
        let a = TwoPhaseCommit::new(&pool, 0, "op", 1);
        let b = TwoPhaseCommit::new(&pool, 0, "op", 1);
        assert_ne!(a.gid(), b.gid());
    }
}

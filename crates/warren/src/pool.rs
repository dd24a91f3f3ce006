use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tokio::sync::{oneshot, Semaphore};

use models::{Id, ShardId};

use crate::catalog::Catalog;
use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::router::Router;
use crate::timer::{CancelHandle, OpTimer, TimerState};

struct PooledConn {
    conn: PgConnection,
    pid: i32,
}

struct ShardPool {
    shard: ShardId,
    count: usize,
    connect: PgConnectOptions,
    semaphore: Semaphore,
    idle: Mutex<VecDeque<PooledConn>>,
}

impl ShardPool {
    async fn establish(&self) -> sqlx::Result<PooledConn> {
        let mut conn = PgConnection::connect_with(&self.connect).await?;
        let pid: i32 = sqlx::query_scalar("select pg_backend_pid()")
            .fetch_one(&mut conn)
            .await?;
        Ok(PooledConn { conn, pid })
    }

    fn release(&self, conn: PooledConn) {
        self.idle.lock().unwrap().push_back(conn);
        self.semaphore.add_permits(1);
    }

    /// Replace a connection that was discarded in an unknown state.
    fn respawn(self: &Arc<Self>) {
        let sp = Arc::clone(self);
        tokio::spawn(async move {
            match sp.establish().await {
                Ok(conn) => sp.release(conn),
                Err(err) => {
                    tracing::error!(shard = sp.shard, ?err, "failed to replace a discarded connection");
                }
            }
        });
    }
}

/// A pool-per-shard over the cluster, owning the catalog and router.
///
/// `start` initiates connection establishment concurrently and does not
/// block; `wait_ready` blocks until every shard has produced its quota.
pub struct Pool {
    readonly: bool,
    catalog: Arc<Catalog>,
    router: Router,
    shards: HashMap<ShardId, Arc<ShardPool>>,
    pending_ready: Mutex<Vec<oneshot::Receiver<()>>>,
}

impl Pool {
    pub fn new(config: DbConfig, catalog: Catalog) -> Result<Self> {
        Self::build(config, catalog, false)
    }

    /// A pool whose mutating operations refuse with `Error::ReadOnly`
    /// before touching the network. Useful against replication followers.
    pub fn readonly(config: DbConfig, catalog: Catalog) -> Result<Self> {
        Self::build(config, catalog, true)
    }

    fn build(config: DbConfig, catalog: Catalog, readonly: bool) -> Result<Self> {
        let router = Router::new(&config)?;

        let shards = config
            .shards
            .iter()
            .map(|shard| {
                let connect = PgConnectOptions::new()
                    .host(&shard.host)
                    .port(shard.port)
                    .username(&shard.user)
                    .password(&shard.password)
                    .database(&shard.database);
                let pool = ShardPool {
                    shard: shard.shard,
                    count: shard.count,
                    connect,
                    semaphore: Semaphore::new(0),
                    idle: Mutex::new(VecDeque::with_capacity(shard.count)),
                };
                (shard.shard, Arc::new(pool))
            })
            .collect();

        Ok(Pool {
            readonly,
            catalog: Arc::new(catalog),
            router,
            shards,
            pending_ready: Mutex::new(Vec::new()),
        })
    }

    /// Initiate the backend connections. Does not block; connections are
    /// established concurrently and enter their shard's pool as they come
    /// up. Use [`Pool::wait_ready`] to wait for the full quota.
    pub fn start(&self) {
        let mut pending = self.pending_ready.lock().unwrap();
        for sp in self.shards.values() {
            for _ in 0..sp.count {
                let (tx, rx) = oneshot::channel();
                pending.push(rx);
                let sp = Arc::clone(sp);
                tokio::spawn(async move {
                    match sp.establish().await {
                        Ok(conn) => {
                            sp.release(conn);
                            let _ = tx.send(());
                        }
                        Err(err) => {
                            tracing::error!(shard = sp.shard, ?err, "failed to establish a pooled connection");
                        }
                    }
                });
            }
        }
    }

    /// Block until every worker spawned by `start` has produced its
    /// connection. Returns whether the full quota came up in time.
    pub async fn wait_ready(&self, timeout: Option<Duration>) -> bool {
        let pending = std::mem::take(&mut *self.pending_ready.lock().unwrap());
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        for rx in pending {
            let ready = match deadline {
                None => rx.await.is_ok(),
                Some(deadline) => match tokio::time::timeout_at(deadline, rx).await {
                    Ok(result) => result.is_ok(),
                    Err(_) => false,
                },
            };
            if !ready {
                return false;
            }
        }
        true
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn assert_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub(crate) fn router(&self) -> &Router {
        &self.router
    }

    pub fn shard_of(&self, id: Id) -> ShardId {
        self.router.shard_of(id)
    }

    /// Check out a connection to `shard`, blocking until one is free or
    /// the operation deadline expires.
    pub(crate) async fn acquire(&self, shard: ShardId, timer: &OpTimer) -> Result<ConnGuard> {
        let sp = self.shards.get(&shard).ok_or(Error::NoShard(shard))?;
        if timer.expired() {
            return Err(Error::Timeout);
        }

        let permit = match timer.deadline() {
            None => sp.semaphore.acquire().await,
            Some(deadline) => tokio::time::timeout_at(deadline, sp.semaphore.acquire())
                .await
                .map_err(|_| Error::Timeout)?,
        }
        .expect("the pool semaphore is never closed");
        permit.forget();

        let conn = sp
            .idle
            .lock()
            .unwrap()
            .pop_front()
            .expect("a permit guarantees an idle connection");

        let timer_state = timer.state();
        timer_state.watch(CancelHandle {
            pid: conn.pid,
            connect: sp.connect.clone(),
        });

        Ok(ConnGuard {
            sp: Arc::clone(sp),
            conn: Some(conn),
            timer: Some(timer_state),
            broken: false,
        })
    }

    pub(crate) async fn acquire_by_id(&self, id: Id, timer: &OpTimer) -> Result<ConnGuard> {
        self.acquire(self.router.shard_of(id), timer).await
    }
}

/// An owning handle to one checked-out connection. Release happens on drop
/// on every exit path; connections left in an unknown state (cancelled
/// mid-query, failed rollback) are discarded and replaced in the
/// background instead of re-entering the pool.
pub(crate) struct ConnGuard {
    sp: Arc<ShardPool>,
    conn: Option<PooledConn>,
    timer: Option<Arc<TimerState>>,
    broken: bool,
}

impl ConnGuard {
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Best-effort rollback of an open transaction before an early return.
    pub async fn rollback_quietly(&mut self) {
        if let Err(err) = sqlx::query("rollback").execute(&mut **self).await {
            tracing::warn!(?err, "rollback failed, discarding the connection");
            self.mark_broken();
        }
    }
}

impl std::ops::Deref for ConnGuard {
    type Target = PgConnection;
    fn deref(&self) -> &PgConnection {
        &self.conn.as_ref().expect("present until drop").conn
    }
}

impl std::ops::DerefMut for ConnGuard {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.conn.as_mut().expect("present until drop").conn
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let conn = self.conn.take().expect("present until drop");
        if let Some(timer) = self.timer.take() {
            timer.unwatch(conn.pid);
            if timer.fired_on(conn.pid) {
                self.broken = true;
            }
        }
        if self.broken {
            self.sp.respawn();
        } else {
            self.sp.release(conn);
        }
    }
}

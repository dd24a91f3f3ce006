use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tokio::time::Instant;

/// Everything needed to cancel one pooled connection's in-flight query
/// from a separate connection.
pub(crate) struct CancelHandle {
    pub pid: i32,
    pub connect: PgConnectOptions,
}

impl CancelHandle {
    async fn cancel(self) {
        let mut conn = match PgConnection::connect_with(&self.connect).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(pid = self.pid, ?err, "failed to open a cancel connection");
                return;
            }
        };
        if let Err(err) = sqlx::query("select pg_cancel_backend($1)")
            .bind(self.pid)
            .execute(&mut conn)
            .await
        {
            tracing::warn!(pid = self.pid, ?err, "backend cancel request failed");
        }
        let _ = conn.close().await;
    }
}

pub(crate) struct TimerState {
    deadline: Option<Instant>,
    fired: AtomicBool,
    watched: Mutex<Option<CancelHandle>>,
    fired_pid: Mutex<Option<i32>>,
}

impl TimerState {
    /// Register the connection currently executing. Whichever connection
    /// is watched when the deadline fires gets cancelled.
    pub fn watch(&self, handle: CancelHandle) {
        if self.fired.load(Ordering::SeqCst) {
            // The deadline fired while no connection was watched; cancel
            // this one as soon as it starts executing.
            *self.fired_pid.lock().unwrap() = Some(handle.pid);
            tokio::spawn(handle.cancel());
            return;
        }
        *self.watched.lock().unwrap() = Some(handle);
    }

    pub fn unwatch(&self, pid: i32) {
        let mut watched = self.watched.lock().unwrap();
        if watched.as_ref().is_some_and(|h| h.pid == pid) {
            *watched = None;
        }
    }

    /// Whether the timer's firing cancelled (or will cancel) this backend.
    pub fn fired_on(&self, pid: i32) -> bool {
        *self.fired_pid.lock().unwrap() == Some(pid)
    }
}

/// One timer owns a public operation's overall deadline. It holds at most
/// one watched connection at a time; firing cancels that connection, and
/// later acquisitions fail fast on the expired deadline. Dropped on normal
/// completion, which disarms it.
pub(crate) struct OpTimer {
    state: Arc<TimerState>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl OpTimer {
    pub fn new(timeout: Option<Duration>) -> Self {
        let deadline = timeout.map(|t| Instant::now() + t);
        let state = Arc::new(TimerState {
            deadline,
            fired: AtomicBool::new(false),
            watched: Mutex::new(None),
            fired_pid: Mutex::new(None),
        });

        let task = deadline.map(|deadline| {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                state.fired.store(true, Ordering::SeqCst);
                let watched = state.watched.lock().unwrap().take();
                if let Some(handle) = watched {
                    *state.fired_pid.lock().unwrap() = Some(handle.pid);
                    tracing::warn!(
                        pid = handle.pid,
                        "operation deadline fired, cancelling the in-flight query"
                    );
                    handle.cancel().await;
                }
            })
        });

        OpTimer { state, task }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.deadline
    }

    pub fn expired(&self) -> bool {
        self.state
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub(crate) fn state(&self) -> Arc<TimerState> {
        Arc::clone(&self.state)
    }
}

impl Drop for OpTimer {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_timeout_never_expires() {
        let timer = OpTimer::new(None);
        assert!(!timer.expired());
        assert_eq!(timer.deadline(), None);
    }

    #[tokio::test]
    async fn deadline_expiry_is_observable() {
        let timer = OpTimer::new(Some(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(timer.expired());
    }
}

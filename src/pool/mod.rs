//! Connection pool
//!
//! Owns the idle set of authenticated connections and the accounting of
//! how many connections exist in total. Hands connections out as exclusive
//! single-use sessions, detects dead connections lazily at lease time, and
//! rejects callers synchronously when saturated.
//!
//! Capacity is tracked with a semaphore sized to `maximum_pool_size`: every
//! live connection holds one permit for its slot, whether idle or leased,
//! so connection-creation I/O never happens under the pool's state lock.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PoolConfig;
use crate::connection::{FtpConnection, factory};
use crate::error::PoolError;
use crate::session::Session;

struct IdleConnection {
    conn: FtpConnection,
    permit: OwnedSemaphorePermit,
    returned_at: Instant,
}

struct PoolState {
    /// FIFO idle set: oldest-returned connection is leased first.
    idle: VecDeque<IdleConnection>,
    /// Connections in existence (idle + leased) for the live generation.
    current_size: usize,
    /// Bumped by `disconnect`/`reconnect`; returns from an older
    /// generation are discarded instead of re-entering the pool.
    generation: u64,
    /// Canonical working directory, resolved from the first connection.
    base_dir: Option<String>,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    capacity: Arc<Semaphore>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

/// A bounded pool of authenticated FTP connections. Cloning yields another
/// handle to the same pool.
///
/// `open_session` never blocks waiting for capacity: when the idle set is
/// empty and the pool is at `maximum_pool_size`, it fails immediately with
/// [`PoolError::PoolExhausted`]. Retry and backoff are the caller's job.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Builds a pool around the given configuration. No I/O happens until
    /// `initialize` or the first `open_session`.
    pub fn new(config: PoolConfig) -> Self {
        let capacity = Arc::new(Semaphore::new(config.maximum_pool_size));
        Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    current_size: 0,
                    generation: 0,
                    base_dir: None,
                }),
                capacity,
                keep_alive: Mutex::new(None),
            }),
        }
    }

    /// Eagerly creates `minimum_pool_size` connections, each positioned at
    /// the base storage directory, and starts the idle keep-alive task.
    ///
    /// Fails on the first connection that cannot be created; connections
    /// already created by the same call stay in the pool and are not
    /// retried or torn down.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        self.build_minimum().await?;
        self.spawn_keep_alive();
        info!(
            "Connection pool initialized: {} idle, maximum {}",
            self.idle_connections(),
            self.inner.config.maximum_pool_size
        );
        Ok(())
    }

    /// Leases a connection as a new exclusive [`Session`].
    ///
    /// Reuses the oldest idle connection when one exists, replacing it
    /// transparently if the lease-time liveness probe finds it dead.
    /// Otherwise creates a new connection if the pool is below maximum,
    /// or fails immediately with `PoolExhausted`.
    pub async fn open_session(&self) -> Result<Session, PoolError> {
        let (reused, generation) = {
            let mut state = self.inner.state.lock().unwrap();
            let entry = state.idle.pop_front();
            (entry, state.generation)
        };

        if let Some(entry) = reused {
            let IdleConnection {
                mut conn, permit, ..
            } = entry;

            if conn.is_alive().await {
                let base_dir = self.resolve_base_dir(&conn, generation);
                if conn.current_dir() != base_dir {
                    debug!("Repositioning reused connection back to {}", base_dir);
                    if let Err(e) = conn.cwd(&base_dir).await {
                        conn.close().await;
                        self.release_slot();
                        return Err(e);
                    }
                }
                return Ok(Session::new(conn, permit, self.clone(), base_dir));
            }

            // Dead connection: discard it and create a fresh one for the
            // same capacity slot.
            warn!("Idle connection found dead at lease time, replacing it");
            conn.close().await;
            match factory::create_connection(&self.inner.config, generation).await {
                Ok(fresh) => {
                    let base_dir = self.resolve_base_dir(&fresh, generation);
                    return Ok(Session::new(fresh, permit, self.clone(), base_dir));
                }
                Err(e) => {
                    // Slot is lost together with its permit.
                    self.release_slot();
                    return Err(e);
                }
            }
        }

        // Idle set empty: create a new connection if a capacity slot is
        // free, otherwise report exhaustion without blocking.
        let permit = match Arc::clone(&self.inner.capacity).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Pool exhausted: no idle connections and at maximum size");
                return Err(PoolError::PoolExhausted);
            }
        };

        let conn = factory::create_connection(&self.inner.config, generation).await?;
        let base_dir = {
            let mut state = self.inner.state.lock().unwrap();
            if state.generation == generation {
                state.current_size += 1;
                state
                    .base_dir
                    .get_or_insert_with(|| conn.current_dir().to_string())
                    .clone()
            } else {
                // The pool was reset while the connection was being
                // created. The session is still usable, but the stale
                // stamp keeps its eventual return out of the idle set,
                // and the size accounting must not count it.
                debug!("Pool reset during connection creation, session will not be pooled");
                conn.current_dir().to_string()
            }
        };
        Ok(Session::new(conn, permit, self.clone(), base_dir))
    }

    /// Returns a leased connection to the idle set. No liveness check
    /// happens here; dead connections are detected at the next lease.
    /// Connections from a stale generation (leased before a
    /// `disconnect`/`reconnect`) are dropped instead of reused.
    pub(crate) fn return_connection(&self, conn: FtpConnection, permit: OwnedSemaphorePermit) {
        let mut state = self.inner.state.lock().unwrap();
        if conn.generation() != state.generation {
            debug!(
                "Dropping returned connection from stale generation {}",
                conn.generation()
            );
            drop(state);
            drop(conn);
            drop(permit);
            return;
        }
        state.idle.push_back(IdleConnection {
            conn,
            permit,
            returned_at: Instant::now(),
        });
        debug!("Connection returned to the pool");
    }

    /// Closes every idle connection, empties the idle set, and resets the
    /// size accounting. Connections currently leased out are unaffected;
    /// their later returns are recognized as stale and discarded.
    pub async fn disconnect(&self) {
        let drained: Vec<IdleConnection> = {
            let mut state = self.inner.state.lock().unwrap();
            state.generation += 1;
            state.current_size = 0;
            state.idle.drain(..).collect()
        };
        info!("Disconnecting {} idle connections", drained.len());
        for entry in drained {
            entry.conn.close().await;
        }
    }

    /// Rebuilds at least `minimum_pool_size` connections after clearing
    /// any stale idle entries and counters, so repeated calls cannot grow
    /// the pool past `maximum_pool_size`.
    pub async fn reconnect(&self) -> Result<(), PoolError> {
        self.disconnect().await;
        self.build_minimum().await
    }

    /// Explicit lifecycle end: stops the keep-alive task and disconnects
    /// all idle connections. Invoked by the host process during its own
    /// graceful termination.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.keep_alive.lock().unwrap().take() {
            handle.abort();
        }
        self.disconnect().await;
    }

    /// Connections in existence for the live generation (idle + leased).
    pub fn active_connections(&self) -> usize {
        self.inner.state.lock().unwrap().current_size
    }

    /// Connections currently idle and available for lease.
    pub fn idle_connections(&self) -> usize {
        self.inner.state.lock().unwrap().idle.len()
    }

    /// The canonical base directory, once resolved from the first
    /// connection created.
    pub fn base_dir(&self) -> Option<String> {
        self.inner.state.lock().unwrap().base_dir.clone()
    }

    fn generation(&self) -> u64 {
        self.inner.state.lock().unwrap().generation
    }

    /// Frees a capacity slot whose connection was lost before it could be
    /// handed out.
    fn release_slot(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.current_size = state.current_size.saturating_sub(1);
    }

    /// The canonical base directory for a connection about to be leased.
    /// Only a connection from the live generation may seed the pool-wide
    /// value.
    fn resolve_base_dir(&self, conn: &FtpConnection, generation: u64) -> String {
        let mut state = self.inner.state.lock().unwrap();
        if state.generation == generation {
            state
                .base_dir
                .get_or_insert_with(|| conn.current_dir().to_string())
                .clone()
        } else {
            conn.current_dir().to_string()
        }
    }

    async fn build_minimum(&self) -> Result<(), PoolError> {
        let generation = self.generation();
        for _ in 0..self.inner.config.minimum_pool_size {
            let permit = Arc::clone(&self.inner.capacity)
                .try_acquire_owned()
                .map_err(|_| PoolError::PoolExhausted)?;
            let conn = factory::create_connection(&self.inner.config, generation).await?;

            let mut state = self.inner.state.lock().unwrap();
            if state.generation != generation {
                // The pool was reset while this connection was being
                // created; it belongs to a dead generation.
                debug!("Pool reset during eager creation, discarding connection");
                return Ok(());
            }
            if state.base_dir.is_none() {
                state.base_dir = Some(conn.current_dir().to_string());
            }
            state.current_size += 1;
            state.idle.push_back(IdleConnection {
                conn,
                permit,
                returned_at: Instant::now(),
            });
        }
        Ok(())
    }

    /// Starts the idle keep-alive task: every interval, idle connections
    /// that have sat longer than the interval get a NOOP so the server's
    /// idle timeout does not drop them. This is not a liveness check; a
    /// failed NOOP leaves the connection in place for lazy replacement at
    /// the next lease. A zero interval disables the task.
    fn spawn_keep_alive(&self) {
        let interval = self.inner.config.keep_alive_interval();
        if interval.is_zero() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                keep_alive_sweep(&inner, interval).await;
            }
        });

        let mut slot = self.inner.keep_alive.lock().unwrap();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }
}

async fn keep_alive_sweep(inner: &PoolInner, interval: Duration) {
    // Take the idle set out so the NOOPs happen outside the lock.
    let (taken, generation) = {
        let mut state = inner.state.lock().unwrap();
        let taken: Vec<IdleConnection> = state.idle.drain(..).collect();
        (taken, state.generation)
    };
    if taken.is_empty() {
        return;
    }

    let mut refreshed = Vec::with_capacity(taken.len());
    for mut entry in taken {
        if entry.returned_at.elapsed() >= interval {
            if entry.conn.is_alive().await {
                entry.returned_at = Instant::now();
            } else {
                debug!("Keep-alive NOOP failed; leaving connection for lease-time replacement");
            }
        }
        refreshed.push(entry);
    }

    {
        let mut state = inner.state.lock().unwrap();
        if state.generation == generation {
            // Connections returned during the sweep are newer; keep the
            // swept entries ahead of them to preserve FIFO order.
            for entry in refreshed.into_iter().rev() {
                state.idle.push_front(entry);
            }
            return;
        }
    }

    // The pool was reset while the sweep held the connections; they are
    // stale now and must not re-enter the idle set.
    debug!("Pool reset during keep-alive sweep, closing swept connections");
    for entry in refreshed {
        entry.conn.close().await;
    }
}

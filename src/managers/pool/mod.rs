pub mod session;

use crate::config::PoolConfig;
use crate::constants::network;
use crate::errors::GatewayError;
use crate::managers::targets::Target;
use crate::services::logger::Logger;
use dashmap::DashMap;
use serde_json::Value;
use session::{ExecOutput, RemoteSession, SessionConnector};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

struct IdleSession {
    id: String,
    session: Arc<dyn RemoteSession>,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolInner {
    target: Arc<Target>,
    config: PoolConfig,
    connector: Arc<dyn SessionConnector>,
    logger: Logger,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleSession>>,
    alive: AtomicUsize,
    borrowed: AtomicUsize,
    created_total: AtomicU64,
    destroyed_total: AtomicU64,
    draining: AtomicBool,
}

impl PoolInner {
    async fn destroy(&self, session: Arc<dyn RemoteSession>, id: &str, reason: &str) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
        self.destroyed_total.fetch_add(1, Ordering::Relaxed);
        self.logger.debug(
            "Session destroyed",
            Some(&serde_json::json!({"session": id, "reason": reason})),
        );
        session.close().await;
    }
}

/// Runs a trivial remote command and requires the random marker echoed
/// back, so a half-dead channel cannot pass as healthy.
async fn probe_session(session: &Arc<dyn RemoteSession>) -> bool {
    let marker = format!("healthcheck-{:08x}", rand::random::<u32>());
    let command = format!("echo {}", marker);
    let timeout = Duration::from_millis(network::TIMEOUT_HEALTH_PROBE_MS);
    match session.exec(&command, timeout).await {
        Ok(output) => output.exit_code == 0 && output.stdout.contains(&marker),
        Err(_) => false,
    }
}

/// Exclusive loan of one session. Either hand it back through
/// `SessionPool::release`/`discard`, or let it drop: a dropped lease
/// destroys its session rather than risking a dirty return to the pool.
pub struct SessionLease {
    pub session_id: String,
    pub target_id: String,
    /// True when the session came from the idle set rather than a fresh
    /// handshake; the orchestrator's single-retry policy keys off this.
    pub from_idle: bool,
    session: Option<Arc<dyn RemoteSession>>,
    created_at: Instant,
    _permit: Option<OwnedSemaphorePermit>,
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .field("target_id", &self.target_id)
            .field("from_idle", &self.from_idle)
            .field("active", &self.session.is_some())
            .finish()
    }
}

impl SessionLease {
    pub async fn exec(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, GatewayError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| GatewayError::internal("Session lease already consumed"))?;
        session.exec(command, timeout).await
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.inner.borrowed.fetch_sub(1, Ordering::SeqCst);
            self.inner.alive.fetch_sub(1, Ordering::SeqCst);
            self.inner.destroyed_total.fetch_add(1, Ordering::Relaxed);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { session.close().await });
            }
        }
    }
}

/// Bounded set of live sessions for one target. Capacity is guarded by a
/// FIFO semaphore so concurrent acquirers are served in arrival order;
/// sessions are validated on borrow and on return.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(
        logger: Logger,
        target: Arc<Target>,
        config: PoolConfig,
        connector: Arc<dyn SessionConnector>,
    ) -> Self {
        let max = config.max_sessions;
        let logger = logger.child(&format!("pool:{}", target.id));
        Self {
            inner: Arc::new(PoolInner {
                target,
                config,
                connector,
                logger,
                semaphore: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(VecDeque::new()),
                alive: AtomicUsize::new(0),
                borrowed: AtomicUsize::new(0),
                created_total: AtomicU64::new(0),
                destroyed_total: AtomicU64::new(0),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn target_id(&self) -> &str {
        &self.inner.target.id
    }

    pub async fn acquire(&self) -> Result<SessionLease, GatewayError> {
        let inner = &self.inner;
        if inner.draining.load(Ordering::SeqCst) {
            return Err(GatewayError::pool(
                "POOL_DRAINING",
                format!("Pool for target {} is shutting down", inner.target.id),
            ));
        }

        let deadline = Instant::now() + inner.config.acquire_timeout;
        let permit = match tokio::time::timeout(
            inner.config.acquire_timeout,
            inner.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Err(_) => {
                return Err(GatewayError::acquire_timeout(format!(
                    "Pool for target {} is exhausted, no session freed within {} ms",
                    inner.target.id,
                    inner.config.acquire_timeout.as_millis()
                ))
                .with_details(serde_json::json!({
                    "max_sessions": inner.config.max_sessions,
                    "borrowed": inner.borrowed.load(Ordering::SeqCst),
                })))
            }
            Ok(Err(_)) => {
                return Err(GatewayError::pool(
                    "POOL_DRAINING",
                    format!("Pool for target {} is shutting down", inner.target.id),
                ))
            }
            Ok(Ok(permit)) => permit,
        };

        loop {
            let idle_entry = inner.idle.lock().await.pop_front();
            if let Some(entry) = idle_entry {
                if probe_session(&entry.session).await {
                    inner.borrowed.fetch_add(1, Ordering::SeqCst);
                    return Ok(SessionLease {
                        session_id: entry.id,
                        target_id: inner.target.id.clone(),
                        from_idle: true,
                        session: Some(entry.session),
                        created_at: entry.created_at,
                        _permit: Some(permit),
                        inner: inner.clone(),
                    });
                }
                inner
                    .destroy(entry.session, &entry.id, "borrow probe failed")
                    .await;
                continue;
            }

            // The sweep may hold idle sessions outside the deque for
            // probing; wait for capacity instead of over-creating.
            if inner.alive.load(Ordering::SeqCst) >= inner.config.max_sessions {
                if Instant::now() >= deadline {
                    return Err(GatewayError::acquire_timeout(format!(
                        "Pool for target {} is exhausted, no session freed within {} ms",
                        inner.target.id,
                        inner.config.acquire_timeout.as_millis()
                    )));
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
                continue;
            }

            inner.alive.fetch_add(1, Ordering::SeqCst);
            match inner.connector.connect(&inner.target).await {
                Ok(session) => {
                    let id = format!("session-{}", uuid::Uuid::new_v4());
                    inner.created_total.fetch_add(1, Ordering::Relaxed);
                    inner.borrowed.fetch_add(1, Ordering::SeqCst);
                    inner.logger.debug(
                        "Session created",
                        Some(&serde_json::json!({"session": id})),
                    );
                    return Ok(SessionLease {
                        session_id: id,
                        target_id: inner.target.id.clone(),
                        from_idle: false,
                        session: Some(session),
                        created_at: Instant::now(),
                        _permit: Some(permit),
                        inner: inner.clone(),
                    });
                }
                Err(err) => {
                    inner.alive.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    /// Test-on-return: the session goes back to the idle set only after a
    /// passing probe; a failed probe destroys it without an eager
    /// replacement (the next acquire creates one lazily).
    pub async fn release(&self, mut lease: SessionLease) {
        let Some(session) = lease.session.take() else {
            return;
        };
        let inner = &self.inner;
        inner.borrowed.fetch_sub(1, Ordering::SeqCst);
        if inner.draining.load(Ordering::SeqCst) {
            inner
                .destroy(session, &lease.session_id, "released while draining")
                .await;
            return;
        }
        if probe_session(&session).await {
            inner.idle.lock().await.push_back(IdleSession {
                id: lease.session_id.clone(),
                session,
                created_at: lease.created_at,
                idle_since: Instant::now(),
            });
        } else {
            inner.logger.warn(
                "Session failed return probe",
                Some(&serde_json::json!({"session": lease.session_id})),
            );
            inner
                .destroy(session, &lease.session_id, "return probe failed")
                .await;
        }
    }

    /// Destroys the session unconditionally. Used after execution failures
    /// where the channel can no longer be trusted.
    pub async fn discard(&self, mut lease: SessionLease) {
        let Some(session) = lease.session.take() else {
            return;
        };
        self.inner.borrowed.fetch_sub(1, Ordering::SeqCst);
        self.inner
            .destroy(session, &lease.session_id, "discarded by caller")
            .await;
    }

    /// Destroys idle sessions that sat past the idle timeout or fail a
    /// probe, then lazily tops the pool back up to the advisory minimum.
    /// Runs on the health-check interval.
    pub async fn sweep(&self) {
        let inner = &self.inner;
        if inner.draining.load(Ordering::SeqCst) {
            return;
        }
        let taken: Vec<IdleSession> = {
            let mut idle = inner.idle.lock().await;
            idle.drain(..).collect()
        };
        let mut healthy = Vec::new();
        for entry in taken {
            if entry.idle_since.elapsed() >= inner.config.idle_timeout {
                inner
                    .destroy(entry.session, &entry.id, "idle timeout")
                    .await;
                continue;
            }
            if probe_session(&entry.session).await {
                healthy.push(entry);
            } else {
                inner
                    .destroy(entry.session, &entry.id, "sweep probe failed")
                    .await;
            }
        }
        {
            let mut idle = inner.idle.lock().await;
            for entry in healthy {
                idle.push_back(entry);
            }
        }

        let min = inner.config.min_sessions.min(inner.config.max_sessions);
        while inner.alive.load(Ordering::SeqCst) < min {
            inner.alive.fetch_add(1, Ordering::SeqCst);
            match inner.connector.connect(&inner.target).await {
                Ok(session) => {
                    let id = format!("session-{}", uuid::Uuid::new_v4());
                    inner.created_total.fetch_add(1, Ordering::Relaxed);
                    inner.logger.debug(
                        "Session created for min refill",
                        Some(&serde_json::json!({"session": id})),
                    );
                    inner.idle.lock().await.push_back(IdleSession {
                        id,
                        session,
                        created_at: Instant::now(),
                        idle_since: Instant::now(),
                    });
                }
                Err(err) => {
                    inner.alive.fetch_sub(1, Ordering::SeqCst);
                    inner.logger.warn(
                        "Min refill connect failed",
                        Some(&serde_json::json!({"error": err.message})),
                    );
                    break;
                }
            }
        }
    }

    /// Stops new acquisitions, waits (bounded) for borrowed sessions to come
    /// home, then destroys every idle session. Borrowed sessions that
    /// outlive the wait are destroyed on their eventual release.
    pub async fn drain(&self) {
        let inner = &self.inner;
        inner.draining.store(true, Ordering::SeqCst);
        inner.semaphore.close();

        let deadline = Instant::now() + inner.config.drain_timeout;
        while inner.borrowed.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let still_borrowed = inner.borrowed.load(Ordering::SeqCst);
        if still_borrowed > 0 {
            inner.logger.warn(
                "Draining with sessions still borrowed",
                Some(&serde_json::json!({"borrowed": still_borrowed})),
            );
        }

        let drained: Vec<IdleSession> = {
            let mut idle = inner.idle.lock().await;
            idle.drain(..).collect()
        };
        for entry in drained {
            inner.destroy(entry.session, &entry.id, "pool drained").await;
        }
        inner.logger.info("Pool drained", None);
    }

    pub fn available(&self) -> usize {
        self.inner
            .alive
            .load(Ordering::SeqCst)
            .saturating_sub(self.inner.borrowed.load(Ordering::SeqCst))
    }

    pub fn borrowed(&self) -> usize {
        self.inner.borrowed.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> Value {
        let inner = &self.inner;
        serde_json::json!({
            "target": inner.target.id,
            "available": inner.idle.lock().await.len(),
            "borrowed": inner.borrowed.load(Ordering::SeqCst),
            "max_sessions": inner.config.max_sessions,
            "created_total": inner.created_total.load(Ordering::Relaxed),
            "destroyed_total": inner.destroyed_total.load(Ordering::Relaxed),
            "draining": inner.draining.load(Ordering::SeqCst),
        })
    }
}

struct PoolEntry {
    pool: SessionPool,
    sweeper: tokio::task::JoinHandle<()>,
}

/// Owns exactly one pool per registered target and the sweep task that
/// keeps each pool's idle set healthy.
pub struct PoolManager {
    logger: Logger,
    config: PoolConfig,
    connector: Arc<dyn SessionConnector>,
    pools: DashMap<String, PoolEntry>,
}

impl PoolManager {
    pub fn new(logger: Logger, config: PoolConfig, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            logger: logger.child("pools"),
            config,
            connector,
            pools: DashMap::new(),
        }
    }

    pub fn register(&self, target: Arc<Target>) -> Result<(), GatewayError> {
        let entry = self.pools.entry(target.id.clone());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(GatewayError::internal(format!(
                "Pool for target {} already exists",
                target.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let pool = SessionPool::new(
                    self.logger.clone(),
                    target,
                    self.config.clone(),
                    self.connector.clone(),
                );
                let sweep_pool = pool.clone();
                let interval = self.config.health_check_interval;
                let sweeper = tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        sweep_pool.sweep().await;
                    }
                });
                slot.insert(PoolEntry { pool, sweeper });
                Ok(())
            }
        }
    }

    pub fn get(&self, target_id: &str) -> Result<SessionPool, GatewayError> {
        self.pools
            .get(target_id)
            .map(|entry| entry.pool.clone())
            .ok_or_else(|| {
                GatewayError::pool(
                    "UNKNOWN_TARGET",
                    format!("No pool exists for target {}", target_id),
                )
            })
    }

    pub async fn remove(&self, target_id: &str) -> bool {
        let Some((_, entry)) = self.pools.remove(target_id) else {
            return false;
        };
        entry.sweeper.abort();
        entry.pool.drain().await;
        true
    }

    pub async fn shutdown(&self) {
        let target_ids: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        futures::future::join_all(target_ids.iter().map(|target_id| self.remove(target_id)))
            .await;
    }

    pub async fn stats(&self) -> Value {
        let pools: Vec<SessionPool> = self.pools.iter().map(|e| e.pool.clone()).collect();
        let stats = futures::future::join_all(pools.iter().map(|pool| pool.stats())).await;
        Value::Array(stats)
    }
}

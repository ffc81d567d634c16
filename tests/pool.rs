mod common;

use common::{sample_target, test_pool_config, MockConnector, MockNet};
use sshgate::managers::pool::session::SessionConnector;
use sshgate::managers::pool::{PoolManager, SessionPool};
use sshgate::services::logger::Logger;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

fn build_pool(max_sessions: usize, acquire_timeout: Duration) -> (SessionPool, Arc<MockNet>) {
    let net = Arc::new(MockNet::default());
    let connector: Arc<dyn SessionConnector> = Arc::new(MockConnector { net: net.clone() });
    let pool = SessionPool::new(
        Logger::new("test"),
        Arc::new(sample_target("t1")),
        test_pool_config(max_sessions, acquire_timeout),
        connector,
    );
    (pool, net)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_count_never_exceeds_max() {
    let (pool, net) = build_pool(3, Duration::from_secs(5));
    net.exec_delay_ms.store(30, Ordering::SeqCst);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let lease = pool.acquire().await.expect("acquire");
            let out = lease
                .exec("uptime", Duration::from_secs(5))
                .await
                .expect("exec");
            assert_eq!(out.exit_code, 0);
            pool.release(lease).await;
        }));
    }
    for handle in handles {
        handle.await.expect("task");
    }

    assert!(net.max_live.load(Ordering::SeqCst) <= 3);
    assert_eq!(pool.borrowed(), 0);
}

#[tokio::test]
async fn released_sessions_are_reused() {
    let (pool, net) = build_pool(2, Duration::from_secs(1));

    let lease = pool.acquire().await.expect("first acquire");
    pool.release(lease).await;
    let lease = pool.acquire().await.expect("second acquire");
    assert!(lease.from_idle);
    pool.release(lease).await;

    assert_eq!(net.connect_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_return_probe_destroys_the_session() {
    let (pool, net) = build_pool(2, Duration::from_secs(1));

    let lease = pool.acquire().await.expect("acquire");
    net.poison_all_sessions();
    pool.release(lease).await;
    assert_eq!(net.live.load(Ordering::SeqCst), 0);

    // The poisoned session must never come back; the next acquire builds a
    // fresh one.
    let lease = pool.acquire().await.expect("fresh acquire");
    assert!(!lease.from_idle);
    assert_eq!(net.connect_count.load(Ordering::SeqCst), 2);
    pool.release(lease).await;
}

#[tokio::test]
async fn failed_borrow_probe_falls_through_to_a_fresh_session() {
    let (pool, net) = build_pool(2, Duration::from_secs(1));

    let lease = pool.acquire().await.expect("acquire");
    let session_id = lease.session_id.clone();
    pool.release(lease).await;
    net.poison_all_sessions();

    let lease = pool.acquire().await.expect("acquire after poison");
    assert_ne!(lease.session_id, session_id);
    assert!(!lease.from_idle);
    assert_eq!(net.connect_count.load(Ordering::SeqCst), 2);
    pool.release(lease).await;
}

#[tokio::test]
async fn acquire_times_out_when_exhausted() {
    let (pool, _net) = build_pool(1, Duration::from_millis(80));

    let held = pool.acquire().await.expect("hold the only session");
    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err.code, "ACQUIRE_TIMEOUT");

    pool.release(held).await;
    let lease = pool.acquire().await.expect("after release");
    pool.release(lease).await;
}

#[tokio::test]
async fn handshake_failure_surfaces_without_retry() {
    let (pool, net) = build_pool(2, Duration::from_millis(200));
    net.fail_connect.store(true, Ordering::SeqCst);

    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err.code, "CONNECTION_FAILED");
    assert_eq!(net.connect_count.load(Ordering::SeqCst), 0);
    assert_eq!(pool.borrowed(), 0);
}

#[tokio::test]
async fn sweep_evicts_sessions_past_idle_timeout() {
    let net = Arc::new(MockNet::default());
    let connector: Arc<dyn SessionConnector> = Arc::new(MockConnector { net: net.clone() });
    let mut config = test_pool_config(2, Duration::from_secs(1));
    config.idle_timeout = Duration::from_millis(20);
    let pool = SessionPool::new(
        Logger::new("test"),
        Arc::new(sample_target("t1")),
        config,
        connector,
    );

    let lease = pool.acquire().await.expect("acquire");
    pool.release(lease).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.sweep().await;

    assert_eq!(net.live.load(Ordering::SeqCst), 0);
    let stats = pool.stats().await;
    assert_eq!(stats["available"], 0);
}

#[tokio::test]
async fn sweep_tops_the_pool_up_to_the_advisory_minimum() {
    let net = Arc::new(MockNet::default());
    let connector: Arc<dyn SessionConnector> = Arc::new(MockConnector { net: net.clone() });
    let mut config = test_pool_config(4, Duration::from_secs(1));
    config.min_sessions = 2;
    let pool = SessionPool::new(
        Logger::new("test"),
        Arc::new(sample_target("t1")),
        config,
        connector,
    );

    pool.sweep().await;
    assert_eq!(net.connect_count.load(Ordering::SeqCst), 2);
    let stats = pool.stats().await;
    assert_eq!(stats["available"], 2);

    // Refilled sessions come straight off the idle set.
    let lease = pool.acquire().await.expect("acquire");
    assert!(lease.from_idle);
    pool.release(lease).await;
}

#[tokio::test]
async fn drain_refuses_new_acquires_and_destroys_idle_sessions() {
    let (pool, net) = build_pool(2, Duration::from_millis(200));

    let lease = pool.acquire().await.expect("acquire");
    pool.release(lease).await;
    pool.drain().await;

    assert_eq!(net.live.load(Ordering::SeqCst), 0);
    let err = pool.acquire().await.unwrap_err();
    assert_eq!(err.code, "POOL_DRAINING");
}

#[tokio::test]
async fn manager_keeps_one_pool_per_target_and_tears_down_on_remove() {
    let net = Arc::new(MockNet::default());
    let connector: Arc<dyn SessionConnector> = Arc::new(MockConnector { net: net.clone() });
    let manager = PoolManager::new(
        Logger::new("test"),
        test_pool_config(2, Duration::from_secs(1)),
        connector,
    );

    let target = Arc::new(sample_target("t1"));
    manager.register(target.clone()).expect("register");
    assert!(manager.register(target).is_err());

    let pool = manager.get("t1").expect("pool");
    let lease = pool.acquire().await.expect("acquire");
    pool.release(lease).await;

    assert!(manager.remove("t1").await);
    assert_eq!(net.live.load(Ordering::SeqCst), 0);
    assert!(manager.get("t1").is_err());
}

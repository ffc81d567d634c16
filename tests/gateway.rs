mod common;

use common::{build_gateway, sample_target, test_pool_config, VALID_TOKEN};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::time::Duration;

const DF_OUTPUT: &str = "Filesystem      Size  Used Avail Use% Mounted on\n\
/dev/sda1        40G   12G   26G  32% /\ntmpfs           3.9G     0  3.9G   0% /dev/shm\n";

#[tokio::test]
async fn execute_runs_a_vetted_operation_end_to_end() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(2)));
    harness.net.respond(
        "df -h",
        &format!("{}backup job: password=hunter2\n", DF_OUTPUT),
        0,
    );
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");

    let result = harness
        .gateway
        .execute("t1", "disk_usage", &[], VALID_TOKEN)
        .await
        .expect("execute");

    assert_eq!(result.exit_code, 0);
    assert!(result.sanitized);
    assert!(result.stdout.contains("Filesystem"));
    assert!(result.stdout.contains("/dev/sda1"));
    assert!(!result.stdout.contains("password=hunter2"));
    assert!(result.stdout.contains("password=***REDACTED***"));
}

#[tokio::test]
async fn injection_attempt_is_rejected_before_any_session_exists() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(2)));
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");

    let err = harness
        .gateway
        .execute(
            "t1",
            "disk_usage",
            &[Value::from("; cat /etc/shadow")],
            VALID_TOKEN,
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, "SECURITY_VIOLATION");
    // Validation happens before acquisition: the pool never opened a
    // connection for the rejected request.
    assert_eq!(harness.net.connect_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_operation_is_a_critical_security_failure() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(2)));
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");

    let err = harness
        .gateway
        .execute("t1", "nonexistent_op", &[], VALID_TOKEN)
        .await
        .unwrap_err();

    assert_eq!(err.code, "UNKNOWN_OPERATION");
    assert_eq!(err.severity, Some(sshgate::errors::Severity::Critical));
    assert_eq!(harness.net.connect_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn inactive_token_is_rejected_at_the_front_door() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(2)));
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");

    let err = harness
        .gateway
        .execute("t1", "disk_usage", &[], "revoked-token")
        .await
        .unwrap_err();

    assert_eq!(err.code, "AUTHENTICATION_FAILED");
    assert_eq!(harness.net.connect_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_pooled_session_gets_exactly_one_retry() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(2)));
    harness.net.respond("uptime", "up 12 days\n", 0);
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");

    harness
        .gateway
        .execute("t1", "uptime", &[], VALID_TOKEN)
        .await
        .expect("warm the pool");
    assert_eq!(harness.net.connect_count.load(Ordering::SeqCst), 1);

    // The pooled session passes its borrow probe but dies on the real
    // command; the gateway must reconnect once and succeed.
    harness.net.fail_next_command.store(true, Ordering::SeqCst);
    let result = harness
        .gateway
        .execute("t1", "uptime", &[], VALID_TOKEN)
        .await
        .expect("retried execute");

    assert_eq!(result.exit_code, 0);
    assert!(result.stdout.contains("up 12 days"));
    assert_eq!(harness.net.connect_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn fresh_session_failure_is_not_retried() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(2)));
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");

    harness.net.fail_next_command.store(true, Ordering::SeqCst);
    let err = harness
        .gateway
        .execute("t1", "uptime", &[], VALID_TOKEN)
        .await
        .unwrap_err();

    assert_eq!(err.code, "EXECUTION_FAILED");
    assert_eq!(harness.net.connect_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn per_target_operation_override_is_enforced() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(2)));
    let mut target = sample_target("t1");
    target.allowed_operations = Some(vec!["uptime".to_string()]);
    harness.gateway.register_target(target).expect("register");

    let err = harness
        .gateway
        .execute("t1", "disk_usage", &[], VALID_TOKEN)
        .await
        .unwrap_err();
    assert_eq!(err.code, "AUTHORIZATION_DENIED");

    harness
        .gateway
        .execute("t1", "uptime", &[], VALID_TOKEN)
        .await
        .expect("allowed operation");
}

#[tokio::test]
async fn removed_target_stops_accepting_executions() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(2)));
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");
    harness
        .gateway
        .execute("t1", "uptime", &[], VALID_TOKEN)
        .await
        .expect("before removal");

    harness.gateway.remove_target("t1").await.expect("remove");
    assert_eq!(harness.net.live.load(Ordering::SeqCst), 0);

    let err = harness
        .gateway
        .execute("t1", "uptime", &[], VALID_TOKEN)
        .await
        .unwrap_err();
    assert_eq!(err.code, "UNKNOWN_TARGET");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_load_is_capped_at_pool_max() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(5)));
    harness.net.exec_delay_ms.store(100, Ordering::SeqCst);
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");

    let gateway = std::sync::Arc::new(harness.gateway);
    let mut handles = Vec::new();
    for _ in 0..10 {
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            gateway.execute("t1", "uptime", &[], VALID_TOKEN).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("execute");
    }

    // Exactly max sessions ran concurrently; the rest completed after a
    // session freed up, none timed out.
    assert_eq!(harness.net.max_exec_in_flight.load(Ordering::SeqCst), 5);
    assert!(harness.net.max_live.load(Ordering::SeqCst) <= 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_pool_times_out_the_latecomer() {
    let harness = build_gateway(test_pool_config(1, Duration::from_millis(100)));
    harness.net.exec_delay_ms.store(500, Ordering::SeqCst);
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");

    let gateway = std::sync::Arc::new(harness.gateway);
    let slow = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.execute("t1", "uptime", &[], VALID_TOKEN).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = gateway
        .execute("t1", "uptime", &[], VALID_TOKEN)
        .await
        .unwrap_err();
    assert_eq!(err.code, "ACQUIRE_TIMEOUT");

    slow.await.expect("join").expect("slow execute");
}

#[tokio::test]
async fn status_reports_pool_and_cache_state() {
    let harness = build_gateway(test_pool_config(5, Duration::from_secs(2)));
    harness
        .gateway
        .register_target(sample_target("t1"))
        .expect("register");
    harness
        .gateway
        .execute("t1", "uptime", &[], VALID_TOKEN)
        .await
        .expect("execute");

    let status = harness.gateway.status().await;
    assert_eq!(status["targets"], 1);
    assert_eq!(status["pools"][0]["target"], "t1");
    assert_eq!(status["pools"][0]["borrowed"], 0);
    assert!(status["cache"]["local_hits"].is_number());
}

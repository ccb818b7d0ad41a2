//! End-to-end runtime scenarios: boot viability, emergency bypass,
//! restart budget exhaustion, and algedonic-forced shutdown.

use std::time::Duration;
use vsm::config::VsmConfig;
use vsm::core::topics;
use vsm::subsystems::ControlMode;
use vsm::supervisor::{Runtime, SupervisorError};

fn test_config() -> VsmConfig {
    let mut config = VsmConfig::default();
    config.node_id = Some("test-node".to_string());
    config
}

#[tokio::test]
async fn test_boot_reaches_viability_and_shuts_down_cleanly() {
    let runtime = Runtime::build(test_config()).unwrap();
    let mut viable = runtime.bus.subscribe(topics::VSM_VIABLE).unwrap();
    let mut health = runtime.bus.subscribe(topics::S1_HEALTH).unwrap();

    let (supervisor, handle) = runtime.supervisor();
    let supervise = tokio::spawn(supervisor.supervise());

    let event = tokio::time::timeout(Duration::from_secs(5), viable.recv())
        .await
        .expect("vsm_viable within boot window")
        .unwrap();
    let subsystems = event.data["subsystems"].as_array().unwrap();
    assert_eq!(subsystems.len(), 7);

    // Health ticks flow once the tree is up
    let report = tokio::time::timeout(Duration::from_secs(3), health.recv())
        .await
        .expect("s1_health within a tick")
        .unwrap();
    assert!(report.data["health"].as_f64().unwrap() > 0.0);

    handle.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), supervise)
        .await
        .expect("supervisor exits after shutdown")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_emergency_scream_bypasses_hierarchy_and_stops_s1() {
    let runtime = Runtime::build(test_config()).unwrap();
    let mut emergency = runtime.bus.subscribe(topics::EMERGENCY_ALGEDONIC).unwrap();
    let mut override_line = runtime.bus.subscribe(topics::S5_EMERGENCY_OVERRIDE).unwrap();
    let mut broadcast = runtime.bus.subscribe(topics::ALL_SUBSYSTEMS).unwrap();

    let (supervisor, handle) = runtime.supervisor();
    let supervise = tokio::spawn(supervisor.supervise());
    tokio::time::sleep(Duration::from_millis(300)).await;

    runtime.algedonic.emergency_scream("s3", "control loop wedged");

    // The scream lands on all three channels within the bound
    let signal = tokio::time::timeout(Duration::from_millis(100), emergency.recv())
        .await
        .expect("emergency_algedonic within 100 ms")
        .unwrap();
    assert_eq!(signal.data["intensity"].as_f64().unwrap(), 1.0);
    assert!(override_line.recv().await.is_some());
    let mode = broadcast.recv().await.unwrap();
    assert_eq!(mode.data["emergency_mode"], true);

    // S1 reacts to the broadcast by stopping its units
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(runtime.s1.mode(), ControlMode::EmergencyStop);

    handle.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), supervise).await;
}

#[tokio::test]
async fn test_restart_budget_exhaustion_is_a_viability_failure() {
    let mut config = test_config();
    config.vsm.max_restarts = 3;
    let runtime = Runtime::build(config).unwrap();
    let mut failure = runtime.bus.subscribe(topics::VSM_FAILURE).unwrap();
    let mut emergency = runtime.bus.subscribe(topics::EMERGENCY_ALGEDONIC).unwrap();

    let (supervisor, handle) = runtime.supervisor();
    let supervise = tokio::spawn(supervisor.supervise());
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Repeated kills of one child: one-for-one restarts until the budget
    // is spent, then the supervisor gives up
    for _ in 0..3 {
        handle.kill("s3").await;
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    let result = tokio::time::timeout(Duration::from_secs(5), supervise)
        .await
        .expect("supervisor exits after budget exhaustion")
        .unwrap();
    assert!(matches!(result, Err(SupervisorError::Viability(_))));

    assert!(failure.try_recv().is_some(), "vsm_failure must be published");

    // Exactly one supervisor scream
    let mut supervisor_screams = 0;
    while let Some(event) = emergency.try_recv() {
        if event.data["source"] == "vsm_supervisor" {
            supervisor_screams += 1;
        }
    }
    assert_eq!(supervisor_screams, 1);
}

#[tokio::test]
async fn test_single_kill_restarts_only_that_child() {
    let runtime = Runtime::build(test_config()).unwrap();
    let mut health = runtime.bus.subscribe(topics::S3_HEALTH).unwrap();

    let (supervisor, handle) = runtime.supervisor();
    let supervise = tokio::spawn(supervisor.supervise());
    tokio::time::sleep(Duration::from_millis(300)).await;

    handle.kill("s3").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // S3 is back and reporting health after the restart
    while health.try_recv().is_some() {}
    let report = tokio::time::timeout(Duration::from_secs(3), health.recv())
        .await
        .expect("s3 health after restart")
        .unwrap();
    assert!(report.data["health"].as_f64().unwrap() > 0.0);

    handle.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), supervise)
        .await
        .expect("clean exit")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_algedonic_overload_forces_system_shutdown() {
    let runtime = Runtime::build(test_config()).unwrap();
    let mut shutdown_events = runtime.bus.subscribe(topics::VSM_SHUTDOWN).unwrap();

    let (supervisor, handle) = runtime.supervisor();
    let supervise = tokio::spawn(supervisor.supervise());
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Three distinct critical screams within the minute
    runtime.algedonic.emergency_scream("s1", "backlog exploding");
    runtime.algedonic.emergency_scream("s2", "oscillation storm");
    runtime.algedonic.emergency_scream("s3", "pools exhausted");

    let result = tokio::time::timeout(Duration::from_secs(5), supervise)
        .await
        .expect("supervisor exits on algedonic overload")
        .unwrap();
    match result {
        Err(SupervisorError::Viability(reason)) => {
            assert_eq!(reason, "algedonic_overload");
        }
        other => panic!("expected viability failure, got {:?}", other),
    }
    assert!(shutdown_events.try_recv().is_some());
    drop(handle);
}

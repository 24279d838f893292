use crate::integration::infrastructure::{free_port, http_get, port_is_open, LogCapture, StagehandBinary};
use eyre::Result;
use stagehand::{
    Endpoint, HarnessConfig, HarnessError, ProcessSupervisor, ReadinessPolicy, ServiceConfig,
    Severity, StartOutcome,
};
use std::time::Duration;

fn quick() -> ReadinessPolicy {
    ReadinessPolicy {
        retries: 200,
        backoff_millis: 25,
    }
}

/// Name of a non-empty variable the test process inherited from cargo.
///
/// Empty values are skipped: the shell expansions below cannot tell an
/// empty variable from an unset one.
fn inherited_variable() -> Option<String> {
    std::env::vars()
        .find(|(key, value)| key.starts_with("CARGO_PKG") && !value.is_empty())
        .map(|(key, _)| key)
}

/// Runs `stagehand origin` as an external executable and drives it through
/// a full start / request / stop cycle.
#[tokio::test]
async fn test_external_origin_lifecycle() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let binary = StagehandBinary::new()?;
    let port = free_port();
    let origin_config = binary.write_config(
        "origin.json",
        &format!(
            r#"{{ "servers": {{ "edge": {{
                "type": "mock origin",
                "actions": {{ "GET": {{ "/ping": {{ "num_chunks": 2, "chunk_size_bytes": 3, "chunk_byte_value": 112 }} }} }},
                "endpoints": {{ "http": {{ "hostname": "127.0.0.1", "port": {port} }} }}
            }} }} }}"#
        ),
    )?;

    let config = HarnessConfig::default().with_readiness(quick()).with_service(
        "edge",
        ServiceConfig::executable(binary.path())
            .with_flag("origin")
            .with_flag(origin_config.display().to_string())
            .with_flag("edge")
            .with_env("RUST_LOG", "info")
            .with_endpoint("http", Endpoint::http("127.0.0.1", port)),
    );
    let logs = LogCapture::new();
    let mut supervisor = ProcessSupervisor::new(config)?.with_log(logs.sink());

    assert!(matches!(supervisor.start().await?, StartOutcome::Ready));
    assert_eq!(supervisor.running(), vec!["edge"]);
    assert!(supervisor.process("edge").is_some());

    let response = http_get("127.0.0.1", port, "GET", "/ping").await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"pppppp");

    supervisor.stop().await?;
    assert!(supervisor.running().is_empty());
    assert!(!port_is_open(port).await);
    assert!(supervisor.fault().is_none());
    assert!(logs.find("Spawn edge:").is_some());
    Ok(())
}

#[tokio::test]
async fn test_executable_environment_is_replaced() -> Result<()> {
    let key = inherited_variable().expect("cargo exports CARGO_PKG_NAME");

    let script = format!("echo marker=$MARKER inherited=${{{key}:-unset}}");
    let config = HarnessConfig::default().with_service(
        "isolated",
        ServiceConfig::executable("/bin/sh")
            .with_arg("-c", script.as_str())
            .with_env("MARKER", "set"),
    );
    let logs = LogCapture::new();
    let mut supervisor = ProcessSupervisor::new(config)?.with_log(logs.sink());
    supervisor.start().await?;

    let (severity, line) = logs
        .wait_for("isolated: marker=", Duration::from_secs(5))
        .await
        .expect("output line");
    assert_eq!(severity, Severity::Debug);
    assert_eq!(line, "isolated: marker=set inherited=unset");

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_async_process_environment_is_merged() -> Result<()> {
    let key = inherited_variable().expect("cargo exports CARGO_PKG_NAME");

    let script = format!("echo marker=$MARKER inherited=${{{key}:+present}}; echo complaint >&2");
    let config = HarnessConfig::default().with_service(
        "merged",
        ServiceConfig::async_process("/bin/sh")
            .with_arg("-c", script.as_str())
            .with_env("MARKER", "set"),
    );
    let logs = LogCapture::new();
    let mut supervisor = ProcessSupervisor::new(config)?.with_log(logs.sink());
    supervisor.start().await?;

    let (_, line) = logs
        .wait_for("merged: marker=", Duration::from_secs(5))
        .await
        .expect("stdout line");
    assert_eq!(line, "merged: marker=set inherited=present");

    let (severity, _) = logs
        .wait_for("merged: complaint", Duration::from_secs(5))
        .await
        .expect("stderr line");
    assert_eq!(severity, Severity::Warn);

    // Clean exits are logged and deregistered.
    let (severity, _) = logs
        .wait_for("merged exited: code=0", Duration::from_secs(5))
        .await
        .expect("exit line");
    assert_eq!(severity, Severity::Info);
    assert!(supervisor.running().is_empty());

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_foreground_fault_after_start_is_reported_by_stop() -> Result<()> {
    let config = HarnessConfig::default().with_service(
        "doomed",
        ServiceConfig::other("sh", ["-c", "sleep 0.2; exit 5"]),
    );
    let logs = LogCapture::new();
    let mut supervisor = ProcessSupervisor::new(config)?.with_log(logs.sink());

    assert!(matches!(supervisor.start().await?, StartOutcome::Ready));
    let (severity, _) = logs
        .wait_for("doomed exited: code=5", Duration::from_secs(5))
        .await
        .expect("exit line");
    assert_eq!(severity, Severity::Error);
    assert!(supervisor.running().is_empty());

    let err = supervisor.stop().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::ProcessFault { service, .. }) if service == "doomed"
    ));
    Ok(())
}

#[tokio::test]
async fn test_sync_process_waits_for_earlier_endpoints() -> Result<()> {
    let port = free_port();
    let config = HarnessConfig::default()
        .with_readiness(quick())
        .with_service(
            "origin",
            ServiceConfig::mock_origin(Default::default())
                .with_endpoint("http", Endpoint::http("127.0.0.1", port)),
        )
        .with_service(
            "probe",
            ServiceConfig::sync_process("/bin/sh")
                .with_arg("-c", "echo probing; exit 0"),
        );
    let logs = LogCapture::new();
    let mut supervisor = ProcessSupervisor::new(config)?.with_log(logs.sink());

    match supervisor.start().await? {
        StartOutcome::Completed { service, status } => {
            assert_eq!(service, "probe");
            assert!(status.success());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(logs.find("probe: probing").is_some());

    let lines = logs.lines();
    let connected = lines
        .iter()
        .position(|(_, m)| m.contains(&format!("Connected to: 127.0.0.1:{}", port)));
    let spawned = lines.iter().position(|(_, m)| m.starts_with("Spawn probe:"));
    assert!(connected.is_some() && connected < spawned);

    supervisor.stop().await?;
    assert!(!port_is_open(port).await);
    Ok(())
}

#[tokio::test]
async fn test_drop_kills_running_processes() -> Result<()> {
    let config = HarnessConfig::default().with_service("sleeper", ServiceConfig::other("sleep", ["30"]));
    let mut supervisor = ProcessSupervisor::new(config)?;
    supervisor.start().await?;

    let pid = supervisor.process("sleeper").expect("registered").pid;
    drop(supervisor);

    let mut gone = false;
    for _ in 0..50 {
        // Signal 0 only checks for existence; a reaped or zombie-free pid is gone.
        if nix::sys::signal::kill(pid, None).is_err() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "process {} survived its supervisor", pid);
    Ok(())
}

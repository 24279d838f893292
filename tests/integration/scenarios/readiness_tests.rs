use crate::integration::infrastructure::{free_port, port_is_open, LogCapture};
use eyre::Result;
use stagehand::{
    ActionTable, Endpoint, HarnessConfig, HarnessError, Polarity, ProcessSupervisor,
    ReadinessPolicy, ServiceConfig, StartOutcome,
};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

fn policy(retries: u32, backoff_millis: u64) -> ReadinessPolicy {
    ReadinessPolicy {
        retries,
        backoff_millis,
    }
}

/// A fast endpoint must not let start return before a slow one opens.
#[tokio::test]
async fn test_start_waits_for_every_endpoint_in_order() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let fast = free_port();
    let slow = free_port();
    let open_after = Duration::from_millis(300);

    let config = HarnessConfig::default()
        .with_readiness(policy(100, 50))
        .with_service(
            "fast",
            ServiceConfig::mock_origin(ActionTable::new())
                .with_endpoint("http", Endpoint::http("127.0.0.1", fast)),
        )
        .with_service(
            "slow",
            ServiceConfig::other("sleep", ["30"])
                .with_endpoint("tcp", Endpoint::http("127.0.0.1", slow)),
        );
    let logs = LogCapture::new();
    let mut supervisor = ProcessSupervisor::new(config)?.with_log(logs.sink());

    let opener = tokio::spawn(async move {
        tokio::time::sleep(open_after).await;
        TcpListener::bind(("127.0.0.1", slow)).await
    });

    let started = Instant::now();
    assert!(matches!(supervisor.start().await?, StartOutcome::Ready));
    assert!(started.elapsed() >= open_after);
    assert!(port_is_open(fast).await);
    assert!(port_is_open(slow).await);

    let checked_fast = logs.find(&format!("Checking: 127.0.0.1:{}", fast));
    let checked_slow = logs.find(&format!("Checking: 127.0.0.1:{}", slow));
    assert!(checked_fast.is_some() && checked_slow.is_some());
    let lines = logs.lines();
    let position = |needle: &str| lines.iter().position(|(_, m)| m.contains(needle));
    assert!(
        position(&format!("Connected to: 127.0.0.1:{}", fast))
            < position(&format!("Checking: 127.0.0.1:{}", slow))
    );

    // The listener is the test's, not the service's; release it before stop.
    drop(opener.await??);
    supervisor.stop().await?;
    Ok(())
}

/// Exhausting the budget is fatal and leaves launched services registered
/// until stop, so the failure can be inspected.
#[tokio::test]
async fn test_timeout_is_loud_and_keeps_processes() -> Result<()> {
    let port = free_port();
    let config = HarnessConfig::default()
        .with_readiness(policy(3, 20))
        .with_service(
            "silent",
            ServiceConfig::other("sleep", ["30"])
                .with_endpoint("http", Endpoint::http("127.0.0.1", port)),
        );
    let mut supervisor = ProcessSupervisor::new(config)?;

    let err = supervisor.start().await.unwrap_err();
    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::ReadinessTimeout {
            port: p, polarity, ..
        }) => {
            assert_eq!(*p, port);
            assert_eq!(*polarity, Polarity::WaitForOpen);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(supervisor.running(), vec!["silent"]);

    supervisor.stop().await?;
    assert!(supervisor.running().is_empty());
    Ok(())
}

/// A port that something else keeps open makes stop time out.
#[tokio::test]
async fn test_stop_times_out_when_port_stays_open() -> Result<()> {
    let port = free_port();
    let squatter = TcpListener::bind(("127.0.0.1", port)).await?;

    let config = HarnessConfig::default()
        .with_readiness(policy(3, 20))
        .with_service(
            "squatted",
            ServiceConfig::other("sleep", ["30"])
                .with_endpoint("http", Endpoint::http("127.0.0.1", port)),
        );
    let mut supervisor = ProcessSupervisor::new(config)?;
    supervisor.start().await?;

    let err = supervisor.stop().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::ReadinessTimeout {
            polarity: Polarity::WaitForClosed,
            ..
        })
    ));
    assert!(supervisor.running().is_empty());

    drop(squatter);
    Ok(())
}

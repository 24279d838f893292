use crate::integration::infrastructure::{free_port, http_get, LogCapture};
use eyre::Result;
use stagehand::{HarnessConfig, ProcessSupervisor, StartOutcome};
use std::time::{Duration, Instant};

fn origin_config(port: u16, actions: &str) -> Result<HarnessConfig> {
    let json = format!(
        r#"{{
            "readiness": {{ "retries": 50, "backoff_millis": 20 }},
            "servers": {{
                "Mock origin": {{
                    "type": "mock origin",
                    "actions": {actions},
                    "endpoints": {{ "http": {{ "type": "http", "hostname": "localhost", "port": {port} }} }}
                }}
            }}
        }}"#
    );
    HarnessConfig::from_json_str(&json)
}

/// The canonical scenario: ten 1 KiB chunks of byte 99, and a 404 elsewhere.
#[tokio::test]
async fn test_chunked_body_is_byte_exact() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let port = free_port();
    let config = origin_config(
        port,
        r#"{ "GET": { "/foo/bar": {
                "status_code": 200, "headers": {},
                "delay_first_chunk_millis": 0, "chunk_size_bytes": 1024,
                "num_chunks": 10, "delay_between_chunk_millis": 0, "chunk_byte_value": 99 } } }"#,
    )?;
    let logs = LogCapture::new();
    let mut supervisor = ProcessSupervisor::new(config)?.with_log(logs.sink());

    assert!(matches!(supervisor.start().await?, StartOutcome::Ready));

    let response = http_get("localhost", port, "GET", "/foo/bar").await?;
    assert_eq!(response.status, 200);
    assert_eq!(response.body.len(), 10 * 1024);
    assert!(response.body.iter().all(|&b| b == 99));

    let response = http_get("localhost", port, "GET", "/other").await?;
    assert_eq!(response.status, 404);
    assert!(response.body.is_empty());

    supervisor.stop().await?;
    assert!(logs.find("Closing mock origin: Mock origin").is_some());
    Ok(())
}

#[tokio::test]
async fn test_method_and_path_must_match_exactly() -> Result<()> {
    let port = free_port();
    let config = origin_config(port, r#"{ "POST": { "/submit": { "status_code": 202 } } }"#)?;
    let mut supervisor = ProcessSupervisor::new(config)?;
    supervisor.start().await?;

    assert_eq!(http_get("127.0.0.1", port, "POST", "/submit").await?.status, 202);
    assert_eq!(http_get("127.0.0.1", port, "GET", "/submit").await?.status, 404);
    assert_eq!(http_get("127.0.0.1", port, "POST", "/submit/").await?.status, 404);
    assert_eq!(http_get("127.0.0.1", port, "POST", "/submit?x=1").await?.status, 404);

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_status_and_headers_are_configurable() -> Result<()> {
    let port = free_port();
    let config = origin_config(
        port,
        r#"{ "GET": { "/teapot": { "status_code": 418,
             "headers": { "X-Origin": "stagehand", "Cache-Control": "no-store" } } } }"#,
    )?;
    let mut supervisor = ProcessSupervisor::new(config)?;
    supervisor.start().await?;

    let response = http_get("127.0.0.1", port, "GET", "/teapot").await?;
    assert_eq!(response.status, 418);
    assert_eq!(response.header("x-origin"), Some("stagehand"));
    assert_eq!(response.header("cache-control"), Some("no-store"));
    assert_eq!(response.header("content-length"), Some("0"));
    assert!(response.body.is_empty());

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_delays_pace_the_body() -> Result<()> {
    let port = free_port();
    let config = origin_config(
        port,
        r#"{ "GET": { "/slow": { "num_chunks": 4, "chunk_size_bytes": 8,
             "delay_first_chunk_millis": 100, "delay_between_chunk_millis": 50 } } }"#,
    )?;
    let mut supervisor = ProcessSupervisor::new(config)?;
    supervisor.start().await?;

    let started = Instant::now();
    let response = http_get("127.0.0.1", port, "GET", "/slow").await?;
    let elapsed = started.elapsed();

    assert_eq!(response.body, vec![42u8; 32]);
    assert!(elapsed >= Duration::from_millis(250), "took {:?}", elapsed);

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_exchanges_interleave() -> Result<()> {
    let port = free_port();
    let config = origin_config(
        port,
        r#"{ "GET": { "/slow": { "num_chunks": 3, "chunk_size_bytes": 16,
             "delay_first_chunk_millis": 100, "delay_between_chunk_millis": 100 } } }"#,
    )?;
    let mut supervisor = ProcessSupervisor::new(config)?;
    supervisor.start().await?;

    let started = Instant::now();
    let (a, b, c) = tokio::join!(
        http_get("127.0.0.1", port, "GET", "/slow"),
        http_get("127.0.0.1", port, "GET", "/slow"),
        http_get("127.0.0.1", port, "GET", "/slow"),
    );
    let elapsed = started.elapsed();

    for response in [a?, b?, c?] {
        assert_eq!(response.body.len(), 48);
    }
    // Serialized, three 300 ms exchanges would take 900 ms.
    assert!(elapsed < Duration::from_millis(800), "took {:?}", elapsed);

    supervisor.stop().await?;
    Ok(())
}

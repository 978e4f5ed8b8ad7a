//! Pool behavior observed through the public driver surface.

use crate::harness::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use lodestone::{AccessMode, AuthToken, BoltConnection, Config, Driver, Error, SharedCollector, Value};

#[tokio::test]
async fn released_connections_are_reused_not_redialed() -> Result<()> {
    init_tracing();
    let connections = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&connections);

    let server = StubServer::start(move |mut wire, _| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            wire.handle_init().await?;
            // The same socket serves both query cycles.
            wire.serve_query(&["n"], &[vec![Value::Integer(1)]]).await?;
            wire.serve_query(&["n"], &[vec![Value::Integer(2)]]).await
        }
    })
    .await?;

    let driver = Driver::new(&server.bolt_uri(), test_config(), AuthToken::none())?;

    for expected in [1i64, 2] {
        let mut conn = driver.acquire(AccessMode::Read).await?;
        let rows = SharedCollector::new();
        conn.run("RETURN $n", Default::default(), SharedCollector::new().handler())
            .await?;
        conn.pull_all(rows.handler()).await?;
        conn.sync().await?;
        assert_eq!(rows.take().records, vec![vec![Value::Integer(expected)]]);
        drop(conn);
    }

    assert_eq!(
        connections.load(Ordering::SeqCst),
        1,
        "second acquire must reuse the idle connection"
    );
    driver.close().await;
    Ok(())
}

#[tokio::test]
async fn exhausted_pool_times_out_with_a_client_error() -> Result<()> {
    init_tracing();
    let server = StubServer::start(|mut wire, _| async move {
        wire.handle_init().await?;
        // Keep the connection parked while the test holds it.
        let _ = wire.expect(lodestone_core::message::SIG_RUN).await;
        Ok(())
    })
    .await?;

    let config = Config {
        max_connection_pool_size: 1,
        connection_acquisition_timeout_ms: 200,
        ..test_config()
    };
    let driver = Driver::new(&server.bolt_uri(), config, AuthToken::none())?;

    let held = driver.acquire(AccessMode::Read).await?;
    let err = driver.acquire(AccessMode::Read).await.unwrap_err();
    assert!(matches!(err, Error::Client { .. }), "got {err:?}");

    drop(held);
    assert!(driver.acquire(AccessMode::Read).await.is_ok());
    driver.close().await;
    Ok(())
}

#[tokio::test]
async fn closed_driver_refuses_new_acquires() -> Result<()> {
    init_tracing();
    let server = StubServer::start(|mut wire, _| async move {
        wire.handle_init().await?;
        Ok(())
    })
    .await?;

    let driver = Driver::new(&server.bolt_uri(), test_config(), AuthToken::none())?;
    drop(driver.acquire(AccessMode::Read).await?);

    driver.close().await;
    let err = driver.acquire(AccessMode::Read).await.unwrap_err();
    assert!(matches!(err, Error::PoolClosed), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn broken_connections_are_not_returned_to_the_pool() -> Result<()> {
    init_tracing();
    let connections = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&connections);

    let server = StubServer::start(move |mut wire, index| {
        let seen = Arc::clone(&seen);
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            wire.handle_init().await?;
            if index == 0 {
                // Hang up mid-session; the driver must not reuse this.
                return Ok(());
            }
            wire.serve_query(&["n"], &[vec![Value::Integer(7)]]).await
        }
    })
    .await?;

    let driver = Driver::new(&server.bolt_uri(), test_config(), AuthToken::none())?;

    let mut conn = driver.acquire(AccessMode::Read).await?;
    conn.run("RETURN 7", Default::default(), SharedCollector::new().handler())
        .await?;
    conn.pull_all(SharedCollector::new().handler()).await?;
    // First connection's server hung up right after INIT.
    assert!(conn.sync().await.is_err());
    drop(conn);

    let mut conn = driver.acquire(AccessMode::Read).await?;
    let rows = SharedCollector::new();
    conn.run("RETURN 7", Default::default(), SharedCollector::new().handler())
        .await?;
    conn.pull_all(rows.handler()).await?;
    conn.sync().await?;
    assert_eq!(rows.take().records, vec![vec![Value::Integer(7)]]);

    assert_eq!(connections.load(Ordering::SeqCst), 2, "fresh dial after the break");
    driver.close().await;
    Ok(())
}

//! Cluster discovery and routed queries against scripted stubs.

use crate::harness::*;

use anyhow::Result;
use lodestone::{AccessMode, AuthToken, BoltConnection, Driver, Error, SharedCollector, Value};
use lodestone_core::message::{SIG_ACK_FAILURE, SIG_PULL_ALL, SIG_RUN};

#[tokio::test]
async fn routing_driver_discovers_and_reads() -> Result<()> {
    init_tracing();

    let reader = StubServer::start(|mut wire, _| async move {
        wire.handle_init().await?;
        wire.serve_query(&["n"], &[vec![Value::Integer(42)]]).await
    })
    .await?;
    let reader_addr = reader.address();

    let router = BoundStub::bind().await?;
    let router_addr = router.address();
    let router = router.serve(move |mut wire, _| {
        let router_addr = router_addr.clone();
        let reader_addr = reader_addr.clone();
        async move {
            wire.handle_init().await?;
            wire.serve_routing_table(
                300,
                &[
                    ("ROUTE", vec![router_addr]),
                    ("READ", vec![reader_addr.clone()]),
                    ("WRITE", vec![reader_addr]),
                ],
            )
            .await
        }
    });

    let driver = Driver::new(&router.routing_uri(), test_config(), AuthToken::none())?;
    let mut conn = driver.acquire(AccessMode::Read).await?;

    let rows = SharedCollector::new();
    conn.run("RETURN 42 AS n", Default::default(), SharedCollector::new().handler())
        .await?;
    conn.pull_all(rows.handler()).await?;
    conn.sync().await?;
    assert_eq!(rows.take().records, vec![vec![Value::Integer(42)]]);

    drop(conn);
    driver.close().await;
    Ok(())
}

#[tokio::test]
async fn demoted_writer_is_replaced_after_rediscovery() -> Result<()> {
    init_tracing();

    // First writer refuses the write as a follower.
    let writer1 = StubServer::start(|mut wire, _| async move {
        wire.handle_init().await?;
        wire.expect(SIG_RUN).await?;
        wire.expect(SIG_PULL_ALL).await?;
        wire.send_failure("Neo.ClientError.Cluster.NotALeader", "follower")
            .await?;
        wire.send_ignored().await?;
        wire.expect(SIG_ACK_FAILURE).await?;
        wire.send_success(&[]).await?;
        Ok(())
    })
    .await?;

    // Second writer accepts it.
    let writer2 = StubServer::start(|mut wire, _| async move {
        wire.handle_init().await?;
        wire.serve_query(&["done"], &[vec![Value::Boolean(true)]]).await
    })
    .await?;

    let writer1_addr = writer1.address();
    let writer2_addr = writer2.address();
    let router = BoundStub::bind().await?;
    let router_addr = router.address();
    let router = router.serve(move |mut wire, _| {
        let router_addr = router_addr.clone();
        let writer1_addr = writer1_addr.clone();
        let writer2_addr = writer2_addr.clone();
        async move {
            wire.handle_init().await?;
            // Discovery #1 names the follower as writer; after the write
            // fails and the writer ring empties, discovery #2 promotes
            // the new leader. Both run over this one pooled connection.
            wire.serve_routing_table(
                300,
                &[
                    ("ROUTE", vec![router_addr.clone()]),
                    ("READ", vec![writer2_addr.clone()]),
                    ("WRITE", vec![writer1_addr]),
                ],
            )
            .await?;
            wire.serve_routing_table(
                300,
                &[
                    ("ROUTE", vec![router_addr]),
                    ("READ", vec![writer2_addr.clone()]),
                    ("WRITE", vec![writer2_addr]),
                ],
            )
            .await
        }
    });

    let driver = Driver::new(&router.routing_uri(), test_config(), AuthToken::none())?;

    let mut conn = driver.acquire(AccessMode::Write).await?;
    conn.run("CREATE (n)", Default::default(), SharedCollector::new().handler())
        .await?;
    conn.pull_all(SharedCollector::new().handler()).await?;
    let err = conn.sync().await.unwrap_err();
    assert!(
        matches!(err, Error::SessionExpired(_)),
        "NotALeader on write narrows to session expiry, got {err:?}"
    );
    drop(conn);

    // The writer ring is now empty, so this acquire forces rediscovery
    // and lands on the promoted leader.
    let mut conn = driver.acquire(AccessMode::Write).await?;
    let rows = SharedCollector::new();
    conn.run("CREATE (n) RETURN true AS done", Default::default(), SharedCollector::new().handler())
        .await?;
    conn.pull_all(rows.handler()).await?;
    conn.sync().await?;
    assert_eq!(rows.take().records, vec![vec![Value::Boolean(true)]]);

    driver.close().await;
    Ok(())
}

#[tokio::test]
async fn writerless_cluster_serves_reads_and_refuses_writes() -> Result<()> {
    init_tracing();

    let reader = StubServer::start(|mut wire, _| async move {
        wire.handle_init().await?;
        wire.serve_query(&["n"], &[vec![Value::Integer(1)]]).await
    })
    .await?;

    let reader_addr = reader.address();
    let router = BoundStub::bind().await?;
    let router_addr = router.address();
    let router = router.serve(move |mut wire, _| {
        let router_addr = router_addr.clone();
        let reader_addr = reader_addr.clone();
        async move {
            wire.handle_init().await?;
            loop {
                wire.serve_routing_table(
                    300,
                    &[
                        ("ROUTE", vec![router_addr.clone()]),
                        ("READ", vec![reader_addr.clone()]),
                        ("WRITE", vec![]),
                    ],
                )
                .await?;
            }
        }
    });

    let driver = Driver::new(&router.routing_uri(), test_config(), AuthToken::none())?;

    let mut conn = driver.acquire(AccessMode::Read).await?;
    let rows = SharedCollector::new();
    conn.run("RETURN 1 AS n", Default::default(), SharedCollector::new().handler())
        .await?;
    conn.pull_all(rows.handler()).await?;
    conn.sync().await?;
    assert_eq!(rows.take().records.len(), 1);
    drop(conn);

    let err = driver.acquire(AccessMode::Write).await.unwrap_err();
    match err {
        Error::Client { message, .. } => {
            assert_eq!(message, "Writes not supported in current topology");
        }
        other => panic!("expected client error, got {other:?}"),
    }

    driver.close().await;
    Ok(())
}

#[tokio::test]
async fn server_without_routing_support_fails_discovery() -> Result<()> {
    init_tracing();

    let standalone = StubServer::start(|mut wire, _| async move {
        wire.handle_init().await?;
        wire.expect(SIG_RUN).await?;
        wire.expect(SIG_PULL_ALL).await?;
        wire.send_failure(
            "Neo.ClientError.Procedure.ProcedureNotFound",
            "There is no procedure with the name `dbms.cluster.routing.getRoutingTable`",
        )
        .await?;
        wire.send_ignored().await?;
        wire.expect(SIG_ACK_FAILURE).await?;
        wire.send_success(&[]).await?;
        Ok(())
    })
    .await?;

    let driver = Driver::new(&standalone.routing_uri(), test_config(), AuthToken::none())?;
    let err = driver.acquire(AccessMode::Read).await.unwrap_err();
    match err {
        Error::ServiceUnavailable(message) => {
            assert!(
                message.contains("does not support routing"),
                "unexpected message: {message}"
            );
        }
        other => panic!("expected unavailable, got {other:?}"),
    }
    Ok(())
}

//! Publisher behaviour when the transport cannot keep up.

use crate::*;

use std::io;
use std::time::{Duration, Instant};

use driftnet_core::codec::Compression;
use driftnet_core::tracker::ChunksTracker;
use driftnet_core::wire::Chunk;
use driftnet_services::{PublishError, PublishKind, Publisher};

#[tokio::test]
async fn stalled_sink_times_out_with_progress() -> Result<()> {
    // Capacity 2 and nobody reading: the third chunk can never be sent.
    let (tx, _rx) = mpsc::channel::<Bytes>(2);
    let publisher = Publisher::new(
        Arc::new(tx),
        Compression::None,
        1_024,
        Duration::from_millis(300),
    )?;

    let started = Instant::now();
    let err = publisher
        .publish(&gradient(), PublishKind::WholeArray)
        .await
        .expect_err("publish into a stalled sink should time out");

    match err {
        PublishError::PublishTimeout { sent, total, .. } => {
            assert_eq!(sent, 2);
            assert!(total > 2);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[tokio::test]
async fn closed_sink_fails_without_retrying() -> Result<()> {
    let (tx, rx) = mpsc::channel::<Bytes>(8);
    drop(rx);
    let publisher = Publisher::new(Arc::new(tx), Compression::None, 1_024, Duration::from_secs(30))?;

    let started = Instant::now();
    let err = publisher
        .publish(&NumericArray::scalar(1.0), PublishKind::WholeArray)
        .await
        .expect_err("publish into a closed sink should fail");

    match err {
        PublishError::Send { source, .. } => assert_eq!(source.kind(), io::ErrorKind::BrokenPipe),
        other => panic!("expected send error, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn slow_consumer_within_deadline_succeeds() -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(1);
    let publisher = Publisher::new(Arc::new(tx), Compression::None, 4_096, Duration::from_secs(10))?;

    let reader = tokio::spawn(async move {
        let mut got = Vec::new();
        while let Some(d) = rx.recv().await {
            got.push(d);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        got
    });

    let array = gradient();
    let receipt = publisher.publish(&array, PublishKind::WholeArray).await?;
    assert!(receipt.retries > 0);
    drop(publisher);

    let datagrams = reader.await?;
    assert_eq!(datagrams.len(), receipt.chunks as usize);

    let mut chunks = datagrams.into_iter().map(Chunk::decode);
    let mut tracker = ChunksTracker::new(&chunks.next().context("no chunks")??);
    for c in chunks {
        tracker.append(&c?)?;
    }
    assert_eq!(tracker.get_message()?.array, array);
    Ok(())
}

//! Many publishers sharing one sink and one subscriber.

use crate::*;

use std::collections::HashMap;
use std::time::Duration;

use driftnet_core::codec::Compression;
use driftnet_core::wire::Chunk;
use driftnet_services::{Ingest, PublishKind, Publisher};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_all_deliver() -> Result<()> {
    let mut h = Harness::start(ReassemblyConfig {
        delivery_queue: 256,
        ..ReassemblyConfig::default()
    });
    // A small channel forces publishers through the backoff path.
    let (tx, mut rx) = mpsc::channel::<Bytes>(16);
    let inbound = h.inbound.clone();
    tokio::spawn(async move {
        while let Some(d) = rx.recv().await {
            if inbound.send(d).await.is_err() {
                break;
            }
        }
    });

    let publisher = Arc::new(Publisher::new(
        Arc::new(tx),
        Compression::Zstd,
        1_024,
        Duration::from_secs(10),
    )?);

    let mut tasks = Vec::new();
    for worker in 0..8u32 {
        let publisher = publisher.clone();
        tasks.push(tokio::spawn(async move {
            let mut sent = Vec::new();
            for round in 0..4u32 {
                let seed = (worker * 4 + round) as f32;
                let array = NumericArray::linspace(seed, seed * 10.0 + 1.0, 3_000);
                let receipt = publisher.publish(&array, PublishKind::WholeArray).await?;
                sent.push((receipt.id, array));
            }
            anyhow::Ok(sent)
        }));
    }

    let mut expected = HashMap::new();
    for task in tasks {
        for (id, array) in task.await?? {
            expected.insert(id, array);
        }
    }
    assert_eq!(expected.len(), 32);

    for _ in 0..expected.len() {
        match h.next_delivery().await? {
            Delivery::Full(msg) => {
                let want = expected.remove(&msg.id).context("unknown or repeated id")?;
                assert_eq!(msg.array, want);
            }
            other => panic!("unexpected delivery {other:?}"),
        }
    }
    assert!(expected.is_empty());
    assert_eq!(h.registry.in_flight(), 0);
    h.stop().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscriber_and_direct_ingest_complete_once() -> Result<()> {
    let mut h = Harness::start(ReassemblyConfig::default());

    let (tx, mut rx) = mpsc::channel::<Bytes>(4_096);
    let publisher = Publisher::new(Arc::new(tx), Compression::None, 512, Duration::from_secs(5))?;
    let receipt = publisher.publish(&gradient(), PublishKind::WholeArray).await?;
    drop(publisher);

    let mut datagrams = Vec::new();
    while let Some(d) = rx.recv().await {
        datagrams.push(d);
    }
    assert_eq!(datagrams.len(), receipt.chunks as usize);
    let chunks = Arc::new(
        datagrams
            .iter()
            .cloned()
            .map(Chunk::decode)
            .collect::<Result<Vec<_>, _>>()?,
    );

    // The subscriber consumes shuffled copies of the published datagrams
    // while blocking threads ingest the same chunks into its registry.
    let mut shuffled = datagrams;
    shuffled.shuffle(&mut StdRng::seed_from_u64(0xc0c0));
    let inbound = h.inbound.clone();
    let feeder = tokio::spawn(async move {
        for d in shuffled {
            inbound.send(d).await?;
        }
        anyhow::Ok(())
    });

    let mut ingesters = Vec::new();
    for n in 0..4 {
        let registry = h.registry.clone();
        let chunks = chunks.clone();
        ingesters.push(tokio::task::spawn_blocking(move || {
            let start = n * chunks.len() / 4;
            chunks
                .iter()
                .cycle()
                .skip(start)
                .take(chunks.len())
                .filter(|c| matches!(registry.ingest(c), Ok(Ingest::Complete(_))))
                .count()
        }));
    }

    feeder.await??;
    let mut completions = 0;
    for ingester in ingesters {
        completions += ingester.await?;
    }

    let mut delivered = 0;
    while let Ok(Some(d)) = tokio::time::timeout(Duration::from_millis(500), h.deliveries.recv()).await {
        match d {
            Delivery::Full(msg) => {
                assert_eq!(msg.id, receipt.id);
                assert_eq!(msg.array, gradient());
                delivered += 1;
            }
            other => panic!("unexpected delivery {other:?}"),
        }
    }

    assert_eq!(completions + delivered, 1);
    assert_eq!(h.registry.in_flight(), 0);
    h.stop().await
}

//! Publish over a real UDP socket on 127.0.0.1.

use crate::*;

use std::collections::HashMap;
use std::time::Duration;

use tokio::net::UdpSocket;

use driftnet_core::codec::Compression;
use driftnet_services::{udp_pump, PublishKind, Publisher, UdpSink};

struct UdpRig {
    publisher: Publisher<UdpSink>,
    deliveries: mpsc::Receiver<Delivery>,
    stats: Arc<ReceiveStats>,
    shutdown: broadcast::Sender<()>,
}

async fn rig(compression: Compression, max_chunk_bytes: usize) -> Result<UdpRig> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let addr = socket.local_addr()?;

    let stats = Arc::new(ReceiveStats::new());
    let (subscriber, deliveries) = Subscriber::new(&ReassemblyConfig::default(), stats.clone());
    let (tx, inbound) = mpsc::channel(1_024);
    let (shutdown, _) = broadcast::channel(1);

    tokio::spawn(udp_pump(socket, tx, shutdown.subscribe()));
    tokio::spawn(subscriber.run(inbound, shutdown.subscribe()));

    let sink = UdpSink::connect(addr).await?;
    let publisher = Publisher::new(
        Arc::new(sink),
        compression,
        max_chunk_bytes,
        Duration::from_secs(30),
    )?;

    Ok(UdpRig {
        publisher,
        deliveries,
        stats,
        shutdown,
    })
}

#[tokio::test]
async fn gradient_over_udp_with_zstd() -> Result<()> {
    let mut rig = rig(Compression::Zstd, 16_384).await?;
    let array = gradient();

    let receipt = rig.publisher.publish(&array, PublishKind::WholeArray).await?;
    assert_eq!(receipt.chunks as usize, receipt.bytes.div_ceil(16_384));

    match next_delivery(&mut rig.deliveries).await? {
        Delivery::Full(msg) => {
            assert_eq!(msg.id, receipt.id);
            assert_eq!(msg.array.shape(), &[10, 1_000]);
            assert_eq!(msg.array, array);
        }
        other => panic!("expected full delivery, got {other:?}"),
    }

    let _ = rig.shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn scalar_is_one_datagram() -> Result<()> {
    let mut rig = rig(Compression::None, 16_384).await?;

    let receipt = rig
        .publisher
        .publish(&NumericArray::scalar(1.0), PublishKind::WholeArray)
        .await?;
    assert_eq!(receipt.chunks, 1);

    match next_delivery(&mut rig.deliveries).await? {
        Delivery::Full(msg) => assert_eq!(msg.array.to_vec::<f64>(), Some(vec![1.0])),
        other => panic!("expected full delivery, got {other:?}"),
    }
    assert_eq!(rig.stats.snapshot().datagrams, 1);

    let _ = rig.shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn whole_and_partial_updates_keep_their_kind() -> Result<()> {
    let mut rig = rig(Compression::None, 1_200).await?;
    let patch = NumericArray::from_elements(vec![2, 500], &[7i64; 1_000])?;

    let whole = rig.publisher.publish(&gradient(), PublishKind::WholeArray).await?;
    let partial = rig
        .publisher
        .publish(
            &patch,
            PublishKind::Partial {
                offset: 3_000,
                dimensions: vec![1],
            },
        )
        .await?;

    let mut got = HashMap::new();
    for _ in 0..2 {
        let d = next_delivery(&mut rig.deliveries).await?;
        got.insert(d.id(), d);
    }

    assert!(matches!(&got[&whole.id], Delivery::Full(msg) if msg.array == gradient()));
    match &got[&partial.id] {
        Delivery::Partial {
            array,
            offset,
            dimensions,
            ..
        } => {
            assert_eq!(array, &patch);
            assert_eq!(*offset, 3_000);
            assert_eq!(dimensions, &vec![1]);
        }
        other => panic!("expected partial delivery, got {other:?}"),
    }

    let _ = rig.shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn stray_datagrams_do_not_disturb_delivery() -> Result<()> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let addr = socket.local_addr()?;
    let mut h = Harness::start(ReassemblyConfig::default());
    let (pump_shutdown, _) = broadcast::channel(1);
    tokio::spawn(udp_pump(socket, h.inbound.clone(), pump_shutdown.subscribe()));

    let noise = UdpSocket::bind("127.0.0.1:0").await?;
    noise.send_to(b"definitely not a chunk", addr).await?;

    let publisher = Publisher::new(
        Arc::new(UdpSink::connect(addr).await?),
        Compression::None,
        4_096,
        Duration::from_secs(30),
    )?;
    let receipt = publisher.publish(&gradient(), PublishKind::WholeArray).await?;

    let d = h.next_delivery().await?;
    assert_eq!(d.id(), receipt.id);
    assert!(eventually(DELIVERY_TIMEOUT, || h.stats.snapshot().malformed == 1).await);

    let _ = pump_shutdown.send(());
    h.stop().await
}

//! driftnetd: publish or subscribe to numeric arrays over UDP.
//!
//! Usage:
//!   driftnetd listen
//!   driftnetd send [elements] [count]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use driftnet_core::array::NumericArray;
use driftnet_core::config::DriftnetConfig;
use driftnet_services::{
    udp_pump, Delivery, PublishKind, Publisher, ReceiveStats, Subscriber, UdpSink,
};

/// Datagrams buffered between the socket pump and the subscriber.
const INBOUND_QUEUE: usize = 1024;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = DriftnetConfig::file_path();
    if let Err(e) = DriftnetConfig::write_default_if_missing(&config_path) {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = DriftnetConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        DriftnetConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "listen".to_string());
    tracing::info!(command, config = %config_path.display(), "driftnetd starting");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match command.as_str() {
        "listen" => listen(config, shutdown_tx).await,
        "send" => {
            let elements = parse_arg(args.next(), 10_000).context("invalid element count")?;
            let count = parse_arg(args.next(), 1).context("invalid message count")?;
            send(config, elements, count, shutdown_tx.subscribe()).await
        }
        other => bail!("unknown command {other:?}, expected \"listen\" or \"send\""),
    }
}

fn parse_arg(arg: Option<String>, default: usize) -> Result<usize> {
    match arg {
        Some(s) => s.parse().with_context(|| format!("not a number: {s:?}")),
        None => Ok(default),
    }
}

async fn listen(config: DriftnetConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let socket = Arc::new(
        UdpSocket::bind(&config.transport.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.transport.bind_addr))?,
    );
    tracing::info!(addr = %socket.local_addr()?, "listening for chunks");

    let stats = Arc::new(ReceiveStats::new());
    let (subscriber, mut deliveries) = Subscriber::new(&config.reassembly, stats.clone());
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let pump_task = tokio::spawn(udp_pump(socket, inbound_tx, shutdown_tx.subscribe()));
    let subscriber_task = tokio::spawn(subscriber.run(inbound_rx, shutdown_tx.subscribe()));

    let consumer_task = tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            match delivery {
                Delivery::Full(msg) => tracing::info!(
                    message_id = hex::encode(msg.id.as_bytes()),
                    shape = ?msg.array.shape(),
                    dtype = %msg.array.dtype(),
                    "array received"
                ),
                Delivery::Partial {
                    id,
                    array,
                    offset,
                    dimensions,
                } => tracing::info!(
                    message_id = hex::encode(id.as_bytes()),
                    shape = ?array.shape(),
                    offset,
                    ?dimensions,
                    "partial update received"
                ),
                Delivery::Progress { id, received, total } => tracing::debug!(
                    message_id = hex::encode(id.as_bytes()),
                    received,
                    total,
                    "reassembly progress"
                ),
            }
        }
    });

    let stats_printer = {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                interval.tick().await;
                stats.log();
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = pump_task           => tracing::error!("udp pump exited: {:?}", r),
        r = subscriber_task     => tracing::error!("subscriber exited: {:?}", r),
        r = consumer_task       => tracing::error!("delivery consumer exited: {:?}", r),
        r = stats_printer       => tracing::error!("stats printer exited: {:?}", r),
    }

    stats.log();
    Ok(())
}

async fn send(
    config: DriftnetConfig,
    elements: usize,
    count: usize,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let peer: SocketAddr = config
        .transport
        .peer_addr
        .parse()
        .with_context(|| format!("invalid peer address {:?}", config.transport.peer_addr))?;
    let sink = UdpSink::connect(peer)
        .await
        .context("failed to bind send socket")?;
    let publisher = Publisher::from_config(Arc::new(sink), &config.transport)?;

    let array = NumericArray::linspace(1.0, elements as f32, elements);
    tracing::info!(
        %peer,
        elements,
        count,
        compression = %config.transport.compression_codec,
        max_chunk_bytes = config.transport.max_chunk_bytes,
        "publishing"
    );

    for n in 0..count {
        let receipt = tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(sent = n, "publishing interrupted");
                return Ok(());
            }
            r = publisher.publish(&array, PublishKind::WholeArray) => {
                r.context("publish failed")?
            }
        };
        tracing::info!(
            message_id = hex::encode(receipt.id.as_bytes()),
            chunks = receipt.chunks,
            bytes = receipt.bytes,
            retries = receipt.retries,
            "array published"
        );
    }

    Ok(())
}

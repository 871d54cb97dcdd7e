use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use herald_pipeline::Producer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::HeraldConfig;
use crate::sample::SampleData;

#[derive(Args)]
pub struct SendArgs {
    /// Topic to publish to (defaults to the configured topic)
    #[arg(short, long)]
    pub topic: Option<String>,

    /// Delay between two records, e.g. "500ms"
    #[arg(short, long, value_parser = super::parse_duration)]
    pub interval: Option<Duration>,

    /// Stop after this many records
    #[arg(short, long)]
    pub count: Option<u64>,
}

pub async fn run(args: SendArgs, config: HeraldConfig, cancel: CancellationToken) -> Result<()> {
    let topic = args.topic.unwrap_or(config.topic.name);
    let interval = args.interval.unwrap_or(config.sender.interval);

    let broker = herald_broker::connect(&config.broker).context("Failed to connect to broker")?;
    broker
        .ensure_topic(&topic, config.topic.partitions)
        .await
        .with_context(|| format!("Failed to create topic {topic}"))?;

    let producer = Producer::new(broker, config.producer);
    info!(%topic, ?interval, "Sending sample records, press Ctrl-C to stop");

    let sent = run_sender(&producer, &topic, interval, args.count, &cancel).await;
    info!(sent, "Sender stopped");
    Ok(())
}

/// Publish a random [`SampleData`] every `interval` until `count` records were
/// published or `cancel` fires. The delay is measured from the end of one
/// publish to the start of the next.
///
/// Returns the number of records acknowledged by the broker.
pub async fn run_sender(
    producer: &Producer,
    topic: &str,
    interval: Duration,
    count: Option<u64>,
    cancel: &CancellationToken,
) -> u64 {
    let mut attempted = 0u64;
    let mut sent = 0u64;

    while !cancel.is_cancelled() {
        if count.is_some_and(|limit| attempted >= limit) {
            break;
        }

        let data = SampleData::random(&mut rand::thread_rng());
        attempted += 1;
        match producer.publish(topic, &data).await {
            Ok(record) => {
                sent += 1;
                info!("Message sent. Id: {}; Data: {}", record.event_id, data);
            }
            Err(e) => error!(%topic, error = %e, "Failed to send message"),
        }

        if count.is_some_and(|limit| attempted >= limit) {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    sent
}

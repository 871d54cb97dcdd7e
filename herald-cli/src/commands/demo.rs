use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use herald_broker::{Broker, InMemoryBroker};
use herald_pipeline::{ConsumerPipeline, Producer, StatsSnapshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::listen::{print_stats, sample_logger};
use super::send::run_sender;
use crate::config::HeraldConfig;

/// How often the demo checks whether the listener caught up.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Args)]
pub struct DemoArgs {
    /// Number of records to send
    #[arg(short, long, default_value_t = 3)]
    pub count: u64,

    /// Delay between two records
    #[arg(short, long, default_value = "500ms", value_parser = super::parse_duration)]
    pub interval: Duration,

    /// Give up waiting for the listener after this long
    #[arg(long, default_value = "10s", value_parser = super::parse_duration)]
    pub timeout: Duration,
}

pub async fn run(args: DemoArgs, config: HeraldConfig, cancel: CancellationToken) -> Result<()> {
    let stats = run_demo(&args, config, &cancel).await?;
    print_stats(&stats);
    Ok(())
}

/// Run a sender and a listener against one in-memory broker and wait until
/// every sent record was handled.
pub async fn run_demo(
    args: &DemoArgs,
    config: HeraldConfig,
    cancel: &CancellationToken,
) -> Result<StatsSnapshot> {
    let topic = config.topic.name;
    let broker = InMemoryBroker::with_default_partitions(config.topic.partitions);
    broker
        .ensure_topic(&topic, config.topic.partitions)
        .await
        .context("Failed to create demo topic")?;

    let pipeline = ConsumerPipeline::new(Arc::new(broker.clone()), config.consumer);
    let subscription = pipeline
        .subscribe(&topic, sample_logger())
        .await
        .context("Failed to start demo listener")?;

    let producer = Producer::new(Arc::new(broker), config.producer);
    let sent = run_sender(&producer, &topic, args.interval, Some(args.count), cancel).await;

    let deadline = Instant::now() + args.timeout;
    loop {
        let stats = subscription.stats();
        if stats.committed >= sent {
            break;
        }
        if Instant::now() >= deadline {
            warn!(sent, committed = stats.committed, "Listener did not catch up in time");
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(PROGRESS_INTERVAL) => {}
        }
    }

    let stats = subscription.shutdown().await;
    info!(sent, handled = stats.handled, "Demo finished");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLoader, RawHeraldConfig};

    fn demo_config() -> HeraldConfig {
        let mut config = ConfigLoader::load_layers(&[], RawHeraldConfig::default()).unwrap();
        config.consumer.poll_timeout = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn every_sent_record_is_handled() {
        let args = DemoArgs {
            count: 5,
            interval: Duration::ZERO,
            timeout: Duration::from_secs(10),
        };

        let stats = run_demo(&args, demo_config(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.handled, 5);
        assert_eq!(stats.committed, 5);
        assert_eq!(stats.dead_lettered, 0);
    }

    #[tokio::test]
    async fn cancelled_demo_sends_nothing() {
        let args = DemoArgs {
            count: 3,
            interval: Duration::ZERO,
            timeout: Duration::from_secs(1),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = run_demo(&args, demo_config(), &cancel).await.unwrap();
        assert_eq!(stats.fetched, 0);
    }
}

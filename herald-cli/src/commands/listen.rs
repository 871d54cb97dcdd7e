use anyhow::{Context, Result};
use clap::Args;
use herald_core::CloudEvent;
use herald_pipeline::{ConsumerPipeline, EventHandler, HandleError, StatsSnapshot, handler_fn};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::HeraldConfig;
use crate::sample::SampleData;

#[derive(Args)]
pub struct ListenArgs {
    /// Topic to consume (defaults to the configured topic)
    #[arg(short, long)]
    pub topic: Option<String>,

    /// Consumer group to join (defaults to the configured group)
    #[arg(short, long)]
    pub group: Option<String>,
}

pub async fn run(args: ListenArgs, config: HeraldConfig, cancel: CancellationToken) -> Result<()> {
    let topic = args.topic.unwrap_or(config.topic.name);
    let mut consumer = config.consumer;
    if let Some(group) = args.group {
        consumer.group = group;
    }

    let broker = herald_broker::connect(&config.broker).context("Failed to connect to broker")?;
    let pipeline = ConsumerPipeline::new(broker, consumer);
    let subscription = pipeline
        .subscribe(&topic, sample_logger())
        .await
        .with_context(|| format!("Failed to subscribe to {topic}"))?;

    info!(
        %topic,
        group = subscription.group(),
        dead_letter_topic = subscription.dead_letter_topic(),
        "Listening, press Ctrl-C to stop"
    );
    cancel.cancelled().await;

    let stats = subscription.shutdown().await;
    print_stats(&stats);
    Ok(())
}

/// Handler that logs each received [`SampleData`].
pub fn sample_logger() -> EventHandler {
    handler_fn(|event: CloudEvent| async move {
        match event.data_as::<SampleData>()? {
            Some(data) => info!("Received message. Id: {}; Data: {}", event.id(), data),
            None => warn!("No data in message {}", event.id()),
        }
        Ok::<_, HandleError>(())
    })
}

pub fn print_stats(stats: &StatsSnapshot) {
    println!("Fetched:        {}", stats.fetched);
    println!("Handled:        {}", stats.handled);
    println!("Retried:        {}", stats.retried);
    println!("Dead-lettered:  {}", stats.dead_lettered);
    println!("Skipped:        {}", stats.skipped);
    println!("Committed:      {}", stats.committed);
    if stats.commit_failures > 0 {
        println!("Commit errors:  {}", stats.commit_failures);
    }
}

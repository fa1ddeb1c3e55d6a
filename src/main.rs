use anyhow::Context;
use clap::{Parser, ValueEnum};
use rabbitmq_broker::{
    config::{BrokerConfig, PublishMode},
    logging,
    metrics::{gather_text, init_broker_metrics},
    publisher::Publisher,
    subscriber::{ErrorHandlingChain, Subscriber},
    transport::memory::InMemoryBroker,
    BrokerError,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "broker-demo")]
#[command(
    about = "Publish and consume through the resilience layer against an in-memory broker",
    long_about = None
)]
struct Cli {
    /// Number of messages to publish
    #[arg(short, long, default_value = "20")]
    messages: u32,

    /// Publish mode, overrides the configured one
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Fail the handler for every Nth message (0 disables)
    #[arg(short, long, default_value = "0")]
    poison_every: u32,

    /// Drop every broker connection halfway through publishing
    #[arg(long)]
    drop_connections: bool,

    /// Dead-letter exchange used when the configuration names none
    #[arg(long, default_value = "broker.default.dlx")]
    dead_letter_exchange: String,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    metrics: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Sync,
    Async,
}

impl From<ModeArg> for PublishMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Sync => PublishMode::Synchronous,
            ModeArg::Async => PublishMode::Asynchronous,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DemoEvent {
    sequence: u32,
    body: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        logging::init_json_tracing("rabbitmq_broker=info,broker_demo=info");
    } else {
        logging::init_tracing("rabbitmq_broker=info,broker_demo=info");
    }
    init_broker_metrics();

    let mut config = BrokerConfig::load().context("Failed to load configuration")?;
    if config.settings.dead_letter_exchange_name.is_none() {
        config.settings.dead_letter_exchange_name = Some(cli.dead_letter_exchange.clone());
    }
    if let Some(mode) = cli.mode {
        config.publisher.mode = mode.into();
    }

    tracing::info!(
        "Starting broker demo v{} ({} messages, {:?})",
        env!("CARGO_PKG_VERSION"),
        cli.messages,
        config.publisher.mode
    );

    let broker = InMemoryBroker::new();
    let processed = Arc::new(AtomicU32::new(0));

    let subscriber = Subscriber::<DemoEvent>::builder(config.settings.clone())
        .transport(Arc::new(broker.clone()))
        .options(config.subscriber.clone())
        .error_handling(ErrorHandlingChain::dead_lettering())
        .name("demo-subscriber")
        .build()?;

    let counter = Arc::clone(&processed);
    let poison_every = cli.poison_every;
    subscriber.subscribe(move |event: DemoEvent| {
        let counter = Arc::clone(&counter);
        async move {
            if poison_every > 0 && event.sequence % poison_every == 0 {
                return Err(BrokerError::handler(format!(
                    "refusing poison event #{}",
                    event.sequence
                )));
            }
            tracing::info!(sequence = event.sequence, body = %event.body, "Event handled");
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })?;
    subscriber.start().await?;

    let publisher = Publisher::<DemoEvent>::builder(config.settings.clone())
        .transport(Arc::new(broker.clone()))
        .options(config.publisher.clone())
        .name("demo-publisher")
        .build()?;
    publisher.start().await?;

    for sequence in 1..=cli.messages {
        if cli.drop_connections && sequence == cli.messages / 2 {
            tracing::warn!("Dropping all broker connections");
            broker.drop_connections();
        }

        let event = DemoEvent {
            sequence,
            body: format!("event number {}", sequence),
        };
        if let Err(e) = publisher.produce(&event).await {
            // Synchronous mode surfaces failures to the caller; retry once
            tracing::warn!(sequence, error = %e, "Publish failed, retrying");
            publisher
                .produce(&event)
                .await
                .with_context(|| format!("Failed to publish event #{}", sequence))?;
        }
    }

    let poison_queue = config.settings.poison_queue_name();
    let settled = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let done = processed.load(Ordering::SeqCst) as usize
                + broker.message_count(&poison_queue);
            if done >= cli.messages as usize {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    publisher.stop().await;
    subscriber.stop().await;

    tracing::info!(
        published = broker.published_count(),
        processed = processed.load(Ordering::SeqCst),
        dead_lettered = broker.message_count(&poison_queue),
        connections = broker.connections_created(),
        "Demo finished"
    );

    if cli.metrics {
        println!("{}", gather_text());
    }

    settled.map_err(|_| anyhow::anyhow!("Timed out waiting for every event to settle"))
}

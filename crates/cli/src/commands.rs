use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use uartlink::runtime::{Capabilities, PlatformFactory, TransportKind};
use uartlink::{Consumer, Link, LinkConfig, LinkState};

use crate::cli::{Cli, Command, TransportMode};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let kind = match cli.transport {
        TransportMode::Auto => TransportKind::resolve(Capabilities::detect()),
        TransportMode::Relay => TransportKind::Relay,
        TransportMode::Native => TransportKind::Native,
    };
    tracing::info!(?kind, "transport selected");

    let factory = Arc::new(PlatformFactory::new(kind, cli.relay_url.clone()));
    let config = LinkConfig {
        liveness_timeout: cli.liveness_timeout_ms.map(Duration::from_millis),
        ..LinkConfig::default()
    };
    let state = Arc::new(LinkState::new());
    let link = Link::new(factory, config, Arc::clone(&state));

    match cli.command {
        Command::Scan { seconds } => scan(&link, seconds).await,
        Command::Send { id, message } => send(&link, id.as_deref(), &message).await,
        Command::Monitor { id, seconds } => monitor(&link, &state, id.as_deref(), seconds).await,
    }
}

async fn scan(link: &Link, seconds: u64) -> anyhow::Result<()> {
    link.scan().await.context("failed to start discovery")?;
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let peripherals = link.discovered_peripherals();
    if peripherals.is_empty() {
        println!("no peripherals found");
        return Ok(());
    }
    for peripheral in peripherals {
        match peripheral.rssi {
            Some(rssi) => println!("{}  {}  ({rssi} dBm)", peripheral.id, peripheral.name),
            None => println!("{}  {}", peripheral.id, peripheral.name),
        }
    }
    Ok(())
}

async fn send(link: &Link, id: Option<&str>, message: &str) -> anyhow::Result<()> {
    connect(link, id).await?;

    // give the handshake a beat to claim the send slot, then wait for it to
    // free up before the user's message
    tokio::time::sleep(Duration::from_millis(200)).await;
    wait_until(|| !link.is_busy(), CONNECT_TIMEOUT)
        .await
        .context("link stayed busy after the handshake")?;
    link.send(message);
    wait_until(|| !link.is_busy(), CONNECT_TIMEOUT)
        .await
        .context("send was never acknowledged")?;

    if link.level() > 0 {
        println!(
            "sent to '{}' (reported version {})",
            link.peripheral_name(),
            link.level()
        );
    } else {
        println!("sent to '{}'", link.peripheral_name());
    }
    link.disconnect().await;
    Ok(())
}

async fn monitor(
    link: &Link,
    state: &Arc<LinkState>,
    id: Option<&str>,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    PrintConsumer::register(state);
    connect(link, id).await?;
    tracing::info!(name = %link.peripheral_name(), "monitoring; reports follow");

    match seconds {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
        }
    }
    link.disconnect().await;
    Ok(())
}

async fn connect(link: &Link, id: Option<&str>) -> anyhow::Result<()> {
    link.scan().await.context("failed to start discovery")?;

    let id = match id {
        Some(id) => id.to_string(),
        None => {
            let first = wait_for(
                || link.discovered_peripherals().into_iter().next(),
                DISCOVERY_TIMEOUT,
            )
            .await
            .context("no peripheral discovered")?;
            tracing::info!(id = %first.id, name = %first.name, "using first discovered peripheral");
            first.id
        }
    };

    link.connect(&id).await;
    wait_until(|| link.is_connected(), CONNECT_TIMEOUT)
        .await
        .with_context(|| format!("could not connect to peripheral {id}"))?;
    Ok(())
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> anyhow::Result<()> {
    wait_for(|| condition().then_some(()), timeout).await
}

async fn wait_for<T>(
    mut probe: impl FnMut() -> Option<T>,
    timeout: Duration,
) -> anyhow::Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            bail!("timed out after {timeout:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Prints every report the session handler left unclaimed; registers itself
/// at construction like any other consumer.
struct PrintConsumer;

impl PrintConsumer {
    fn register(state: &LinkState) {
        state.register(Arc::new(Self));
    }
}

impl Consumer for PrintConsumer {
    fn try_handle(&self, text: &str) -> bool {
        println!("{}", text.trim_end());
        true
    }
}

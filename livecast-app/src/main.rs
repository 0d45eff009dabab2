//! Command-line entry point.
//!
//! Runs one host and one viewer against the loopback transport and the
//! in-memory stores, printing every core event as a JSON line. Pass a
//! JSON configuration file as the first argument to override defaults.

mod simulate;

use std::path::Path;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{select, Receiver};
use livecast_ipc::{event_channel, BroadcastEvent, LivecastConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "livecast=debug,livecast_engine=debug,livecast_transport=info,livecast_store=info,livecast_capture=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: Option<&Path>) -> Result<LivecastConfig> {
    let Some(path) = path else {
        return Ok(LivecastConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    LivecastConfig::from_json(&json).with_context(|| format!("parsing config {}", path.display()))
}

fn print_event(event: &BroadcastEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to encode event: {}", e),
    }
}

/// Print events until told to stop, then flush what is queued.
fn drain_events(rx: Receiver<BroadcastEvent>, done: Receiver<()>) {
    loop {
        select! {
            recv(rx) -> event => match event {
                Ok(event) => print_event(&event),
                Err(_) => return,
            },
            recv(done) -> _ => break,
        }
    }
    for event in rx.try_iter() {
        print_event(&event);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let path = std::env::args().nth(1);
    let config = load_config(path.as_deref().map(Path::new))?;
    info!("Livecast simulation starting");

    let (event_tx, event_rx) = event_channel();
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let printer = thread::spawn(move || drain_events(event_rx, done_rx));

    let result = simulate::run(config, event_tx).await;

    let _ = done_tx.send(());
    if printer.join().is_err() {
        warn!("Event printer panicked");
    }
    result?;
    info!("Livecast simulation finished");
    Ok(())
}

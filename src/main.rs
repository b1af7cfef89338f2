//! # Flow Stats Agent Entry Point
//!
//! Reads raw events as JSON lines on stdin, writes export records as JSON
//! lines on stdout. Logs go to stderr.
//!
//! - `SIGUSR2` writes a stats dump
//! - end of input or Ctrl-C shuts down, flushing remaining flows as `forced_end`

use std::sync::Arc;

use flowstats::metrics::PrometheusRegistry;
use flowstats::sources::{NflogPacket, SnapshotSource};
use flowstats::{Agent, CollectorConfig, InputEvent, LookupCache};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CollectorConfig::from_env()?;
    info!("Dump file: {:?}", config.dump.path);

    let lookup = Arc::new(LookupCache::new());
    let conntrack = Arc::new(SnapshotSource::new());
    let metrics = Arc::new(PrometheusRegistry::new());

    let (agent, mut exports) = Agent::start(config, lookup.clone(), conntrack.clone(), metrics.clone())?;

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(record) = exports.recv().await {
            let line = match serde_json::to_string(&record) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to serialize export record: {}", e);
                    continue;
                }
            };
            if let Err(e) = stdout.write_all(format!("{}\n", line).as_bytes()).await {
                error!("Failed to write export record: {}", e);
            }
        }
        let _ = stdout.flush().await;
    });

    let mut dump_signal = signal(SignalKind::user_defined2())?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let ingress = agent.ingress();
    let egress = agent.egress();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<InputEvent>(&line) {
                        Ok(event) => dispatch(event, &lookup, &conntrack, &ingress, &egress).await,
                        Err(e) => warn!("Ignoring unparsable input line: {}", e),
                    }
                }
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            },
            _ = dump_signal.recv() => agent.request_dump(),
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    drop(ingress);
    drop(egress);
    let stats = agent.shutdown().await;
    if let Err(e) = writer.await {
        error!("Export writer failed: {}", e);
    }

    info!("Final collector statistics: {}", stats);
    match metrics.render() {
        Ok(text) => info!("Denied traffic metrics:\n{}", text),
        Err(e) => error!("Failed to render metrics: {}", e),
    }

    Ok(())
}

async fn dispatch(
    event: InputEvent,
    lookup: &LookupCache,
    conntrack: &SnapshotSource,
    ingress: &mpsc::Sender<NflogPacket>,
    egress: &mpsc::Sender<NflogPacket>,
) {
    match event {
        InputEvent::Lookup { update } => lookup.on_update(update),
        InputEvent::Conntrack { entries } => conntrack.push(entries),
        InputEvent::NflogIngress { packet } => {
            if ingress.send(packet).await.is_err() {
                error!("Ingress adapter stopped, dropping notification");
            }
        }
        InputEvent::NflogEgress { packet } => {
            if egress.send(packet).await.is_err() {
                error!("Egress adapter stopped, dropping notification");
            }
        }
    }
}

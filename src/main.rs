//! Line-oriented host for the dispatcher.
//!
//! Reads one JSON request per line from stdin and writes every redispatched
//! event to stdout as `{"tag": .., "payload": ..}`. Requests that cannot be
//! dispatched are reported as `dispatch-error` events. Logs go to stderr.

use std::io::Write;
use std::sync::Arc;

use docfx::Dispatched;
use docfx::EffectDispatcher;
use docfx::EventBus;
use docfx::EventTag;
use docfx::HostEvent;
use docfx::MemoryEngine;
use docfx::Request;
use docfx::RequestSpec;
use docfx::Result;
use docfx::Settings;
use docfx::Subscription;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;


const DISPATCH_ERROR_TAG: &str = "dispatch-error";

/// Writes host events to stdout, one JSON object per line
struct StdoutBus;

impl EventBus for StdoutBus {
    fn dispatch(
        &self,
        event: HostEvent,
    ) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(tag = %event.tag, "cannot encode event: {}", e);
                return;
            }
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", line).and_then(|_| stdout.flush()) {
            warn!(tag = %event.tag, "cannot write event: {}", e);
        }
    }
}

/// Dispatcher plus the work started from input lines that must be awaited
/// or cancelled on shutdown
struct LineHost {
    dispatcher: EffectDispatcher,
    bus: Arc<dyn EventBus>,
    pending: Vec<JoinHandle<()>>,
    replications: Vec<Subscription>,
}

impl LineHost {
    fn new(
        settings: &Settings,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let engine = Arc::new(MemoryEngine::new(settings.engine.clone()));
        Self {
            dispatcher: EffectDispatcher::new(engine, bus.clone(), settings),
            bus,
            pending: Vec::new(),
            replications: Vec::new(),
        }
    }

    /// Dispatches one input line. Dispatch errors become `dispatch-error`
    /// events.
    fn handle_line(
        &mut self,
        line: &str,
    ) {
        let dispatched = RequestSpec::parse(line).and_then(|spec| self.dispatcher.dispatch(Request::from(spec)));
        match dispatched {
            Ok(Dispatched::Pending(task)) => {
                self.pending.retain(|task| !task.is_finished());
                self.pending.push(task);
            }
            Ok(Dispatched::Replicating(subscription)) => {
                debug!(id = subscription.id(), "replication running");
                self.replications.retain(|running| !running.is_finished());
                self.replications.push(subscription);
            }
            Ok(Dispatched::Subscribed) | Ok(Dispatched::Cancelled) => {}
            Err(e) => self.bus.dispatch(HostEvent {
                tag: EventTag::new(DISPATCH_ERROR_TAG),
                payload: json!({ "error": e.to_string(), "request": line.trim() }),
            }),
        }
    }

    /// Waits for outstanding operations, then stops every replication,
    /// watcher and sync session.
    async fn shutdown(&mut self) {
        for task in self.pending.drain(..) {
            if let Err(e) = task.await {
                warn!("request task failed: {:?}", e);
            }
        }
        for replication in self.replications.drain(..) {
            replication.cancel();
        }
        self.dispatcher.shutdown();
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    init_observability();
    let settings = Settings::new()?.validate()?;
    let mut host = LineHost::new(&settings, Arc::new(StdoutBus));

    info!("Reading requests from stdin. Close stdin or press CTRL+C to stop.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => host.handle_line(&line),
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("failed to read stdin: {:?}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C detected.");
                break;
            }
        }
    }

    host.shutdown().await;
    info!("Shutdown completed");
    Ok(())
}

fn init_observability() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

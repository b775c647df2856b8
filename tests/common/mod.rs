use std::sync::Arc;
use std::time::Duration;

use docfx::EffectDispatcher;
use docfx::EventBus;
use docfx::HostEvent;
use docfx::MemoryEngine;
use docfx::Request;
use docfx::Settings;
use parking_lot::Mutex;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(2);

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for integration test.");
}

/// Host event system stand-in that keeps every event
#[derive(Default)]
pub struct HostLog {
    events: Mutex<Vec<HostEvent>>,
}

impl HostLog {
    pub fn payloads(
        &self,
        tag: &str,
    ) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.tag.as_str() == tag)
            .map(|event| event.payload.clone())
            .collect()
    }

    pub fn count(
        &self,
        tag: &str,
    ) -> usize {
        self.payloads(tag).len()
    }

    /// First payload delivered under `tag`
    pub fn first(
        &self,
        tag: &str,
    ) -> Value {
        self.payloads(tag).into_iter().next().unwrap_or(Value::Null)
    }
}

impl EventBus for HostLog {
    fn dispatch(
        &self,
        event: HostEvent,
    ) {
        self.events.lock().push(event);
    }
}

pub struct Host {
    pub dispatcher: EffectDispatcher,
    pub log: Arc<HostLog>,
}

impl Host {
    pub fn new(settings: Settings) -> Self {
        enable_logger();
        let log = Arc::new(HostLog::default());
        let engine = Arc::new(MemoryEngine::new(settings.engine.clone()));
        let dispatcher = EffectDispatcher::new(engine, log.clone(), &settings);
        Self { dispatcher, log }
    }

    /// Dispatches `request` and waits until its outcome was delivered.
    pub async fn run(
        &self,
        request: Request,
    ) {
        let dispatched = self.dispatcher.dispatch(request).unwrap();
        tokio::time::timeout(WAIT, dispatched.settled())
            .await
            .expect("request should settle in time");
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

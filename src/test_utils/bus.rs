use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::receiver::Callback;
use crate::receiver::EventBus;
use crate::receiver::HostEvent;

/// Event bus that keeps every redispatched event in order
#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<HostEvent>>,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn as_dyn(self: &Arc<Self>) -> Arc<dyn EventBus> {
        self.clone()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.events.lock().clone()
    }

    pub fn payloads_for(
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

    pub fn count_for(
        &self,
        tag: &str,
    ) -> usize {
        self.payloads_for(tag).len()
    }
}

impl EventBus for RecordingBus {
    fn dispatch(
        &self,
        event: HostEvent,
    ) {
        self.events.lock().push(event);
    }
}

/// Callback that records every payload it is invoked with
#[derive(Clone, Default)]
pub struct RecordingCallback {
    calls: Arc<Mutex<Vec<Value>>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> Callback {
        let calls = self.calls.clone();
        Arc::new(move |payload| calls.lock().push(payload))
    }

    pub fn receiver(&self) -> crate::receiver::Receiver {
        crate::receiver::Receiver::Callback(self.callback())
    }

    pub fn calls(&self) -> Vec<Value> {
        self.calls.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }
}

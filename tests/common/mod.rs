#![allow(dead_code)]

use async_trait::async_trait;
use calendar_dispatch::adapter::{AdapterClient, AdapterError, ToolOutput};
use calendar_dispatch::audit::MemoryAuditSink;
use calendar_dispatch::config::DispatchConfig;
use calendar_dispatch::dispatcher::Dispatcher;
use calendar_dispatch::retry::RetryConfig;
use calendar_dispatch::store::MemoryStore;
use calendar_dispatch::tool::{DeleteEvent, ToolCall, ToolRequest};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Adapter that replays scripted results, then answers `{"deleted": true}`.
pub struct MockAdapter {
    script: Mutex<VecDeque<Result<ToolOutput, AdapterError>>>,
    calls: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockAdapter {
    pub fn new(script: Vec<Result<ToolOutput, AdapterError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::new())
    }

    /// Every execution waits for one permit on `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdapterClient for MockAdapter {
    async fn execute(&self, _call: &ToolCall) -> Result<ToolOutput, AdapterError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"deleted": true})))
    }

    async fn snapshot(&self, _call: &ToolCall) -> Option<Value> {
        Some(json!({"id": "evt", "status": "confirmed"}))
    }
}

pub struct TestPipeline {
    pub dispatcher: Dispatcher,
    pub adapter: Arc<MockAdapter>,
    pub audit: Arc<MemoryAuditSink>,
}

pub fn dispatch_config() -> DispatchConfig {
    DispatchConfig {
        queue_capacity: 16,
        worker_count: 2,
        retry: RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        },
        wait_poll_interval: Duration::from_millis(20),
        sweep_interval: None,
        ..DispatchConfig::default()
    }
}

pub fn start(config: DispatchConfig, adapter: MockAdapter) -> TestPipeline {
    let adapter = Arc::new(adapter);
    let audit = Arc::new(MemoryAuditSink::new());
    let dispatcher = Dispatcher::start(
        config,
        Arc::new(MemoryStore::new()),
        adapter.clone(),
        audit.clone(),
    )
    .unwrap();

    TestPipeline {
        dispatcher,
        adapter,
        audit,
    }
}

pub fn delete_call(calendar_id: &str, event_id: &str) -> ToolCall {
    ToolCall::new(ToolRequest::DeleteEvent(DeleteEvent {
        calendar_id: calendar_id.to_string(),
        event_id: event_id.to_string(),
        send_updates: None,
    }))
}

//! Shared test fixtures: a scripted transport and engine constructors

#![allow(dead_code)]

use async_trait::async_trait;
use resilience_engine::{
    FetchRequest, FetchResponse, MemoryStore, ResilienceConfig, ResilienceEngine, Transport, TransportError,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Recorded failures replayed by report and CLI tests
pub const RECORDED_FAILURES: &str = include_str!("recorded_failures.json");

/// Transport that answers from a queue and records every request
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<FetchResponse, TransportError>>>,
    requests: Mutex<Vec<FetchRequest>>,
    calls: AtomicU32,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<FetchResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn offline() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn push(&self, response: Result<FetchResponse, TransportError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::ConnectionRefused("connection refused".to_string())))
    }
}

pub fn refused() -> Result<FetchResponse, TransportError> {
    Err(TransportError::ConnectionRefused("connection refused".to_string()))
}

pub fn json(body: Value) -> Result<FetchResponse, TransportError> {
    Ok(FetchResponse::json_ok(&body))
}

pub fn html(status: u16) -> Result<FetchResponse, TransportError> {
    Ok(FetchResponse::new(status, Some("text/html; charset=utf-8"), "<!DOCTYPE html><html></html>"))
}

pub fn test_config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.capture.install_panic_hook = false;
    config
}

/// Engine over in-memory storage and the given transport
pub fn engine_with(transport: Arc<ScriptedTransport>) -> (ResilienceEngine, Arc<MemoryStore>) {
    let storage = Arc::new(MemoryStore::new());
    let engine = ResilienceEngine::builder(test_config())
        .transport(transport)
        .storage(storage.clone())
        .build()
        .expect("engine builds");
    (engine, storage)
}

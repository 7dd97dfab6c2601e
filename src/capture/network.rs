use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::CaptureLayer;
use crate::error::TransportError;
use crate::fetch::{FetchRequest, FetchResponse, Transport};

/// Wraps any transport so each exchange is inspected after it completes.
/// The caller still receives the original result unchanged.
pub struct InstrumentedTransport<T> {
    inner: T,
    capture: CaptureLayer,
    unit: Option<String>,
}

impl<T: Transport> InstrumentedTransport<T> {
    pub fn new(inner: T, capture: CaptureLayer) -> Self {
        Self {
            inner,
            capture,
            unit: None,
        }
    }

    /// Attribute captured failures to a unit
    pub fn for_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    fn observe(&self, request: &FetchRequest, result: &Result<FetchResponse, TransportError>) {
        match result {
            Ok(response) => {
                self.capture.capture_http(
                    self.unit.as_deref(),
                    &request.url,
                    response.status,
                    response.content_type.as_deref(),
                    request.expectation,
                );
            }
            Err(error) => {
                self.capture
                    .capture_transport(self.unit.as_deref(), &request.url, error);
            }
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for InstrumentedTransport<T> {
    async fn send(&self, request: &FetchRequest) -> Result<FetchResponse, TransportError> {
        let result = self.inner.send(request).await;
        self.observe(request, &result);
        result
    }
}

impl CaptureLayer {
    /// Event-style request: completion invokes `on_load` or `on_error`.
    ///
    /// The exchange is inspected before the callback runs, exactly as for
    /// [`InstrumentedTransport`].
    pub fn send_with_callbacks<L, E>(
        &self,
        transport: Arc<dyn Transport>,
        request: FetchRequest,
        on_load: L,
        on_error: E,
    ) -> JoinHandle<()>
    where
        L: FnOnce(FetchResponse) + Send + 'static,
        E: FnOnce(TransportError) + Send + 'static,
    {
        let capture = self.clone();
        tokio::spawn(async move {
            let instrumented = InstrumentedTransport::new(transport, capture);
            match instrumented.send(&request).await {
                Ok(response) => on_load(response),
                Err(error) => on_error(error),
            }
        })
    }
}

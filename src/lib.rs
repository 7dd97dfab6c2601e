// Resilience Engine Library - failure capture, classification and self-healing
// This exposes the core components for embedding and integration testing

pub mod capture;
pub mod clients;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod observability;
pub mod recovery;
pub mod storage;
pub mod store;
pub mod telemetry;

// Re-export key types for easy access
pub use capture::{CaptureEvent, CaptureLayer, Console, ConsoleLevel, InstrumentedTransport};
pub use clients::{AuthBootstrapper, Coupon, CouponLoader, Credentials, Session};
pub use config::ResilienceConfig;
pub use diagnostics::{
    Classifier, DiagnosticReport, DiagnosticResult, ErrorCategory, FailureKind, Severity, SystemHealth,
};
pub use engine::{EngineBuilder, ResilienceEngine};
pub use error::{AuthError, EngineError, TransportError};
pub use fetch::{
    FetchOptions, FetchRequest, FetchResponse, LoadOutcome, LoadPhase, PayloadSource, ReqwestTransport,
    ResilientFetcher, Transport,
};
pub use observability::{OperationTimer, ResilienceMetrics, ResilienceStats};
pub use recovery::{EngineSignal, RecoveryContext, RecoveryEngine, RecoveryResult, RecoveryStrategy};
pub use storage::{FileStore, MemoryStore, PersistentStore};
pub use store::{ApplicationHealthState, ErrorRecord, ErrorStore, FallbackMode, Subscription, UnitHealthState};
pub use telemetry::{create_recovery_span, generate_correlation_id, init_telemetry, shutdown_telemetry};

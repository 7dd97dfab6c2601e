use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticResult;
use crate::error::EngineError;
use crate::store::FallbackMode;

/// Everything a strategy may look at, built fresh for each attempt
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryContext {
    pub unit_name: Option<String>,
    pub error_count: u32,
    /// Recent failures of the unit, oldest first
    pub error_history: Vec<DiagnosticResult>,
    pub retry_attempts: u32,
    pub max_retries: u32,
    pub user_agent: String,
    pub url: Option<String>,
    pub session_id: String,
    pub fallback_mode: FallbackMode,
    /// Strategies already applied during the current error streak
    pub applied_strategies: Vec<String>,
}

impl RecoveryContext {
    pub fn has_applied(&self, strategy_id: &str) -> bool {
        self.applied_strategies.iter().any(|id| id == strategy_id)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_attempts >= self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub strategy_id: Option<String>,
    pub message: String,
    pub should_retry: bool,
    /// Overrides the unit's derived fallback mode until its next error
    pub fallback_mode: Option<FallbackMode>,
}

impl RecoveryResult {
    pub fn succeeded(strategy_id: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            strategy_id: Some(strategy_id.to_string()),
            message: message.into(),
            should_retry: false,
            fallback_mode: None,
        }
    }

    pub fn failed(strategy_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            strategy_id: strategy_id.map(str::to_string),
            message: message.into(),
            should_retry: false,
            fallback_mode: None,
        }
    }

    pub fn with_retry(mut self) -> Self {
        self.should_retry = true;
        self
    }

    pub fn with_fallback(mut self, mode: FallbackMode) -> Self {
        self.fallback_mode = Some(mode);
        self
    }
}

/// A pluggable remediation. Lower priority runs first.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn priority(&self) -> u32;
    fn can_apply(&self, error: &DiagnosticResult, context: &RecoveryContext) -> bool;
    async fn apply(&self, error: &DiagnosticResult, context: &RecoveryContext) -> Result<RecoveryResult, EngineError>;

    /// Undo partial effects after `apply` failed
    async fn rollback(&self, _context: &RecoveryContext) -> Result<(), EngineError> {
        Ok(())
    }
}

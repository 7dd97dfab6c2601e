use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::capture::CaptureLayer;
use crate::diagnostics::{DiagnosticResult, ErrorCategory, FailureKind, Severity};
use crate::error::{AuthError, TransportError};
use crate::fetch::{
    FetchOptions, FetchRequest, LoadOutcome, LoadPhase, PayloadSource, ResilientFetcher, ResponseCache, Transport,
};
use crate::storage::{read_validated, PersistentStore, AUTH_KEYS};

pub const AUTH_UNIT: &str = "auth";
pub const SESSION_KEY: &str = "auth_session";
pub const TOKEN_KEY: &str = "auth_token";
pub const SESSION_CACHE_KEY: &str = "cache:auth_session";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.authenticated && self.expires_at.map_or(true, |expires| expires > now)
    }
}

#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Restores or fetches the session at startup and handles sign-in
pub struct AuthBootstrapper {
    base_url: String,
    transport: Arc<dyn Transport>,
    capture: CaptureLayer,
    storage: Arc<dyn PersistentStore>,
    session_fetcher: ResilientFetcher<Session>,
}

impl std::fmt::Debug for AuthBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthBootstrapper")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AuthBootstrapper {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        capture: CaptureLayer,
        storage: Arc<dyn PersistentStore>,
        response_cache: Arc<ResponseCache>,
        options: FetchOptions,
    ) -> Self {
        let session_fetcher = ResilientFetcher::new(
            transport.clone(),
            capture.clone(),
            storage.clone(),
            response_cache,
            options,
            Session::anonymous(),
        );
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
            capture,
            storage,
            session_fetcher,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Session persisted by an earlier sign-in, if it is intact and unexpired
    pub fn stored_session(&self) -> Option<Session> {
        let raw = read_validated(self.storage.as_ref(), SESSION_KEY)?;
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) if session.is_valid_at(Utc::now()) => Some(session),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Discarding undecodable stored session");
                let _ = self.storage.remove(SESSION_KEY);
                None
            }
        }
    }

    /// Restore the stored session, or load it through the resilient fetch
    /// pattern. An unreachable service yields an anonymous session.
    pub async fn bootstrap(&self) -> LoadOutcome<Session> {
        if let Some(session) = self.stored_session() {
            info!(user_id = ?session.user_id, "Restored stored session");
            return LoadOutcome {
                payload: session,
                source: PayloadSource::PersistedCache,
                fallback_mode: false,
                message: None,
                attempts: 0,
                phase: LoadPhase::Success,
            };
        }
        let outcome = self
            .session_fetcher
            .load(FetchRequest::get(self.url("/api/auth/session")))
            .await;
        if outcome.source == PayloadSource::Network && outcome.payload.authenticated {
            self.persist(&outcome.payload);
        }
        outcome
    }

    /// Sign in. Transient failures are retried; rejected credentials are
    /// terminal and never retried.
    pub async fn login(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        let url = self.url("/api/auth/login");
        let options = self.session_fetcher.options();
        let body = serde_json::to_value(credentials).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let request = FetchRequest::post(&url, body).with_timeout(options.timeout);
        let max_attempts = options.max_retries + 1;

        let classifier = self.capture.classifier();
        let mut last_diagnostic = None;
        for attempt in 1..=max_attempts {
            let result = match tokio::time::timeout(options.timeout, self.transport.send(&request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout {
                    timeout_ms: options.timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(response) if response.status == 401 || response.status == 403 => {
                    let diagnostic = classifier.classify_auth_rejection(&url, response.status);
                    self.capture.record(Some(AUTH_UNIT), diagnostic, "auth");
                    warn!(status = response.status, username = %credentials.username, "Login rejected");
                    return Err(AuthError::InvalidCredentials {
                        status: response.status,
                    });
                }
                Ok(response)
                    if response.is_success() && !request.expectation.is_violated_by(response.content_type.as_deref()) =>
                {
                    let session: Session = response.parse().map_err(|e| {
                        self.capture.report_unit_error(
                            AUTH_UNIT,
                            format!("Login response is not a valid session: {e}"),
                            None,
                        );
                        AuthError::Malformed(e.to_string())
                    })?;
                    self.persist(&session);
                    if self.capture.store().snapshot().unit(AUTH_UNIT).is_some() {
                        self.capture.store().mark_recovered(AUTH_UNIT);
                    }
                    info!(user_id = ?session.user_id, attempt, "Login succeeded");
                    return Ok(session);
                }
                Ok(response) => {
                    warn!(status = response.status, attempt, "Login attempt failed");
                    let diagnostic = classifier
                        .classify_http(&url, response.status, response.content_type.as_deref(), request.expectation)
                        .unwrap_or_else(|| {
                            DiagnosticResult::new(
                                ErrorCategory::Api,
                                FailureKind::Unknown,
                                Severity::Medium,
                                format!("Unexpected HTTP {} from {url}", response.status),
                                "Retry later.",
                            )
                        });
                    last_diagnostic = Some(diagnostic);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Login attempt failed");
                    last_diagnostic = Some(classifier.classify_transport(&url, &e));
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(options.backoff(attempt)).await;
            }
        }

        let diagnostic = last_diagnostic
            .unwrap_or_else(|| {
                classifier.classify_transport(&url, &TransportError::Other("no attempt made".to_string()))
            })
            .with_details(json!({ "url": url, "attempts": max_attempts }));
        let message = diagnostic.message.clone();
        self.capture.record(Some(AUTH_UNIT), diagnostic, "auth");
        Err(AuthError::Unavailable(message))
    }

    /// Clear every stored session artifact
    pub fn logout(&self) {
        for key in AUTH_KEYS {
            if let Err(e) = self.storage.remove(key) {
                warn!(key, error = %e, "Failed to clear session entry");
            }
        }
        info!("Signed out");
    }

    fn persist(&self, session: &Session) {
        let stored = serde_json::to_string(session)
            .map_err(crate::error::EngineError::from)
            .and_then(|raw| self.storage.set(SESSION_KEY, &raw));
        if let Err(e) = stored {
            warn!(error = %e, "Failed to persist session");
        }
        if let Some(token) = &session.token {
            if let Err(e) = self.storage.set(TOKEN_KEY, token) {
                warn!(error = %e, "Failed to persist token");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_validity() {
        let now = Utc::now();
        assert!(!Session::anonymous().is_valid_at(now));
        let expired = Session {
            authenticated: true,
            expires_at: Some(now - chrono::Duration::minutes(1)),
            ..Default::default()
        };
        assert!(!expired.is_valid_at(now));
        let open_ended = Session {
            authenticated: true,
            ..Default::default()
        };
        assert!(open_ended.is_valid_at(now));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials {
            username: "ada".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }
}

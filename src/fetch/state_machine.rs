use serde::{Deserialize, Serialize};
use statig::prelude::*;
use std::fmt;

/// Where a single load currently stands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    #[default]
    Idle,
    Loading,
    Success,
    Exhausted,
    FallbackCache,
    FallbackDefault,
}

impl LoadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoadPhase::Success | LoadPhase::FallbackCache | LoadPhase::FallbackDefault
        )
    }
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoadPhase::Idle => "idle",
            LoadPhase::Loading => "loading",
            LoadPhase::Success => "success",
            LoadPhase::Exhausted => "exhausted",
            LoadPhase::FallbackCache => "fallback_cache",
            LoadPhase::FallbackDefault => "fallback_default",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadEvent {
    Begin,
    /// A fresh response-cache entry answered without a network attempt
    FreshCacheHit,
    AttemptFailed { reason: String },
    Loaded,
    CacheServed,
    DefaultServed,
}

/// `Idle -> Loading -> {Success, Exhausted}`, `Exhausted -> FallbackCache | FallbackDefault`
#[derive(Debug, Default)]
pub struct LoadMachine {
    pub url: String,
    pub max_attempts: u32,
    pub attempts: u32,
    pub last_failure: Option<String>,
    phase: LoadPhase,
}

impl LoadMachine {
    pub fn new(url: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            url: url.into(),
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    fn enter(&mut self, phase: LoadPhase) {
        tracing::debug!(url = %self.url, from = %self.phase, to = %phase, "Load phase transition");
        self.phase = phase;
    }
}

#[state_machine(initial = "State::idle()")]
impl LoadMachine {
    #[state]
    fn idle(&mut self, event: &LoadEvent) -> Outcome<State> {
        match event {
            LoadEvent::Begin => {
                self.attempts = 0;
                self.last_failure = None;
                self.enter(LoadPhase::Loading);
                Transition(State::loading())
            }
            LoadEvent::FreshCacheHit => {
                self.enter(LoadPhase::Success);
                Transition(State::success())
            }
            _ => Handled,
        }
    }

    #[state]
    fn loading(&mut self, event: &LoadEvent) -> Outcome<State> {
        match event {
            LoadEvent::AttemptFailed { reason } => {
                self.attempts += 1;
                self.last_failure = Some(reason.clone());
                if self.attempts >= self.max_attempts {
                    self.enter(LoadPhase::Exhausted);
                    Transition(State::exhausted())
                } else {
                    Handled
                }
            }
            LoadEvent::Loaded => {
                self.attempts += 1;
                self.enter(LoadPhase::Success);
                Transition(State::success())
            }
            _ => Handled,
        }
    }

    #[state]
    fn exhausted(&mut self, event: &LoadEvent) -> Outcome<State> {
        match event {
            LoadEvent::CacheServed => {
                self.enter(LoadPhase::FallbackCache);
                Transition(State::fallback_cache())
            }
            LoadEvent::DefaultServed => {
                self.enter(LoadPhase::FallbackDefault);
                Transition(State::fallback_default())
            }
            _ => Handled,
        }
    }

    #[state]
    fn success() -> Outcome<State> {
        Handled
    }

    #[state]
    fn fallback_cache() -> Outcome<State> {
        Handled
    }

    #[state]
    fn fallback_default() -> Outcome<State> {
        Handled
    }
}

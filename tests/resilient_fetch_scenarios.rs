//! End-to-end scenarios for the resilient fetch pattern, driven through the
//! engine with a scripted transport and paused time.

mod fixtures;

use chrono::{Duration as ChronoDuration, Utc};
use fixtures::{engine_with, html, json, refused, ScriptedTransport};
use resilience_engine::clients::{default_coupons, Coupon, COUPONS_CACHE_KEY, COUPONS_UNIT};
use resilience_engine::storage::CachedEnvelope;
use resilience_engine::{ErrorCategory, FailureKind, LoadPhase, PayloadSource, PersistentStore, Severity};
use serde_json::json;
use std::time::Duration;

fn coupons_json() -> serde_json::Value {
    json!([
        { "code": "SPRING20", "discount_percent": 20, "description": "Spring sale" },
        { "code": "FREESHIP", "discount_percent": 5 }
    ])
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_succeed_resets_retry_count() {
    let transport = ScriptedTransport::new(vec![refused(), refused(), json(coupons_json())]);
    let (engine, _storage) = engine_with(transport.clone());
    let loader = engine.coupon_loader("https://shop.example.com");

    let started = tokio::time::Instant::now();
    let outcome = loader.load().await;

    assert_eq!(transport.calls(), 3);
    assert_eq!(outcome.source, PayloadSource::Network);
    assert_eq!(outcome.phase, LoadPhase::Success);
    assert_eq!(outcome.attempts, 3);
    assert!(!outcome.fallback_mode);
    assert_eq!(outcome.payload.len(), 2);
    assert_eq!(outcome.payload[0].code, "SPRING20");

    // Linear backoff: 1s after the first failure, 2s after the second
    assert!(started.elapsed() >= Duration::from_secs(3));

    let status = loader.status();
    assert_eq!(status.retry_count, 0);
    assert!(!status.fallback_mode);
    assert!(status.message.is_none());
    assert!(!engine.is_unit_in_error(COUPONS_UNIT));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_serves_two_hour_old_cache() {
    let transport = ScriptedTransport::offline();
    let (engine, storage) = engine_with(transport.clone());

    let saved = vec![Coupon {
        code: "LOYAL15".to_string(),
        discount_percent: 15,
        expires_at: None,
        description: "Loyalty discount".to_string(),
    }];
    let envelope = CachedEnvelope {
        payload: saved.clone(),
        timestamp: Utc::now() - ChronoDuration::hours(2),
    };
    storage
        .set(COUPONS_CACHE_KEY, &serde_json::to_string(&envelope).unwrap())
        .unwrap();

    let loader = engine.coupon_loader("https://shop.example.com");
    let outcome = loader.load().await;

    assert_eq!(transport.calls(), 3);
    assert_eq!(outcome.source, PayloadSource::PersistedCache);
    assert_eq!(outcome.phase, LoadPhase::FallbackCache);
    assert_eq!(outcome.payload, saved);
    assert!(outcome.fallback_mode);
    let message = outcome.message.unwrap();
    assert!(message.starts_with("Service unavailable"), "{message}");
    assert!(message.contains("120 minutes ago"), "{message}");

    let status = loader.status();
    assert!(status.fallback_mode);
    assert_eq!(status.retry_count, 3);

    // Exactly one diagnostic for the whole exhausted load
    let state = engine.store().snapshot();
    let recorded: Vec<_> = state.unit_errors(COUPONS_UNIT).collect();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].error.category, ErrorCategory::Network);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_without_cache_serves_defaults() {
    let transport = ScriptedTransport::offline();
    let (engine, _storage) = engine_with(transport);
    let outcome = engine.coupon_loader("https://shop.example.com").load().await;

    assert_eq!(outcome.source, PayloadSource::Default);
    assert_eq!(outcome.phase, LoadPhase::FallbackDefault);
    assert_eq!(outcome.payload, default_coupons());
    assert!(outcome.fallback_mode);
    assert!(outcome.message.unwrap().contains("default data"));
}

#[tokio::test(start_paused = true)]
async fn test_round_trip_cache_skips_network() {
    let transport = ScriptedTransport::new(vec![json(coupons_json())]);
    let (engine, storage) = engine_with(transport.clone());
    let loader = engine.coupon_loader("https://shop.example.com");

    let first = loader.load().await;
    assert_eq!(first.source, PayloadSource::Network);
    assert!(storage.get(COUPONS_CACHE_KEY).unwrap().is_some());

    let second = loader.load().await;
    assert_eq!(second.source, PayloadSource::ResponseCache);
    assert_eq!(second.attempts, 0);
    assert_eq!(second.payload, first.payload);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_loaders_for_one_unit_share_the_response_cache() {
    let transport = ScriptedTransport::new(vec![json(coupons_json()), json(coupons_json())]);
    let (engine, _storage) = engine_with(transport.clone());

    let first = engine.coupon_loader("https://shop.example.com").load().await;
    let second = engine.coupon_loader("https://shop.example.com").load().await;

    assert_eq!(first.source, PayloadSource::Network);
    assert_eq!(second.source, PayloadSource::ResponseCache);
    assert_eq!(second.payload, first.payload);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_html_on_api_path_is_a_format_failure() {
    let transport = ScriptedTransport::new(vec![html(200), html(200), html(200)]);
    let (engine, _storage) = engine_with(transport.clone());
    let outcome = engine.coupon_loader("https://shop.example.com").load().await;

    assert_eq!(transport.calls(), 3);
    assert!(outcome.fallback_mode);
    assert_ne!(outcome.source, PayloadSource::Network);
    assert!(outcome.message.unwrap().starts_with("Service unavailable"));

    let state = engine.store().snapshot();
    let record = state.unit_errors(COUPONS_UNIT).last().unwrap();
    assert_eq!(record.error.category, ErrorCategory::Api);
    assert_eq!(record.error.kind, FailureKind::Format);
    assert_eq!(record.error.severity, Severity::High);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_payload_is_a_data_format_error() {
    let duplicate = json!([
        { "code": "DUP", "discount_percent": 10 },
        { "code": "DUP", "discount_percent": 20 }
    ]);
    let transport = ScriptedTransport::new(vec![
        json(duplicate.clone()),
        json(duplicate.clone()),
        json(duplicate),
    ]);
    let (engine, _storage) = engine_with(transport);
    let outcome = engine.coupon_loader("https://shop.example.com").load().await;

    assert_eq!(outcome.payload, default_coupons());
    assert!(outcome.message.unwrap().starts_with("Data format error"));
    let state = engine.store().snapshot();
    let record = state.unit_errors(COUPONS_UNIT).last().unwrap();
    assert_eq!(record.error.category, ErrorCategory::Data);
    assert_eq!(record.error.kind, FailureKind::Validation);
}

#[tokio::test(start_paused = true)]
async fn test_success_after_degraded_load_clears_unit() {
    let transport = ScriptedTransport::offline();
    let (engine, _storage) = engine_with(transport.clone());
    let loader = engine.coupon_loader("https://shop.example.com");

    assert!(loader.load().await.fallback_mode);
    assert!(engine.is_unit_in_error(COUPONS_UNIT));

    transport.push(json(coupons_json()));
    let outcome = loader.load().await;
    assert_eq!(outcome.source, PayloadSource::Network);
    assert!(!engine.is_unit_in_error(COUPONS_UNIT));
    assert!(!loader.status().fallback_mode);
}

#[tokio::test(start_paused = true)]
async fn test_active_coupons_drop_expired_entries() {
    let now = Utc::now();
    let transport = ScriptedTransport::new(vec![json(json!([
        { "code": "LIVE", "discount_percent": 15, "expires_at": now + ChronoDuration::days(3) },
        { "code": "GONE", "discount_percent": 30, "expires_at": now - ChronoDuration::days(1) }
    ]))]);
    let (engine, _storage) = engine_with(transport);
    let outcome = engine
        .coupon_loader("https://shop.example.com")
        .active_coupons(now)
        .await;

    let codes: Vec<&str> = outcome.payload.iter().map(|coupon: &Coupon| coupon.code.as_str()).collect();
    assert_eq!(codes, vec!["LIVE"]);
}

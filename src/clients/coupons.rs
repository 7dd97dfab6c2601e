use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::capture::CaptureLayer;
use crate::fetch::{FetchOptions, FetchRequest, FetchStatus, LoadOutcome, ResilientFetcher, ResponseCache, Transport};
use crate::storage::PersistentStore;

pub const COUPONS_UNIT: &str = "coupons";
pub const COUPONS_CACHE_KEY: &str = "cache:coupons";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub discount_percent: u8,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
}

impl Coupon {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// Offer shown when neither the service nor a saved copy is available
pub fn default_coupons() -> Vec<Coupon> {
    vec![Coupon {
        code: "WELCOME10".to_string(),
        discount_percent: 10,
        expires_at: None,
        description: "10% off your first order".to_string(),
    }]
}

/// Rejects empty or duplicate codes and discounts outside 1..=100
pub fn validate_coupons(coupons: &Vec<Coupon>) -> Result<(), String> {
    let mut seen = HashSet::new();
    for coupon in coupons {
        if coupon.code.trim().is_empty() {
            return Err("coupon with empty code".to_string());
        }
        if !(1..=100).contains(&coupon.discount_percent) {
            return Err(format!(
                "coupon {} has discount {}%",
                coupon.code, coupon.discount_percent
            ));
        }
        if !seen.insert(coupon.code.as_str()) {
            return Err(format!("duplicate coupon code {}", coupon.code));
        }
    }
    Ok(())
}

/// Coupon list client built on the resilient fetch pattern
#[derive(Debug)]
pub struct CouponLoader {
    url: String,
    fetcher: ResilientFetcher<Vec<Coupon>>,
}

impl CouponLoader {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        capture: CaptureLayer,
        storage: Arc<dyn PersistentStore>,
        response_cache: Arc<ResponseCache>,
        options: FetchOptions,
    ) -> Self {
        let base_url = base_url.into();
        let fetcher = ResilientFetcher::new(transport, capture, storage, response_cache, options, default_coupons())
            .with_validator(validate_coupons);
        Self {
            url: format!("{}/api/coupons", base_url.trim_end_matches('/')),
            fetcher,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn load(&self) -> LoadOutcome<Vec<Coupon>> {
        self.fetcher.load(FetchRequest::get(&self.url)).await
    }

    /// Load and drop coupons that have expired at `now`
    pub async fn active_coupons(&self, now: DateTime<Utc>) -> LoadOutcome<Vec<Coupon>> {
        let mut outcome = self.load().await;
        outcome.payload.retain(|coupon| coupon.is_active_at(now));
        outcome
    }

    pub fn status(&self) -> FetchStatus {
        self.fetcher.status()
    }
}

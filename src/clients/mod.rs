//! Data clients that load through the resilient fetch pattern.

pub mod auth;
pub mod coupons;

pub use auth::{AuthBootstrapper, Credentials, Session, AUTH_UNIT};
pub use coupons::{default_coupons, validate_coupons, Coupon, CouponLoader, COUPONS_CACHE_KEY, COUPONS_UNIT};

//! Tollgate - Tiered In-Memory Rate Limiting
//!
//! This crate implements an in-process rate limiter with sliding windows per
//! `(tier, identifier)` key. Repeat offenders are locked out with exponential
//! backoff and flagged as attacks once their penalty or violation count gets
//! high enough. An axum service exposes the limiter over HTTP.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;

//! Turnstile - Multi-Backend Rate Limiting
//!
//! This crate implements a request-throttling engine that enforces
//! "at most N operations per key per time window" across a priority
//! list of storage backends (Redis, Postgres, process memory, local
//! file), failing over automatically when the active backend breaks
//! and failing open when every backend is down.

pub mod config;
pub mod error;
pub mod ratelimit;

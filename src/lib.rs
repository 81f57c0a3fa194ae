//! Ratekeeper - Multi-algorithm Distributed Rate Limiting
//!
//! This crate bounds the rate of operations per logical key (user, IP,
//! route, login attempt) with state shared by every service instance
//! through an external key-value store. Token bucket, sliding window,
//! fixed window and leaky bucket strategies are available, and the
//! read-modify-write of each key's state is made atomic with
//! compare-and-swap on the store.

pub mod clock;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod ratelimit;
pub mod store;

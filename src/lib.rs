//! Ratewarden - Tiered Rate Limiting for HTTP APIs
//!
//! This crate resolves, for every authenticated request, the most specific
//! quota from endpoint, user and role policies (falling back to a configured
//! default), counts the caller's requests inside that quota's window and
//! admits or rejects with `X-RateLimit-*` headers. A separate in-memory
//! fixed-window limiter protects unauthenticated routes.
//!
//! Policies and the request log live behind traits; an in-memory backend and
//! a SQLite backend are provided.

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod ratelimit;

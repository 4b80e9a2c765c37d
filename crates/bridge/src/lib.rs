//! API execution & ingestion bridge.
//!
//! Turns an arbitrary REST or GraphQL API into a policy-gated, queryable tool surface: target
//! descriptors are resolved and cached, every call passes the safety policy before the
//! executor, asynchronous operations are polled to completion, and responses land in a
//! per-session SQLite store that can be post-processed with SQL.
//!
//! Entry points are [`ops::Bridge::query`] and [`ops::Bridge::execute`]; [`server`] exposes
//! them over HTTP with the target bound through request headers.

pub mod binding;
pub mod config;
pub mod error;
pub mod ingest;
pub mod naming;
pub mod ops;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod poll;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod template;

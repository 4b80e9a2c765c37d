//! Outbound HTTP plumbing for the API bridge.
//!
//! This crate is used by:
//! - `unrelated-api-descriptor` (schema / spec fetches)
//! - `unrelated-api-bridge` (planned and explicit call execution)
//!
//! It intentionally contains **no** session state and **no** mutation policy; it only knows how
//! to turn a [`call::CallSpec`] into a classified [`call::CallResult`].

pub mod call;
pub mod error;
pub mod executor;
pub mod glob;
pub mod request;
pub mod retry;
pub mod safety;
pub mod semantics;

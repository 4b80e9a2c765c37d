//! Target descriptors for the API bridge.
//!
//! A descriptor is everything the bridge knows about one upstream API: its kind, the raw
//! schema text (for search), the compact schema context handed to the planner, and the
//! normalized [`capability::CapabilityModel`] used for naming and policy decisions.
//!
//! Descriptors are resolved from an OpenAPI document (URL or file) or a GraphQL introspection
//! query and cached per target by [`cache::DescriptorCache`].

pub mod cache;
pub mod capability;
pub mod context;
pub mod error;
pub mod graphql;
pub mod openapi;
pub mod resolve;
pub mod resolver;
pub mod search;

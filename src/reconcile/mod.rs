//! Reconciliation primitives
//!
//! The pieces every lifecycle handler is composed from:
//!
//! - [`resolver`] - scoped API client and locality from attributes or stored IDs
//! - [`wait`] - the polling combinator driving objects to a terminal status
//! - [`retry`] - transient-state and error-kind retries
//! - [`lookup`] - exact-match lookup over list results
//! - [`marshal`] - schema form to API form and back
//! - [`list_diff`] - keyed diff of managed lists
//! - [`lifecycle`] - declarative kinds and the handlers derived from them
//! - [`datasource`] - lookup data sources

pub mod datasource;
pub mod lifecycle;
pub mod list_diff;
pub mod lookup;
pub mod marshal;
pub mod resolver;
pub mod retry;
pub mod wait;

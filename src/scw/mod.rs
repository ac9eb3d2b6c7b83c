//! Scaleway API interaction module
//!
//! This module provides the transport the lifecycle handlers talk through:
//! credentials, the HTTP client with its retry rules, URL building per product API,
//! list pagination, and the S3 client used by object storage.
//!
//! # Module Structure
//!
//! - [`auth`] - API key pair and format validation
//! - [`client`] - Main client, product API table, and the locality-scoped handle
//! - [`http`] - HTTP utilities with 429/transport retries and cancellation
//! - [`list`] - Paginated list endpoints
//! - [`s3`] - Minimal S3 client (SigV4) for object storage buckets
//!
//! # Example
//!
//! ```ignore
//! use scw_provider::scw::client::{ScwClient, INSTANCE};
//!
//! async fn example(client: ScwClient) -> scw_provider::Result<()> {
//!     let api = client.scoped(INSTANCE, Some("fr-par-1".parse()?), Default::default());
//!     let servers = api.get("servers").await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod http;
pub mod list;
pub mod s3;

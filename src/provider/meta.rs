//! Provider meta and invocation context

use crate::locality::{Locality, Region, Zone};
use crate::error::{Error, Result};
use crate::scw::client::ScwClient;
use crate::scw::s3::{S3Client, DEFAULT_ENDPOINT};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Provider-wide configuration value handed to every handler
#[derive(Clone)]
pub struct Meta {
    pub client: ScwClient,
    pub default_project_id: Option<String>,
    pub default_organization_id: Option<String>,
    pub default_region: Option<Region>,
    pub default_zone: Option<Zone>,
    /// `{region}` is substituted; defaults to the public Scaleway endpoint
    pub s3_endpoint: String,
}

impl Meta {
    pub fn new(client: ScwClient) -> Self {
        Self {
            client,
            default_project_id: None,
            default_organization_id: None,
            default_region: None,
            default_zone: None,
            s3_endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_defaults(
        mut self,
        region: Option<Region>,
        zone: Option<Zone>,
        project_id: Option<String>,
        organization_id: Option<String>,
    ) -> Self {
        self.default_region = region;
        self.default_zone = zone;
        self.default_project_id = project_id;
        self.default_organization_id = organization_id;
        self
    }

    /// Locality defaults as a pair, zone first
    pub fn default_locality(&self) -> Option<Locality> {
        self.default_zone
            .map(Locality::Zone)
            .or(self.default_region.map(Locality::Region))
    }

    /// S3 client for one region; object storage requires credentials
    pub fn s3(&self, region: Region) -> Result<S3Client> {
        let credentials = self
            .client
            .credentials
            .clone()
            .ok_or_else(|| {
                Error::InvalidArgument(
                    "object storage requires an access key and a secret key".into(),
                )
            })?;
        Ok(S3Client::new(
            self.client.http.clone(),
            credentials,
            Some(&self.s3_endpoint),
            region,
        ))
    }
}

/// Ambient context of one handler invocation
///
/// Carries the cancellation signal and the operation deadline. Every REST call, wait
/// and retry observes both.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl Context {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Same cancellation, deadline tightened to `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_only_tightens() {
        let ctx = Context::default().with_timeout(Duration::from_secs(60));
        let inner = ctx.with_timeout(Duration::from_secs(600));
        assert_eq!(inner.deadline(), ctx.deadline());
        let tighter = ctx.with_timeout(Duration::from_secs(10));
        assert!(tighter.deadline() < ctx.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let ctx = Context::default().with_timeout(Duration::from_secs(5));
        assert!(!ctx.is_expired());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_default_locality_prefers_zone() {
        let meta = Meta::new(ScwClient::new(None, None).unwrap()).with_defaults(
            Some(Region::NlAms),
            Some(Zone::FrPar2),
            None,
            None,
        );
        assert_eq!(meta.default_locality(), Some(Locality::Zone(Zone::FrPar2)));
    }
}

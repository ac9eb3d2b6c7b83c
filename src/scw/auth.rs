//! Scaleway credentials
//!
//! Scaleway authenticates API calls with a static secret key sent in the
//! `X-Auth-Token` header; the access key is only needed for S3 request signing.

use crate::error::{Error, Result};
use std::fmt;

/// API key pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
}

impl Credentials {
    /// Validate and build a key pair
    /// Security: error messages never echo the secret key
    pub fn new(access_key: &str, secret_key: &str) -> Result<Self> {
        if !validate_access_key(access_key) {
            return Err(Error::InvalidArgument(
                "invalid access key format, expected SCWXXXXXXXXXXXXXXXXX".to_string(),
            ));
        }
        if !is_uuid(secret_key) {
            return Err(Error::InvalidArgument(
                "invalid secret key format, expected a UUID".to_string(),
            ));
        }

        Ok(Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }

    /// Value of the `X-Auth-Token` header
    pub fn token(&self) -> &str {
        &self.secret_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Validate an access key format
/// Access keys are `SCW` followed by 17 uppercase letters or digits
pub fn validate_access_key(access_key: &str) -> bool {
    access_key.len() == 20
        && access_key.starts_with("SCW")
        && access_key[3..]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Project, organization and secret key identifiers are all UUIDs
pub fn is_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCESS: &str = "SCWABCDEFGHIJ0123456";
    const SECRET: &str = "11111111-2222-3333-4444-555555555555";

    #[test]
    fn test_valid_credentials() {
        let creds = Credentials::new(ACCESS, SECRET).unwrap();
        assert_eq!(creds.access_key(), ACCESS);
        assert_eq!(creds.token(), SECRET);
    }

    #[test]
    fn test_invalid_keys_are_rejected_without_echo() {
        let err = Credentials::new(ACCESS, "not-a-secret").unwrap_err();
        assert!(!err.to_string().contains("not-a-secret"));
        assert!(Credentials::new("SCWshort", SECRET).is_err());
        assert!(Credentials::new("ABCABCDEFGHIJ0123456", SECRET).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let creds = Credentials::new(ACCESS, SECRET).unwrap();
        let debug = format!("{:?}", creds);
        assert!(!debug.contains(SECRET));
        assert!(debug.contains("<redacted>"));
    }
}

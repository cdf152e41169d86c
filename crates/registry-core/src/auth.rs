//! Digest authentication credentials.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::StoreError;

/// Authentication scheme used for digest credentials.
pub const DIGEST_SCHEME: &str = "digest";

/// Authentication info handed to the driver when a session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub scheme: String,
    pub credential: Vec<u8>,
}

/// A `user:password` digest credential.
#[derive(Clone, PartialEq, Eq)]
pub struct DigestCredential {
    user: String,
    password: String,
}

impl std::fmt::Debug for DigestCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestCredential")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl DigestCredential {
    /// Parse a `user:password` string. The password may contain `:`.
    ///
    /// # Errors
    /// Returns `BadArguments` if there is no `:` or the user is empty.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        match raw.split_once(':') {
            Some((user, password)) if !user.is_empty() => Ok(Self {
                user: user.to_string(),
                password: password.to_string(),
            }),
            _ => Err(StoreError::BadArguments(
                "digest credential must look like user:password".to_string(),
            )),
        }
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The ACL identity for this credential: `user:base64(sha1(user:password))`.
    #[must_use]
    pub fn identity(&self) -> String {
        let hash = Sha1::digest(format!("{}:{}", self.user, self.password).as_bytes());
        format!("{}:{}", self.user, BASE64.encode(hash))
    }

    /// Auth info for the driver.
    #[must_use]
    pub fn auth_info(&self) -> AuthInfo {
        AuthInfo {
            scheme: DIGEST_SCHEME.to_string(),
            credential: format!("{}:{}", self.user, self.password).into_bytes(),
        }
    }

    /// Rebuild a credential from driver auth info.
    ///
    /// # Errors
    /// Returns `BadArguments` for an unknown scheme or malformed credential.
    pub fn from_auth_info(info: &AuthInfo) -> Result<Self, StoreError> {
        if info.scheme != DIGEST_SCHEME {
            return Err(StoreError::BadArguments(format!(
                "unsupported auth scheme: {}",
                info.scheme
            )));
        }
        let raw = String::from_utf8(info.credential.clone())
            .map_err(|e| StoreError::BadArguments(format!("malformed digest credential: {e}")))?;
        Self::parse(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_matches_zookeeper_digest() {
        // Well-known digest of super:test.
        let cred = DigestCredential::parse("super:test").unwrap();
        assert_eq!(cred.identity(), "super:D/InIHSb7yEEbrWz8b9l71RjZJU=");
    }

    #[test]
    fn test_password_may_contain_colon() {
        let cred = DigestCredential::parse("user:pa:ss").unwrap();
        assert_eq!(cred.user(), "user");
        let info = cred.auth_info();
        assert_eq!(info.credential, b"user:pa:ss");
        assert_eq!(DigestCredential::from_auth_info(&info).unwrap(), cred);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(DigestCredential::parse("nopassword").is_err());
        assert!(DigestCredential::parse(":secret").is_err());
    }

    #[test]
    fn test_debug_hides_password() {
        let cred = DigestCredential::parse("user:hunter2").unwrap();
        assert!(!format!("{cred:?}").contains("hunter2"));
    }
}

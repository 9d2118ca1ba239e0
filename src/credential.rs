//! Bearer credential storage and best-effort claim decoding.
//!
//! Decoding is a UX hint only: no signature or expiry check happens here and
//! the decoded admin flag must never stand in for a server-side decision.

use std::collections::HashSet;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::storage::LocalStore;

const TOKEN_KEY: &str = "token";

/// Unverified claim set carried in the token's middle segment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Subject (user) id.
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "admin", alias = "isAdmin")]
    pub is_admin: bool,
    /// Unix seconds. Informational only.
    #[serde(default)]
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("token is not three dot-separated segments")]
    Malformed,
    /// Header or payload segment did not decode.
    #[error("token could not be decoded: {0}")]
    Payload(String),
    #[error("token carries no subject")]
    MissingSubject,
}

/// Total function: every input yields claims or a `DecodeError`.
///
/// The header segment must decode too and name an algorithm jsonwebtoken
/// knows (`none` is not one), so a token with a readable payload but a
/// broken header counts as undecodable.
pub fn decode_claims(token: &str) -> std::result::Result<Claims, DecodeError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 || segments[1].is_empty() {
        return Err(DecodeError::Malformed);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = decode::<Claims>(token.trim(), &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| DecodeError::Payload(e.to_string()))?;
    if data.claims.sub.is_empty() {
        return Err(DecodeError::MissingSubject);
    }
    Ok(data.claims)
}

/// A stored bearer token together with its decoded claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub claims: Claims,
}

#[derive(Clone)]
pub struct CredentialStore {
    store: LocalStore,
}

impl CredentialStore {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// The current credential, or `None` when absent or undecodable.
    pub fn get(&self) -> Option<Credential> {
        let raw = match self.store.get_credential(TOKEN_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "credential store unreadable, treating as logged out");
                return None;
            }
        };
        let token = String::from_utf8(raw).ok()?;
        match decode_claims(&token) {
            Ok(claims) => Some(Credential { token, claims }),
            Err(e) => {
                tracing::debug!(error = %e, "stored credential did not decode");
                None
            }
        }
    }

    pub fn set(&self, token: &str) -> Result<()> {
        self.store.put_credential(TOKEN_KEY, token.trim().as_bytes())
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove_credential(TOKEN_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mint_token;

    #[test]
    fn decodes_payload_without_verifying_signature() {
        let token = mint_token("u-1", "a@example.com", true);
        let claims = decode_claims(&token).expect("claims");
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.email, "a@example.com");
        assert!(claims.is_admin);

        // Tampered signature still decodes: the server is the only verifier
        let forged = format!("{}.forged", token.rsplit_once('.').unwrap().0);
        assert!(decode_claims(&forged).is_ok());
    }

    #[test]
    fn malformed_tokens_are_decode_errors() {
        assert_eq!(decode_claims(""), Err(DecodeError::Malformed));
        assert_eq!(decode_claims("only.two"), Err(DecodeError::Malformed));
        assert_eq!(decode_claims("a..c"), Err(DecodeError::Malformed));
        assert!(matches!(decode_claims("a.b.c.d"), Err(DecodeError::Malformed)));
        // Middle segment not base64
        assert!(matches!(
            decode_claims("eyJhbGciOiJIUzI1NiJ9.%%%.sig"),
            Err(DecodeError::Payload(_))
        ));
        // Middle segment base64 but not JSON ("hello")
        assert!(matches!(
            decode_claims("eyJhbGciOiJIUzI1NiJ9.aGVsbG8.sig"),
            Err(DecodeError::Payload(_))
        ));
    }

    #[test]
    fn header_must_name_a_known_algorithm() {
        let token = mint_token("u-1", "a@example.com", false);
        let mut parts = token.split('.');
        let (_, payload, sig) = (parts.next().unwrap(), parts.next().unwrap(), parts.next().unwrap());

        // {"alg":"RS256"}: any known algorithm is fine, nothing is verified
        let rs256 = format!("eyJhbGciOiJSUzI1NiJ9.{payload}.{sig}");
        assert_eq!(decode_claims(&rs256).unwrap().sub, "u-1");

        // {"alg":"none"}, {} and a non-base64 header
        for header in ["eyJhbGciOiJub25lIn0", "e30", "%%%"] {
            let token = format!("{header}.{payload}.{sig}");
            assert!(matches!(decode_claims(&token), Err(DecodeError::Payload(_))), "{header}");
        }
    }

    #[test]
    fn undecodable_credential_reads_as_absent() {
        let store = CredentialStore::new(LocalStore::temporary().unwrap());
        assert!(store.get().is_none());

        store.set("not-a-token").unwrap();
        assert!(store.get().is_none());

        let token = mint_token("u-2", "b@example.com", false);
        store.set(&token).unwrap();
        let cred = store.get().expect("credential");
        assert_eq!(cred.claims.sub, "u-2");
        assert!(!cred.claims.is_admin);

        store.clear().unwrap();
        assert!(store.get().is_none());
    }
}

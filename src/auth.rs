//! Bearer tokens for the signaling socket.
//!
//! A token is an HS256 JWT whose `sub` is the participant id. It is validated
//! once when the socket connects and the resulting [`Identity`] stays attached
//! to that socket for its whole lifetime.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::protocol::PresenceInfo;

/// The authenticated user, as provided by the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
  pub id: String,
  pub display_name: Option<String>,
  pub photo_url: Option<String>,
}

impl Identity {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      display_name: None,
      photo_url: None,
    }
  }

  pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
    self.display_name = Some(name.into());
    self
  }

  pub fn with_photo_url(mut self, url: impl Into<String>) -> Self {
    self.photo_url = Some(url.into());
    self
  }

  pub fn presence(&self) -> PresenceInfo {
    PresenceInfo {
      participant_id: self.id.clone(),
      display_name: self.display_name.clone(),
      photo_url: self.photo_url.clone(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
  pub sub: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub picture: Option<String>,
  pub exp: i64,
}

impl Claims {
  pub fn for_identity(identity: &Identity, ttl_seconds: i64) -> Self {
    let exp = Utc::now()
      .checked_add_signed(Duration::seconds(ttl_seconds))
      .unwrap_or_else(Utc::now)
      .timestamp();
    Self {
      sub: identity.id.clone(),
      name: identity.display_name.clone(),
      picture: identity.photo_url.clone(),
      exp,
    }
  }
}

impl From<Claims> for Identity {
  fn from(claims: Claims) -> Self {
    Identity {
      id: claims.sub,
      display_name: claims.name,
      photo_url: claims.picture,
    }
  }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuthError {
  #[error("authentication token missing")]
  Missing,

  #[error("token has expired")]
  Expired,

  #[error("invalid token signature")]
  InvalidSignature,

  #[error("invalid token: {0}")]
  Invalid(String),

  #[error("token generation failed: {0}")]
  Generation(String),
}

#[derive(Clone)]
pub struct TokenValidator {
  secret: String,
}

impl TokenValidator {
  pub fn new(secret: impl Into<String>) -> Self {
    Self { secret: secret.into() }
  }

  pub fn validate(&self, token: &str) -> Result<Identity, AuthError> {
    let token = token.trim();
    if token.is_empty() {
      return Err(AuthError::Missing);
    }
    let key = DecodingKey::from_secret(self.secret.as_bytes());
    let mut validation = Validation::default();
    validation.leeway = 0;

    let data = decode::<Claims>(token, &key, &validation).map_err(|err| match err.kind() {
      jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
      jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidSignature,
      _ => AuthError::Invalid(err.to_string()),
    })?;

    if data.claims.sub.trim().is_empty() {
      return Err(AuthError::Invalid("empty subject".to_string()));
    }
    Ok(data.claims.into())
  }

  pub fn issue(&self, identity: &Identity, ttl_seconds: i64) -> Result<String, AuthError> {
    self.issue_claims(&Claims::for_identity(identity, ttl_seconds))
  }

  pub fn issue_claims(&self, claims: &Claims) -> Result<String, AuthError> {
    let key = EncodingKey::from_secret(self.secret.as_bytes());
    encode(&Header::default(), claims, &key).map_err(|err| AuthError::Generation(err.to_string()))
  }
}

/// Reads the identity a token claims without checking its signature. Clients
/// use this to learn their own id; only the server's [`TokenValidator`]
/// decides whether the token is genuine.
pub fn peek_identity(token: &str) -> Result<Identity, AuthError> {
  let mut validation = Validation::default();
  validation.insecure_disable_signature_validation();
  validation.validate_exp = false;

  let data = decode::<Claims>(token.trim(), &DecodingKey::from_secret(&[]), &validation)
    .map_err(|err| AuthError::Invalid(err.to_string()))?;
  if data.claims.sub.trim().is_empty() {
    return Err(AuthError::Invalid("empty subject".to_string()));
  }
  Ok(data.claims.into())
}

/// Pulls a bearer token out of an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
  let (scheme, token) = header.trim().split_once(' ')?;
  if !scheme.eq_ignore_ascii_case("bearer") {
    return None;
  }
  let token = token.trim();
  (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
  use super::*;

  const SECRET: &str = "unit-test-secret";

  #[test]
  fn test_issue_and_validate() {
    let validator = TokenValidator::new(SECRET);
    let identity = Identity::new("u-1").with_display_name("Ada");

    let token = validator.issue(&identity, 60).unwrap();
    assert_eq!(validator.validate(&token).unwrap(), identity);
  }

  #[test]
  fn test_expired_token() {
    let validator = TokenValidator::new(SECRET);
    let claims = Claims {
      sub: "u-1".into(),
      name: None,
      picture: None,
      exp: Utc::now().timestamp() - 5,
    };
    let token = validator.issue_claims(&claims).unwrap();

    assert_eq!(validator.validate(&token).unwrap_err(), AuthError::Expired);
  }

  #[test]
  fn test_wrong_secret_and_garbage() {
    let token = TokenValidator::new(SECRET).issue(&Identity::new("u-1"), 60).unwrap();
    let other = TokenValidator::new("another-secret");

    assert_eq!(other.validate(&token).unwrap_err(), AuthError::InvalidSignature);
    assert!(matches!(other.validate("not-a-jwt"), Err(AuthError::Invalid(_))));
    assert_eq!(other.validate("  "), Err(AuthError::Missing));
  }

  #[test]
  fn test_peek_identity_skips_signature() {
    let token = TokenValidator::new(SECRET)
      .issue(&Identity::new("u-7").with_photo_url("https://img.example/u7.png"), 60)
      .unwrap();

    let identity = peek_identity(&token).unwrap();
    assert_eq!(identity.id, "u-7");
    assert_eq!(identity.photo_url.as_deref(), Some("https://img.example/u7.png"));
    assert!(peek_identity("garbage").is_err());
  }

  #[test]
  fn test_bearer_header() {
    assert_eq!(bearer_token("Bearer abc.def"), Some("abc.def"));
    assert_eq!(bearer_token("bearer   xyz "), Some("xyz"));
    assert_eq!(bearer_token("Basic abc"), None);
    assert_eq!(bearer_token("Bearer"), None);
  }
}

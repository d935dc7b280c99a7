//! Boundary with the authentication collaborator.
//!
//! This crate never mints or verifies tokens. It reads the current bearer
//! token through [`CredentialStore`], inspects the unverified JWT claims only
//! to avoid connecting with a token the server will reject anyway, and asks
//! the collaborator to forget the token when the session expires.

use std::sync::Mutex;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use zeroize::Zeroize;

/// Decoded identity of the logged-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Subject claim (the user's e-mail on the PFCAM backend).
    pub subject: String,
    /// Numeric user id, when the application knows it.
    pub numeric_id: Option<i64>,
}

impl Identity {
    /// Identity with a subject and numeric id.
    #[must_use]
    pub fn new(subject: impl Into<String>, numeric_id: Option<i64>) -> Self {
        Self {
            subject: subject.into(),
            numeric_id,
        }
    }

    /// Path segment identifying this user on the notification endpoint.
    ///
    /// Prefers the numeric id; falls back to the percent-encoded subject.
    #[must_use]
    pub fn endpoint_id(&self) -> String {
        match self.numeric_id {
            Some(id) => id.to_string(),
            None => urlencoding::encode(&self.subject).into_owned(),
        }
    }
}

/// Source of the bearer token, owned by the authentication collaborator.
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
    /// Current bearer token, if logged in.
    fn token(&self) -> Option<String>;

    /// Forget the token (logout or forced expiry).
    fn clear(&self);
}

/// In-memory credential holder.
///
/// The token is zeroized when cleared or replaced.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: Mutex<Option<String>>,
}

impl StaticCredentials {
    /// Holder pre-loaded with `token`.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Mutex::new(token.filter(|t| !t.is_empty())),
        }
    }

    /// Replace the stored token (login / refresh).
    pub fn set(&self, token: String) {
        let mut slot = self.lock();
        if let Some(old) = slot.as_mut() {
            old.zeroize();
        }
        *slot = Some(token);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CredentialStore for StaticCredentials {
    fn token(&self) -> Option<String> {
        self.lock().clone()
    }

    fn clear(&self) {
        let mut slot = self.lock();
        if let Some(old) = slot.as_mut() {
            old.zeroize();
        }
        *slot = None;
    }
}

/// Claims read from a JWT payload without verifying the signature.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Subject.
    #[serde(default)]
    pub sub: Option<String>,
    /// Expiry, seconds since the Unix epoch.
    #[serde(default)]
    pub exp: Option<i64>,
    /// Set on the short-lived token issued before MFA completes.
    #[serde(default)]
    pub temp: Option<bool>,
}

/// Errors that can occur while decoding token claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimsError {
    /// The token does not have three dot-separated segments.
    NotAJwt,
    /// The payload segment is not valid base64url.
    Base64(String),
    /// The payload is not a JSON claims object.
    Json(String),
}

impl std::fmt::Display for ClaimsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAJwt => write!(f, "token is not a JWT"),
            Self::Base64(msg) => write!(f, "invalid base64 in token payload: {msg}"),
            Self::Json(msg) => write!(f, "invalid token claims: {msg}"),
        }
    }
}

impl std::error::Error for ClaimsError {}

impl Claims {
    /// Decode the payload segment of `token`.
    ///
    /// No signature check is performed; the result is advisory.
    pub fn decode_unverified(token: &str) -> Result<Self, ClaimsError> {
        let mut segments = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(ClaimsError::NotAJwt);
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| ClaimsError::Base64(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ClaimsError::Json(e.to_string()))
    }

    /// Expiry instant, if the token carries one.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    /// Whether the token has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|exp| exp <= now)
    }
}

/// Why a token cannot be used to open the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    /// No token is present.
    Missing,
    /// The JWT `exp` claim has passed.
    Expired,
    /// The token is a pre-MFA temporary token.
    Temporary,
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "no token present"),
            Self::Expired => write!(f, "token expired"),
            Self::Temporary => write!(f, "temporary MFA token"),
        }
    }
}

/// Check whether `token` is worth presenting to the server at `now`.
///
/// Opaque (non-JWT) tokens are accepted as-is.
pub fn check_token(token: Option<&str>, now: DateTime<Utc>) -> Result<(), TokenRejection> {
    let token = token.filter(|t| !t.trim().is_empty()).ok_or(TokenRejection::Missing)?;

    match Claims::decode_unverified(token) {
        Ok(claims) if claims.temp == Some(true) => Err(TokenRejection::Temporary),
        Ok(claims) if claims.is_expired(now) => Err(TokenRejection::Expired),
        Ok(_) => Ok(()),
        Err(e) => {
            log::trace!("[Auth] Treating token as opaque: {}", e);
            Ok(())
        }
    }
}

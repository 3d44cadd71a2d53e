//! Signed, expiry-bound URLs for proxied transfers.
//!
//! A signed URL authorizes one operation on one path until its expiry:
//!
//! ```text
//! {base}?path={path}&expireTime={unix-seconds}&sign={HMAC-SHA256(key, "{path}-{expireTime}")}
//! ```
//!
//! Nothing is stored server side. Verification recomputes the tag and
//! compares it in constant time, then checks the expiry against the clock.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use subtle::ConstantTimeEq;

use crate::{DrivePath, Error, Result, SensitiveBytes};

type HmacSha256 = Hmac<Sha256>;

/// Validity of upload and delete URLs.
pub const WRITE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Validity of download URLs handed to clients.
pub const DOWNLOAD_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Validity of ephemeral read links (backend-presigned redirects).
pub const READ_TTL: Duration = Duration::from_secs(15 * 60);

/// Query parameter names.
pub const PATH_PARAM: &str = "path";
pub const EXPIRE_PARAM: &str = "expireTime";
pub const SIGN_PARAM: &str = "sign";

/// Characters escaped in query values; path separators stay readable.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Per-driver shared secret used to sign transfer URLs.
#[derive(Clone)]
pub struct SigningKey(SensitiveBytes);

impl SigningKey {
    /// Create a signing key.
    ///
    /// # Errors
    /// - Key is empty
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::InvalidInput("Signing key cannot be empty".to_string()));
        }
        Ok(Self(SensitiveBytes::new(key)))
    }

    fn tag(&self, path: &str, expire_time: &str) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(self.0.as_bytes())
            .map_err(|e| Error::InvalidInput(format!("Invalid signing key: {}", e)))?;
        mac.update(format!("{}-{}", path, expire_time).as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey({:?})", self.0)
    }
}

/// The three signed query parameters of a transfer URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub path: String,
    pub expire_time: String,
    pub sign: String,
}

impl SignedUrl {
    /// Mint a token for `path` valid for `ttl` from now.
    pub fn mint(key: &SigningKey, path: &DrivePath, ttl: Duration) -> Result<Self> {
        Self::mint_at(key, path, ttl, Utc::now())
    }

    /// Mint a token as of `now`.
    pub fn mint_at(
        key: &SigningKey,
        path: &DrivePath,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let path = path.to_string_path();
        let expire_time = (now.timestamp() + ttl.as_secs() as i64).to_string();
        let sign = URL_SAFE_NO_PAD.encode(key.tag(&path, &expire_time)?);
        Ok(Self {
            path,
            expire_time,
            sign,
        })
    }

    /// Mint a token and render it onto `base`.
    pub fn sign(key: &SigningKey, base: &str, path: &DrivePath, ttl: Duration) -> Result<String> {
        Ok(Self::mint(key, path, ttl)?.to_url(base))
    }

    /// Render as `{base}?path=..&expireTime=..&sign=..`.
    pub fn to_url(&self, base: &str) -> String {
        format!(
            "{}?{}={}&{}={}&{}={}",
            base,
            PATH_PARAM,
            utf8_percent_encode(&self.path, QUERY_VALUE),
            EXPIRE_PARAM,
            self.expire_time,
            SIGN_PARAM,
            self.sign
        )
    }

    /// Extract the signed parameters from decoded query pairs.
    ///
    /// # Errors
    /// - `MissingParameter` naming the first absent or empty parameter
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            query
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| Error::MissingParameter(name.to_string()))
        };
        Ok(Self {
            path: get(PATH_PARAM)?,
            expire_time: get(EXPIRE_PARAM)?,
            sign: get(SIGN_PARAM)?,
        })
    }

    /// Verify against the current clock and return the authorized path.
    pub fn verify(&self, key: &SigningKey) -> Result<DrivePath> {
        self.verify_at(key, Utc::now())
    }

    /// Verify as of `now`.
    ///
    /// The signature is checked before the expiry, so any tampering with the
    /// three parameters reports `SignatureInvalid` and only an authentic but
    /// stale token reports `LinkExpired`.
    pub fn verify_at(&self, key: &SigningKey, now: DateTime<Utc>) -> Result<DrivePath> {
        let expected = key.tag(&self.path, &self.expire_time)?;
        let provided = URL_SAFE_NO_PAD
            .decode(self.sign.as_bytes())
            .map_err(|_| Error::SignatureInvalid)?;
        if !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(Error::SignatureInvalid);
        }

        let expiry: i64 = self
            .expire_time
            .parse()
            .map_err(|_| Error::SignatureInvalid)?;
        if expiry <= now.timestamp() {
            return Err(Error::LinkExpired);
        }

        DrivePath::parse(&self.path)
    }
}

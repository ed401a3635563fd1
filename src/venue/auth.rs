//! HMAC-SHA256 request signing for the venue API.
//!
//! Grounded on the sibling CoinDCX client's auth module: the signature is
//! computed over the serialized request body using the API secret as the
//! HMAC key, then hex-encoded and sent as a header alongside the API key.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Sign a request body with the API secret.
pub fn sign_request(body: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any size");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// API credentials container.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn from_env() -> Result<Self, std::env::VarError> {
        Ok(Self::new(
            std::env::var("VENUE_API_KEY")?,
            std::env::var("VENUE_API_SECRET")?,
        ))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn sign(&self, body: &str) -> String {
        sign_request(body, &self.api_secret)
    }
}

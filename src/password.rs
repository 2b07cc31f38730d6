//! Credential decoding for connection and key store passwords
//!
//! Passwords held in configuration may be written in clear text or in one of
//! the encoded forms below. Decoding happens while connect options are built,
//! so a malformed secret surfaces as a configuration error before any network
//! traffic.
//!
//! | Form            | Meaning                                   |
//! |-----------------|-------------------------------------------|
//! | `PW:<base64>`   | base64 encoded UTF-8 secret               |
//! | `ENV:<NAME>`    | value of the named environment variable   |
//! | anything else   | used verbatim                             |

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

const ENCODED_PREFIX: &str = "PW:";
const ENV_PREFIX: &str = "ENV:";

/// Failures while turning an encoded secret into clear text
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PasswordError {
    #[error("Encoded password is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("Encoded password is not valid UTF-8")]
    InvalidUtf8,
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
}

/// Decode a configured password into its clear-text value
pub fn decode(value: &str) -> Result<String, PasswordError> {
    if let Some(encoded) = value.strip_prefix(ENCODED_PREFIX) {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| PasswordError::InvalidEncoding(e.to_string()))?;
        return String::from_utf8(bytes).map_err(|_| PasswordError::InvalidUtf8);
    }

    if let Some(name) = value.strip_prefix(ENV_PREFIX) {
        return std::env::var(name.trim())
            .map_err(|_| PasswordError::EnvVarNotFound(name.trim().to_string()));
    }

    Ok(value.to_string())
}

/// Encode a clear-text password into the `PW:` form
pub fn encode(plain: &str) -> String {
    format!("{ENCODED_PREFIX}{}", STANDARD.encode(plain.as_bytes()))
}

/// Whether the value uses one of the encoded forms
pub fn is_encoded(value: &str) -> bool {
    value.starts_with(ENCODED_PREFIX) || value.starts_with(ENV_PREFIX)
}

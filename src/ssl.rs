//! TLS property mapping
//!
//! Connection configuration carries TLS settings as ordered name/value pairs
//! using the familiar key store vocabulary (`trustStore`, `keyStorePassword`,
//! ...). Each recognised name maps to exactly one native `ssl.<name>` key in
//! an [`SslContextProperties`] set, which the transport turns into a TLS
//! configuration. Names are matched case-insensitively; unknown names are
//! skipped with a trace log and never fail the build.

use crate::config::KeyValuePairSet;
use crate::password::{self, PasswordError};
use std::collections::BTreeMap;
use tracing::trace;

/// Native property keys understood by the transport
pub mod keys {
    pub const PROTOCOL: &str = "ssl.protocol";
    pub const CONTEXT_PROVIDER: &str = "ssl.contextProvider";
    pub const KEY_STORE: &str = "ssl.keyStore";
    pub const KEY_STORE_PASSWORD: &str = "ssl.keyStorePassword";
    pub const KEY_STORE_TYPE: &str = "ssl.keyStoreType";
    pub const KEY_STORE_PROVIDER: &str = "ssl.keyStoreProvider";
    pub const TRUST_STORE: &str = "ssl.trustStore";
    pub const TRUST_STORE_PASSWORD: &str = "ssl.trustStorePassword";
    pub const TRUST_STORE_TYPE: &str = "ssl.trustStoreType";
    pub const TRUST_STORE_PROVIDER: &str = "ssl.trustStoreProvider";
    pub const ENABLED_CIPHER_SUITES: &str = "ssl.enabledCipherSuites";
    pub const KEY_MANAGER: &str = "ssl.keyManager";
    pub const TRUST_MANAGER: &str = "ssl.trustManager";
}

/// Recognised TLS property names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SslProperty {
    Protocol,
    ContextProvider,
    KeyStore,
    KeyStorePassword,
    KeyStoreType,
    KeyStoreProvider,
    TrustStore,
    TrustStorePassword,
    TrustStoreType,
    TrustStoreProvider,
    EnabledCipherSuites,
    KeyManager,
    TrustManager,
    /// Fallback for unrecognised names; applying it changes nothing
    Default,
}

struct Mapping {
    property: SslProperty,
    name: &'static str,
    native_key: &'static str,
    secret: bool,
}

const MAPPINGS: &[Mapping] = &[
    Mapping { property: SslProperty::Protocol, name: "protocol", native_key: keys::PROTOCOL, secret: false },
    Mapping { property: SslProperty::ContextProvider, name: "contextProvider", native_key: keys::CONTEXT_PROVIDER, secret: false },
    Mapping { property: SslProperty::KeyStore, name: "keyStore", native_key: keys::KEY_STORE, secret: false },
    Mapping { property: SslProperty::KeyStorePassword, name: "keyStorePassword", native_key: keys::KEY_STORE_PASSWORD, secret: true },
    Mapping { property: SslProperty::KeyStoreType, name: "keyStoreType", native_key: keys::KEY_STORE_TYPE, secret: false },
    Mapping { property: SslProperty::KeyStoreProvider, name: "keyStoreProvider", native_key: keys::KEY_STORE_PROVIDER, secret: false },
    Mapping { property: SslProperty::TrustStore, name: "trustStore", native_key: keys::TRUST_STORE, secret: false },
    Mapping { property: SslProperty::TrustStorePassword, name: "trustStorePassword", native_key: keys::TRUST_STORE_PASSWORD, secret: true },
    Mapping { property: SslProperty::TrustStoreType, name: "trustStoreType", native_key: keys::TRUST_STORE_TYPE, secret: false },
    Mapping { property: SslProperty::TrustStoreProvider, name: "trustStoreProvider", native_key: keys::TRUST_STORE_PROVIDER, secret: false },
    Mapping { property: SslProperty::EnabledCipherSuites, name: "enabledCipherSuites", native_key: keys::ENABLED_CIPHER_SUITES, secret: false },
    Mapping { property: SslProperty::KeyManager, name: "keyManager", native_key: keys::KEY_MANAGER, secret: false },
    Mapping { property: SslProperty::TrustManager, name: "trustManager", native_key: keys::TRUST_MANAGER, secret: false },
];

impl SslProperty {
    /// Resolve a configured name, ignoring case
    pub fn from_name(name: &str) -> Self {
        match MAPPINGS.iter().find(|m| m.name.eq_ignore_ascii_case(name.trim())) {
            Some(mapping) => mapping.property,
            None => {
                trace!("Ignoring unsupported SSL property [{}]", name);
                SslProperty::Default
            }
        }
    }

    fn mapping(&self) -> Option<&'static Mapping> {
        MAPPINGS.iter().find(|m| m.property == *self)
    }

    /// Canonical configuration name
    pub fn name(&self) -> &'static str {
        self.mapping().map(|m| m.name).unwrap_or("default")
    }

    /// Native key written by [`SslProperty::apply`]; `None` for `Default`
    pub fn native_key(&self) -> Option<&'static str> {
        self.mapping().map(|m| m.native_key)
    }

    /// Whether the value is a password that must be decoded first
    pub fn is_secret(&self) -> bool {
        self.mapping().map(|m| m.secret).unwrap_or(false)
    }

    /// Write this property's value into the native set
    pub fn apply(&self, target: &mut SslContextProperties, value: &str) -> Result<(), PasswordError> {
        let Some(mapping) = self.mapping() else {
            return Ok(());
        };

        let value = if mapping.secret {
            password::decode(value)?
        } else {
            value.to_string()
        };
        target.set(mapping.native_key, value);
        Ok(())
    }
}

/// Native TLS context properties, ordered by key
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SslContextProperties {
    properties: BTreeMap<String, String>,
}

impl SslContextProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

impl std::fmt::Debug for SslContextProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.properties {
            let secret = key == keys::KEY_STORE_PASSWORD || key == keys::TRUST_STORE_PASSWORD;
            if secret {
                map.entry(key, &"***");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// Apply every pair in `set` to `target`
pub fn apply_ssl_properties(
    set: &KeyValuePairSet,
    target: &mut SslContextProperties,
) -> Result<(), PasswordError> {
    for pair in set.iter() {
        SslProperty::from_name(&pair.key).apply(target, &pair.value)?;
    }
    Ok(())
}

/// Build a fresh native set from configured pairs
pub fn create_ssl_context_properties(
    set: &KeyValuePairSet,
) -> Result<SslContextProperties, PasswordError> {
    let mut target = SslContextProperties::new();
    apply_ssl_properties(set, &mut target)?;
    Ok(target)
}

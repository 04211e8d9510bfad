use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::credentials::{KeyId, KeyMaterial, StoredDigest};

pub type TokenId = i64;

/// Header injected into the upstream request on successful authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Durable token record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: TokenId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_access_at: Option<DateTime<Utc>>,
    #[serde(rename = "keyID")]
    pub key_id: KeyId,
    pub user: String,
    pub label: String,
    pub host: String,
    pub path: String,
    pub headers: Vec<Header>,
    pub requests: i64,
    #[serde(skip)]
    pub digest: StoredDigest,
}

/// Full token configuration, as accepted on create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenConfig {
    pub label: String,
    pub host: String,
    pub path: String,
    pub headers: Vec<Header>,
}

/// One field of a partial update: either left alone or replaced.
///
/// An absent JSON field deserializes to `Keep` (with `#[serde(default)]`);
/// a present one, even an empty string or list, to `Set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch<T> {
    Keep,
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Keep
    }
}

impl<T> Patch<T> {
    pub fn is_set(&self) -> bool {
        matches!(self, Patch::Set(_))
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Patch::Keep => None,
            Patch::Set(value) => Some(value),
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Patch::Keep => None,
            Patch::Set(value) => Some(value),
        }
    }

    /// Replace `target` if set.
    pub fn apply_to(self, target: &mut T) {
        if let Patch::Set(value) = self {
            *target = value;
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Patch<U> {
        match self {
            Patch::Keep => Patch::Keep,
            Patch::Set(value) => Patch::Set(f(value)),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Patch<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Patch::Set)
    }
}

/// Mutable subset of a token. Used both for create (missing fields take
/// their defaults) and for partial update (missing fields are kept).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigPatch {
    pub label: Patch<String>,
    pub host: Patch<String>,
    pub path: Patch<String>,
    pub headers: Patch<Vec<Header>>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        !(self.label.is_set() || self.host.is_set() || self.path.is_set() || self.headers.is_set())
    }

    /// Config for a new token: unset fields become empty ("match all").
    pub fn into_config(self) -> TokenConfig {
        let mut config = TokenConfig::default();
        self.apply_to(&mut config);
        config
    }

    pub fn apply_to(self, config: &mut TokenConfig) {
        self.label.apply_to(&mut config.label);
        self.host.apply_to(&mut config.host);
        self.path.apply_to(&mut config.path);
        self.headers.apply_to(&mut config.headers);
    }
}

impl From<TokenConfig> for ConfigPatch {
    fn from(config: TokenConfig) -> Self {
        Self {
            label: Patch::Set(config.label),
            host: Patch::Set(config.host),
            path: Patch::Set(config.path),
            headers: Patch::Set(config.headers),
        }
    }
}

/// Persistence payload for a new token.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub user: String,
    pub config: TokenConfig,
    pub key: KeyMaterial,
}

impl Token {
    pub fn hint(&self) -> String {
        self.key_id.hint()
    }
}

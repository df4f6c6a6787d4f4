//! Dataset model: versions, commits, references and peer profiles.

use crate::error::{Error, Result};
use crate::hash::{DatasetPath, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Peername alias for the local peer.
pub const ME: &str = "me";

/// Stable identifier of a peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::invalid_ref(id, "profile ID must be non-empty alphanumeric"));
        }
        Ok(ProfileId(id))
    }

    /// Derive an ID from key material (first 16 bytes of its digest, hex).
    pub fn derive(seed: &[u8]) -> Self {
        ProfileId(Digest::of(seed).to_hex()[..32].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Peer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ProfileId,
    pub peername: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl Profile {
    /// Profile whose ID is derived from the peername.
    pub fn new(peername: impl Into<String>) -> Result<Self> {
        let peername = peername.into();
        validate_name(&peername, "peername")?;
        Ok(Self {
            id: ProfileId::derive(peername.as_bytes()),
            peername,
            addresses: Vec::new(),
            public_key: None,
        })
    }
}

/// Immutable node linking a version to its predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    /// Previous version of this dataset; `None` for the first version.
    #[serde(default)]
    pub prior: Option<DatasetPath>,
    pub author: ProfileId,
}

/// Encoding of a dataset body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Json,
    Csv,
}

/// Shape of a dataset body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    #[serde(default)]
    pub format: DataFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// One fully loaded version of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub commit: Commit,
    pub structure: Option<Structure>,
    pub meta: Option<Value>,
    pub viz: Option<Value>,
    pub body: Option<Vec<u8>>,
}

/// Human-facing dataset identity, possibly partially resolved.
///
/// String form: `peername/name@profileid/blake3/<hex>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetRef {
    #[serde(default)]
    pub peername: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<ProfileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<DatasetPath>,
}

impl DatasetRef {
    pub fn new(peername: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peername: peername.into(),
            name: name.into(),
            profile_id: None,
            path: None,
        }
    }

    /// Reference naming every dataset of a peer.
    pub fn peer(peername: impl Into<String>) -> Self {
        Self::new(peername, "")
    }

    pub fn with_path(mut self, path: DatasetPath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_profile_id(mut self, id: ProfileId) -> Self {
        self.profile_id = Some(id);
        self
    }

    /// Parse a reference string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::EmptyRef);
        }

        if input.starts_with('/') {
            return Ok(Self {
                path: Some(DatasetPath::parse(input)?),
                ..Self::default()
            });
        }

        let (alias, locator) = match input.split_once('@') {
            Some((alias, locator)) => (alias, Some(locator)),
            None => (input, None),
        };

        let (peername, name) = match alias.split_once('/') {
            Some((peer, name)) => (peer, name),
            None => (alias, ""),
        };
        if name.contains('/') {
            return Err(Error::invalid_ref(input, "too many '/' separators"));
        }
        if !peername.is_empty() {
            validate_name(peername, "peername").map_err(|_| {
                Error::invalid_ref(input, "peername may only contain letters, digits, '_' and '-'")
            })?;
        }
        if !name.is_empty() {
            validate_name(name, "name").map_err(|_| {
                Error::invalid_ref(input, "name may only contain letters, digits, '_' and '-'")
            })?;
        }

        let mut reference = Self::new(peername, name);

        if let Some(locator) = locator {
            let (id, path) = match locator.find('/') {
                Some(0) => ("", locator),
                Some(idx) => locator.split_at(idx),
                None => (locator, ""),
            };
            if !id.is_empty() {
                reference.profile_id = Some(
                    ProfileId::new(id).map_err(|_| Error::invalid_ref(input, "bad profile ID"))?,
                );
            }
            if !path.is_empty() {
                reference.path = Some(
                    DatasetPath::parse(path)
                        .map_err(|e| Error::invalid_ref(input, e.to_string()))?,
                );
            }
            if reference.profile_id.is_none() && reference.path.is_none() {
                return Err(Error::invalid_ref(input, "empty locator after '@'"));
            }
        }

        if reference.peername.is_empty() && reference.path.is_none() {
            return Err(Error::invalid_ref(input, "missing peername"));
        }

        Ok(reference)
    }

    /// No peername, name or path.
    pub fn is_empty(&self) -> bool {
        self.peername.is_empty() && self.name.is_empty() && self.path.is_none()
    }

    /// Names a peer but no particular dataset.
    pub fn is_peer_ref(&self) -> bool {
        !self.peername.is_empty() && self.name.is_empty() && self.path.is_none()
    }

    /// `peername/name` without locator.
    pub fn alias(&self) -> String {
        if self.name.is_empty() {
            self.peername.clone()
        } else {
            format!("{}/{}", self.peername, self.name)
        }
    }

    /// Key of this reference's slot in the index.
    pub fn slot(&self) -> (String, String) {
        (self.peername.clone(), self.name.clone())
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.alias())?;
        if self.profile_id.is_some() || self.path.is_some() {
            f.write_str("@")?;
            if let Some(id) = &self.profile_id {
                write!(f, "{}", id)?;
            }
            if let Some(path) = &self.path {
                write!(f, "{}", path)?;
            }
        }
        Ok(())
    }
}

impl FromStr for DatasetRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DatasetRef::parse(s)
    }
}

/// Check a peername or dataset name.
pub fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::bad_request(format!("{} cannot be empty", what)));
    }
    if name.len() > 144 {
        return Err(Error::bad_request(format!("{} too long: {}", what, name.len())));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::bad_request(format!(
            "{} '{}' may only contain letters, digits, '_' and '-'",
            what, name
        )));
    }
    Ok(())
}

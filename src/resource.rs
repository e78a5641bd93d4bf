//! Registered compute resources.
//!
//! A `Resource` is the validated, in-memory form of one directory entry. The persisted and
//! operator-facing form is `ResourceEntry`, which is allowed to be incomplete; turning it into a
//! `Resource` is where malformed entries get rejected.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use void::Void;

use crate::error::MeshError;
use crate::serde::one_or_many;

/// Where a script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    #[default]
    Local,
    Remote,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Kind::Local => f.write_str("local"),
            Kind::Remote => f.write_str("remote"),
        }
    }
}

/// Opaque authentication material, typically a private key path.
///
/// Never printed: both `Debug` and `Display` show a placeholder.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthMaterial(Option<String>);

impl AuthMaterial {
    pub fn new(reference: Option<String>) -> Self {
        Self(reference.filter(|r| !r.is_empty()))
    }

    /// The key reference, for handing to the SSH client only.
    pub fn reveal(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("<redacted>"),
            None => f.write_str("<none>"),
        }
    }
}

impl fmt::Display for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub auth: AuthMaterial,
}

impl Credentials {
    /// Scrubs the auth material out of text that may end up in logs or results.
    pub fn redact(&self, text: &str) -> String {
        match self.auth.reveal() {
            Some(secret) => text.replace(secret, "<redacted>"),
            None => text.to_owned(),
        }
    }
}

/// How to reach a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The calling host. Credentials, if any, only pick the user to run as.
    Local { credentials: Option<Credentials> },
    /// A host reached over SSH.
    Remote {
        address: String,
        port: Option<u16>,
        credentials: Credentials,
    },
}

impl Target {
    pub fn kind(&self) -> Kind {
        match self {
            Target::Local { .. } => Kind::Local,
            Target::Remote { .. } => Kind::Remote,
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            Target::Local { credentials } => credentials.as_ref(),
            Target::Remote { credentials, .. } => Some(credentials),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Unique name within the directory.
    pub name: String,
    pub labels: BTreeSet<String>,
    pub target: Target,
    /// Free-form values made available to script templates.
    pub params: BTreeMap<String, String>,
}

impl Resource {
    pub fn kind(&self) -> Kind {
        self.target.kind()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// Removes any auth material from `text`.
    pub fn redact(&self, text: &str) -> String {
        match self.target.credentials() {
            Some(credentials) => credentials.redact(text),
            None => text.to_owned(),
        }
    }

    /// Converts back into the persisted form.
    pub fn to_entry(&self) -> ResourceEntry {
        let (address, port, credentials) = match &self.target {
            Target::Local { credentials } => (None, None, credentials.as_ref()),
            Target::Remote {
                address,
                port,
                credentials,
            } => {
                // The address defaults to the name, so only store it when it differs.
                let address = Some(address.clone()).filter(|a| *a != self.name);
                (address, *port, Some(credentials))
            }
        };
        ResourceEntry {
            name: self.name.clone(),
            spec: ConnectionSpec {
                labels: self.labels.iter().cloned().collect(),
                kind: self.kind(),
                address,
                port,
                username: credentials.map(|c| c.username.clone()),
                key: credentials.and_then(|c| c.auth.reveal().map(str::to_owned)),
                params: self.params.clone(),
            },
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}", self.name, self.kind())?;
        if let Target::Remote {
            address,
            port,
            credentials,
        } = &self.target
        {
            write!(f, ", {}@{}", credentials.username, address)?;
            if let Some(port) = port {
                write!(f, ":{}", port)?;
            }
        }
        write!(f, ")")?;
        if !self.labels.is_empty() {
            write!(f, " labels={}", self.labels.iter().join(","))?;
        }
        if !self.params.is_empty() {
            let params = self
                .params
                .iter()
                .map(|(key, value)| format!("{}={}", key, value))
                .join(",");
            write!(f, " params={}", params)?;
        }
        Ok(())
    }
}

/// Connection data for one resource, as supplied by the operator or the resource file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub labels: Vec<String>,
    #[serde(default)]
    pub kind: Kind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl ConnectionSpec {
    /// Validates the spec and builds the resource it describes.
    pub fn into_resource(self, name: String) -> Result<Resource, MeshError> {
        if name.trim().is_empty() {
            return Err(MeshError::InvalidDescriptor(
                "resource name must not be empty".to_string(),
            ));
        }
        let credentials = match self.username {
            Some(username) if username.trim().is_empty() => {
                return Err(MeshError::InvalidDescriptor(format!(
                    "resource '{}' has an empty username",
                    name
                )));
            }
            Some(username) => Some(Credentials {
                username,
                auth: AuthMaterial::new(self.key),
            }),
            None if self.key.is_some() => {
                return Err(MeshError::InvalidDescriptor(format!(
                    "resource '{}' has a key but no username",
                    name
                )));
            }
            None => None,
        };
        let target = match self.kind {
            Kind::Local => Target::Local { credentials },
            Kind::Remote => {
                let credentials = credentials.ok_or_else(|| {
                    MeshError::InvalidDescriptor(format!(
                        "remote resource '{}' has no credentials",
                        name
                    ))
                })?;
                Target::Remote {
                    address: self.address.unwrap_or_else(|| name.clone()),
                    port: self.port,
                    credentials,
                }
            }
        };
        let labels = self
            .labels
            .into_iter()
            .map(|label| label.trim().to_owned())
            .filter(|label| !label.is_empty())
            .collect();
        Ok(Resource {
            name,
            labels,
            target,
            params: self.params,
        })
    }
}

/// One entry of the resource file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub name: String,
    #[serde(flatten)]
    pub spec: ConnectionSpec,
}

/// A bare string in the resource file is a local resource of that name.
impl FromStr for ResourceEntry {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            name: s.to_owned(),
            spec: ConnectionSpec::default(),
        })
    }
}

impl ResourceEntry {
    pub fn into_resource(self) -> Result<Resource, MeshError> {
        self.spec.into_resource(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_spec() -> ConnectionSpec {
        ConnectionSpec {
            labels: vec!["prod".to_string()],
            kind: Kind::Remote,
            username: Some("ubuntu".to_string()),
            key: Some("/home/op/.ssh/id_prod".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_remote_without_credentials_is_rejected() {
        let spec = ConnectionSpec {
            kind: Kind::Remote,
            ..Default::default()
        };
        let err = spec.into_resource("web1".to_string()).unwrap_err();
        assert!(matches!(err, MeshError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_remote_address_defaults_to_name() {
        let resource = remote_spec().into_resource("web1".to_string()).unwrap();
        match resource.target {
            Target::Remote { address, .. } => assert_eq!(address, "web1"),
            other => panic!("expected remote target, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(ConnectionSpec::default()
            .into_resource("  ".to_string())
            .is_err());
    }

    #[test]
    fn test_debug_never_shows_key() {
        let resource = remote_spec().into_resource("web1".to_string()).unwrap();
        let debug = format!("{:?}", resource);
        assert!(!debug.contains("id_prod"));
        assert!(debug.contains("<redacted>"));
        assert!(!resource.to_string().contains("id_prod"));
    }

    #[test]
    fn test_redact_scrubs_key_reference() {
        let resource = remote_spec().into_resource("web1".to_string()).unwrap();
        let text = "Warning: Identity file /home/op/.ssh/id_prod not accessible";
        assert_eq!(
            resource.redact(text),
            "Warning: Identity file <redacted> not accessible"
        );
    }

    #[test]
    fn test_entry_survives_conversion() {
        let entry = ResourceEntry {
            name: "web1".to_string(),
            spec: remote_spec(),
        };
        let resource = entry.clone().into_resource().unwrap();
        assert_eq!(resource.to_entry(), entry);
    }

    #[test]
    fn test_bare_string_entry_is_local() {
        let resource = "laptop".parse::<ResourceEntry>().unwrap().into_resource().unwrap();
        assert_eq!(resource.kind(), Kind::Local);
        assert!(resource.labels.is_empty());
    }
}

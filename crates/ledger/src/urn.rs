//! Resource identities.
//!
//! A URN has the shape `urn:converge:<stack>::<project>::<qualified-type>::<name>`.
//! The qualified type chains the parent's qualified type with `$`, so a
//! child's identity changes when its parent's type does.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const PREFIX: &str = "urn:converge:";
const DELIMITER: &str = "::";
const TYPE_DELIMITER: char = '$';

/// Type token prefix shared by all provider resources.
pub const PROVIDER_TYPE_PREFIX: &str = "converge:providers:";

/// Hierarchical resource identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn(String);

impl Urn {
    /// Build a URN from its parts.
    ///
    /// `parent_type` is the parent's *qualified* type, if the resource has a parent.
    pub fn new(stack: &str, project: &str, parent_type: Option<&str>, ty: &str, name: &str) -> Self {
        let qualified = match parent_type {
            Some(parent) if !parent.is_empty() => format!("{parent}{TYPE_DELIMITER}{ty}"),
            _ => ty.to_string(),
        };
        Self(format!("{PREFIX}{stack}{DELIMITER}{project}{DELIMITER}{qualified}{DELIMITER}{name}"))
    }

    /// Identity of a view owned by `owner`.
    pub fn view(owner: &Urn, ty: &str, name: &str) -> Self {
        Self::new(owner.stack(), owner.project(), Some(owner.qualified_type()), ty, name)
    }

    /// Parse and validate a URN string.
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| Error::InvalidUrn(s.to_string()))?;
        let parts: Vec<&str> = rest.splitn(4, DELIMITER).collect();
        if parts.len() != 4 || parts[2].is_empty() || parts[3].is_empty() {
            return Err(Error::InvalidUrn(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    fn part(&self, index: usize) -> &str {
        self.0[PREFIX.len()..]
            .splitn(4, DELIMITER)
            .nth(index)
            .unwrap_or_default()
    }

    pub fn stack(&self) -> &str {
        self.part(0)
    }

    pub fn project(&self) -> &str {
        self.part(1)
    }

    /// Full `$`-joined type chain including ancestors.
    pub fn qualified_type(&self) -> &str {
        self.part(2)
    }

    /// The resource's own type token (last link of the qualified type).
    pub fn type_token(&self) -> &str {
        let qualified = self.qualified_type();
        qualified
            .rsplit_once(TYPE_DELIMITER)
            .map_or(qualified, |(_, ty)| ty)
    }

    pub fn name(&self) -> &str {
        self.part(3)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Urn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Urn {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.0
    }
}

/// Whether a type token names a provider resource.
pub fn is_provider_type(ty: &str) -> bool {
    ty.starts_with(PROVIDER_TYPE_PREFIX)
}

/// Provider type token for a package.
pub fn provider_type(package: &str) -> String {
    format!("{PROVIDER_TYPE_PREFIX}{package}")
}

/// Package portion of a type token (`aws:s3:Bucket` -> `aws`).
pub fn package_of(ty: &str) -> &str {
    if let Some(package) = ty.strip_prefix(PROVIDER_TYPE_PREFIX) {
        return package;
    }
    ty.split(':').next().unwrap_or(ty)
}

/// Reference from a custom resource to the provider resource managing it.
///
/// Serialized as `<provider urn>::<provider id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderRef {
    pub urn: Urn,
    pub id: String,
}

impl ProviderRef {
    pub fn new(urn: Urn, id: impl Into<String>) -> Self {
        Self { urn, id: id.into() }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (urn, id) = s
            .rsplit_once(DELIMITER)
            .ok_or_else(|| Error::InvalidProviderRef(s.to_string()))?;
        let urn = Urn::parse(urn).map_err(|_| Error::InvalidProviderRef(s.to_string()))?;
        if id.is_empty() {
            return Err(Error::InvalidProviderRef(s.to_string()));
        }
        Ok(Self::new(urn, id))
    }

    /// Package managed by the referenced provider.
    pub fn package(&self) -> &str {
        package_of(self.urn.type_token())
    }
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{DELIMITER}{}", self.urn, self.id)
    }
}

impl TryFrom<String> for ProviderRef {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ProviderRef> for String {
    fn from(reference: ProviderRef) -> Self {
        reference.to_string()
    }
}

//! Validated identifier and URL types
//!
//! These are what a work order carries. Each one parses from and serializes
//! to a plain string, and refuses to deserialize malformed input, so any
//! work order read back from the API server is already well formed.

use std::fmt;
use std::str::FromStr;

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Metadata, Schema, SchemaObject, StringValidation};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

/// Longest identifier accepted by the control plane
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Why a value was rejected
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidValue {
    /// The value is empty or whitespace
    #[error("must not be empty")]
    Empty,
    /// The value exceeds [`MAX_IDENTIFIER_LEN`]
    #[error("must be at most {MAX_IDENTIFIER_LEN} characters")]
    TooLong,
    /// The value contains a character with meaning in a request path
    #[error("contains forbidden character {0:?}")]
    ForbiddenChar(char),
    /// A revision that is not a number
    #[error("revision must be a number, got {0:?}")]
    NotNumeric(String),
    /// The URL does not parse
    #[error("invalid URL: {0}")]
    Url(String),
    /// The URL is not http(s)
    #[error("URL scheme must be http or https, got {0:?}")]
    Scheme(String),
    /// The URL has no host
    #[error("URL must have a host")]
    NoHost,
    /// A route prefix without the leading slash
    #[error("route prefix must start with '/'")]
    NoLeadingSlash,
}

fn check_identifier(value: &str) -> Result<(), InvalidValue> {
    if value.trim().is_empty() {
        return Err(InvalidValue::Empty);
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(InvalidValue::TooLong);
    }
    if let Some(c) = value
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, '/' | '?' | '#' | ';'))
    {
        return Err(InvalidValue::ForbiddenChar(c));
    }
    Ok(())
}

/// Non-empty identifier usable as a single path segment in a control-plane
/// request (API id, product id, tag id, resource group, service name, ...)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    /// Borrow the identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResourceId {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        check_identifier(&value)?;
        Ok(Self(value))
    }
}

impl FromStr for ResourceId {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// API revision number, as the control plane expects it (`"3"`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
    /// Borrow the revision
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Revision {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(InvalidValue::Empty);
        }
        if !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(InvalidValue::NotNumeric(value));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl FromStr for Revision {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Absolute http or https URL with a host
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HttpUrl(Url);

impl HttpUrl {
    /// Borrow the parsed URL
    pub fn as_url(&self) -> &Url {
        &self.0
    }

    /// Borrow the URL as a string
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for HttpUrl {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let url = Url::parse(value.trim()).map_err(|e| InvalidValue::Url(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(InvalidValue::Scheme(other.to_string())),
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(InvalidValue::NoHost);
        }
        Ok(Self(url))
    }
}

impl FromStr for HttpUrl {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<HttpUrl> for String {
    fn from(url: HttpUrl) -> Self {
        url.0.into()
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

/// Gateway path the API is published under (`/orders`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutePrefix(String);

impl RoutePrefix {
    /// Borrow the prefix, leading slash included
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoutePrefix {
    type Error = InvalidValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(InvalidValue::Empty);
        }
        if !value.starts_with('/') {
            return Err(InvalidValue::NoLeadingSlash);
        }
        if let Some(c) = value
            .chars()
            .find(|c| c.is_whitespace() || matches!(c, '?' | '#'))
        {
            return Err(InvalidValue::ForbiddenChar(c));
        }
        Ok(Self(value))
    }
}

impl FromStr for RoutePrefix {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<RoutePrefix> for String {
    fn from(prefix: RoutePrefix) -> Self {
        prefix.0
    }
}

impl fmt::Display for RoutePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// String schema carrying the same rules as the `TryFrom<String>` impls, so
/// the API server rejects a malformed work order at admission.
fn string_schema(
    description: &str,
    format: Option<&str>,
    validation: StringValidation,
) -> Schema {
    Schema::Object(SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        format: format.map(str::to_string),
        metadata: Some(Box::new(Metadata {
            description: Some(description.to_string()),
            ..Default::default()
        })),
        string: Some(Box::new(validation)),
        ..Default::default()
    })
}

macro_rules! string_json_schema {
    ($ty:ident, $description:expr, $format:expr, $validation:expr) => {
        impl JsonSchema for $ty {
            fn schema_name() -> String {
                stringify!($ty).to_string()
            }

            fn is_referenceable() -> bool {
                false
            }

            fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
                string_schema($description, $format, $validation)
            }
        }
    };
}

string_json_schema!(
    ResourceId,
    "Identifier used as one request path segment",
    None,
    StringValidation {
        min_length: Some(1),
        max_length: Some(MAX_IDENTIFIER_LEN as u32),
        pattern: Some(r"^[^\s/?#;]+$".to_string()),
    }
);

string_json_schema!(
    Revision,
    "API revision number",
    None,
    StringValidation {
        min_length: Some(1),
        max_length: None,
        pattern: Some("^[0-9]+$".to_string()),
    }
);

string_json_schema!(
    HttpUrl,
    "Absolute http or https URL",
    Some("uri"),
    StringValidation {
        min_length: None,
        max_length: None,
        pattern: Some(r"^[Hh][Tt][Tt][Pp][Ss]?://[^\s/?#]+".to_string()),
    }
);

string_json_schema!(
    RoutePrefix,
    "Gateway path, starting with '/'",
    None,
    StringValidation {
        min_length: Some(1),
        max_length: None,
        pattern: Some(r"^/[^\s?#]*$".to_string()),
    }
);

/// Which control-plane instance a request targets
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceCoordinates {
    /// Subscription id
    pub subscription: ResourceId,
    /// Resource group name
    pub resource_group: ResourceId,
    /// API Management instance name
    pub service_name: ResourceId,
}

impl fmt::Display for ServiceCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.subscription, self.resource_group, self.service_name
        )
    }
}

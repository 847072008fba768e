//! Natural-key references.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const SEPARATOR: char = '|';
const OBJECT_TYPE_PATTERN: &str = r"^[A-Z][A-Za-z0-9_]*$";
const RELATION_PATTERN: &str = r"^[a-z][a-z0-9_]*$";

static OBJECT_TYPE_RE: OnceLock<Option<Regex>> = OnceLock::new();
static RELATION_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, value: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .map_or(false, |re| re.is_match(value))
}

pub(crate) fn is_valid_object_type(object_type: &str) -> bool {
    matches(&OBJECT_TYPE_RE, OBJECT_TYPE_PATTERN, object_type)
}

pub(crate) fn is_valid_relation(relation: &str) -> bool {
    matches(&RELATION_RE, RELATION_PATTERN, relation)
}

/// Stable, content-derived identifier of an object.
///
/// Rendered as `<ObjectType>|<natural key>`, where the natural key is the
/// object's discriminating fields joined with `|`. A field that is itself a
/// reference contributes its natural key, so nested keys flatten:
/// `IPAddressV4|internet|1.1.1.1` embeds the `Network|internet` key.
///
/// # Examples
///
/// ```
/// use scangraph::Reference;
///
/// let network = Reference::new("Network", &["internet"]).unwrap();
/// let ip = Reference::new("IPAddressV4", &[network.natural_key(), "1.1.1.1"]).unwrap();
/// assert_eq!(ip.as_str(), "IPAddressV4|internet|1.1.1.1");
/// assert_eq!(ip.object_type(), "IPAddressV4");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reference(String);

impl Reference {
    /// Builds a reference from an object type and its natural-key parts.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if the object type is malformed or no key part is given.
    pub fn new<S: AsRef<str>>(object_type: &str, parts: &[S]) -> Result<Self, ValidationError> {
        if !is_valid_object_type(object_type) {
            return Err(ValidationError::InvalidObjectType {
                object_type: object_type.to_string(),
            });
        }
        if parts.is_empty() {
            return Err(ValidationError::InvalidReference {
                reference: object_type.to_string(),
                reason: "natural key has no parts".to_string(),
            });
        }

        let mut out = String::from(object_type);
        for part in parts {
            out.push(SEPARATOR);
            out.push_str(part.as_ref());
        }
        Ok(Self(out))
    }

    /// Parses and validates a rendered reference.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if there is no natural key or the type is malformed.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let Some((object_type, natural_key)) = raw.split_once(SEPARATOR) else {
            return Err(ValidationError::InvalidReference {
                reference: raw.to_string(),
                reason: "missing natural key".to_string(),
            });
        };
        if !is_valid_object_type(object_type) {
            return Err(ValidationError::InvalidObjectType {
                object_type: object_type.to_string(),
            });
        }
        if natural_key.is_empty() {
            return Err(ValidationError::InvalidReference {
                reference: raw.to_string(),
                reason: "empty natural key".to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    /// Wraps a string without validation. Intended for trusted, already
    /// validated references (e.g. read back from the store).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The object type prefix.
    #[must_use]
    pub fn object_type(&self) -> &str {
        self.0.split_once(SEPARATOR).map_or(self.0.as_str(), |(t, _)| t)
    }

    /// Everything after the object type.
    #[must_use]
    pub fn natural_key(&self) -> &str {
        self.0.split_once(SEPARATOR).map_or("", |(_, k)| k)
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Reference {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// Free-form record attributes as exchanged with the catalog.
pub type Attrs = Map<String, Value>;

const MAX_ID_LEN: usize = 100;
const ID_HASH_LEN: usize = 12;

/// Ordered values of a data-type's `resource_linkage` keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkageTuple(Vec<String>);

impl LinkageTuple {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for LinkageTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Plain description of one data-type; the only project-specific knowledge
/// the sync engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTypeDescriptor {
    pub data_type: String,
    pub organization: String,
    pub resource_linkage: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    attrs: Attrs,
}

impl Package {
    pub fn new(attrs: Attrs) -> Self {
        Self { attrs }
    }

    pub fn id(&self) -> &str {
        self.attrs.get("id").and_then(Value::as_str).unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.attrs
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_else(|| self.id())
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn into_attrs(self) -> Attrs {
        self.attrs
    }

    pub fn linkage(&self, keys: &[String]) -> Result<LinkageTuple, SyncError> {
        keys.iter()
            .map(|key| {
                self.attrs
                    .get(key)
                    .map(scalar_string)
                    .ok_or_else(|| SyncError::MissingLinkageKey {
                        package: self.id().to_string(),
                        key: key.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(LinkageTuple)
    }
}

/// Upstream emission shape: `(linkage_tuple, origin_url, resource_attrs)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTriple {
    pub linkage: LinkageTuple,
    pub origin_url: String,
    pub attrs: Attrs,
}

impl ResourceTriple {
    pub fn md5(&self) -> Option<&str> {
        self.attrs.get("md5").and_then(Value::as_str)
    }

    pub fn filename(&self) -> &str {
        self.attrs
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_else(|| filename_from_url(&self.origin_url))
    }
}

/// A resource joined to its package: `id` (the md5) and `package_id` are
/// stamped onto `attrs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub origin_url: String,
    pub attrs: Attrs,
}

impl Resource {
    pub fn id(&self) -> &str {
        self.attrs.get("id").and_then(Value::as_str).unwrap_or("")
    }

    pub fn package_id(&self) -> &str {
        self.attrs
            .get("package_id")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn filename(&self) -> &str {
        self.attrs
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_else(|| filename_from_url(&self.origin_url))
    }

    pub fn ticket(&self) -> &str {
        ticket_segment(&self.origin_url)
    }
}

/// Deterministic package id for a data-type and linkage tuple.
pub fn make_package_id(data_type: &str, linkage: &LinkageTuple) -> String {
    let raw = std::iter::once(data_type)
        .chain(linkage.values().iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join("-");
    let slug: String = raw
        .to_lowercase()
        .chars()
        .map(|ch| {
            if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if slug.len() <= MAX_ID_LEN {
        return slug;
    }
    let digest = hex::encode(Sha256::digest(slug.as_bytes()));
    let keep = MAX_ID_LEN - ID_HASH_LEN - 1;
    format!("{}-{}", &slug[..keep], &digest[..ID_HASH_LEN])
}

/// String form of a scalar attribute, as used in linkage tuples.
pub fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The path segment directly before the filename, i.e. the upload ticket
/// on the origin download server.
pub fn ticket_segment(url: &str) -> &str {
    let segments = url_path_segments(url);
    if segments.len() < 2 {
        return "";
    }
    segments[segments.len() - 2]
}

pub fn filename_from_url(url: &str) -> &str {
    url_path_segments(url).last().copied().unwrap_or("")
}

fn url_path_segments(url: &str) -> Vec<&str> {
    let without_query = url.split(['?', '#']).next().unwrap_or("");
    let path = match without_query.find("://") {
        Some(idx) => {
            let rest = &without_query[idx + 3..];
            rest.find('/').map(|slash| &rest[slash..]).unwrap_or("")
        }
        None => without_query,
    };
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

//! Invalidation tags.
//!
//! A tag names a piece of server state that cached data depends on. Entries
//! declare the tags they provide; mutations declare the tags they invalidate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

const LIST_MARKER: &str = "LIST";

/// Identifier half of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagId {
    /// A concrete entity id (`vehicle:123`).
    Id(String),
    /// The collection marker (`vehicle:LIST`).
    List,
}

/// Domain-level invalidation label.
///
/// A tag without an id (`vehicle`) matches every tag of the same kind when
/// used for invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub kind: String,
    pub id: Option<TagId>,
}

impl Tag {
    /// Tag covering every entity of `kind`.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }

    /// Tag for a single entity.
    ///
    /// The id `LIST` is reserved for the collection marker and yields the same
    /// tag as [`Tag::list`].
    pub fn id(kind: impl Into<String>, id: impl fmt::Display) -> Self {
        let id = id.to_string();
        let id = if id == LIST_MARKER {
            TagId::List
        } else {
            TagId::Id(id)
        };
        Self {
            kind: kind.into(),
            id: Some(id),
        }
    }

    /// Tag for the collection of `kind`.
    pub fn list(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(TagId::List),
        }
    }

    /// Returns true when this tag carries no id and therefore matches the whole kind.
    pub fn is_kind_wide(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            None => write!(f, "{}", self.kind),
            Some(TagId::List) => write!(f, "{}:{LIST_MARKER}", self.kind),
            Some(TagId::Id(id)) => write!(f, "{}:{id}", self.kind),
        }
    }
}

impl FromStr for Tag {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (kind, id) = match value.split_once(':') {
            Some((kind, id)) => (kind, Some(id)),
            None => (value, None),
        };

        if kind.is_empty() {
            return Err(DomainError::InvalidTag(value.to_string()));
        }

        match id {
            None => Ok(Self::kind(kind)),
            Some("") => Err(DomainError::InvalidTag(value.to_string())),
            Some(LIST_MARKER) => Ok(Self::list(kind)),
            Some(id) => Ok(Self::id(kind, id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_form() {
        assert_eq!(Tag::id("vehicle", 123).to_string(), "vehicle:123");
        assert_eq!(Tag::list("vehicle").to_string(), "vehicle:LIST");
        assert_eq!(Tag::kind("vehicle").to_string(), "vehicle");
    }

    #[test]
    fn parse_roundtrips_display() {
        for raw in ["vehicle:123", "vehicle:LIST", "vehicle"] {
            let tag: Tag = raw.parse().expect("valid tag");
            assert_eq!(tag.to_string(), raw);
        }
    }

    #[test]
    fn reserved_list_id_is_the_collection_tag() {
        let tag = Tag::id("vehicle", "LIST");
        assert_eq!(tag, Tag::list("vehicle"));
        let parsed: Tag = tag.to_string().parse().expect("valid tag");
        assert_eq!(parsed, tag);
    }

    #[test]
    fn parse_rejects_empty_parts() {
        assert!(":123".parse::<Tag>().is_err());
        assert!("vehicle:".parse::<Tag>().is_err());
        assert!("".parse::<Tag>().is_err());
    }

    #[test]
    fn list_and_id_tags_are_distinct() {
        assert_ne!(Tag::list("vehicle"), Tag::id("vehicle", "LIST_"));
        assert_ne!(Tag::list("vehicle"), Tag::kind("vehicle"));
        assert!(Tag::kind("vehicle").is_kind_wide());
        assert!(!Tag::id("vehicle", 1).is_kind_wide());
    }
}

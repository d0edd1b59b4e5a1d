//! Metric identity: a name plus an ordered set of key/value tags.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

/// An immutable key/value pair. Keys and values are reference counted so
/// copies made while deriving ids share the underlying storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    key: Arc<str>,
    value: Arc<str>,
}

impl Tag {
    /// Create a new tag.
    pub fn new(key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Tag key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Tag value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl<K: Into<Arc<str>>, V: Into<Arc<str>>> From<(K, V)> for Tag {
    fn from((k, v): (K, V)) -> Self {
        Tag::new(k, v)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Identifier for a meter: a name plus tags in the order the user supplied
/// them, with unique keys. The last value wins when a key is set twice.
///
/// Ids are cheap value objects; the mutators return new ids that share the
/// name and tag storage with the original.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id {
    name: Arc<str>,
    tags: Vec<Tag>,
}

impl Id {
    /// Create an id with no tags.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Id {
            name: name.into(),
            tags: Vec::new(),
        }
    }

    /// Create an id with an initial tag list. Duplicate keys collapse to the
    /// last value while preserving the position of the first occurrence.
    pub fn with_name_and_tags(
        name: impl Into<Arc<str>>,
        tags: impl IntoIterator<Item = Tag>,
    ) -> Self {
        let mut id = Id::new(name);
        for tag in tags {
            id = id.with(tag);
        }
        id
    }

    /// Name of the metric.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tags in insertion order.
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Return a new id with the given tag added. An existing key keeps its
    /// position and takes the new value.
    pub fn with(&self, tag: Tag) -> Id {
        let mut next = self.clone();
        match next.tags.iter_mut().find(|t| t.key == tag.key) {
            Some(existing) => existing.value = tag.value,
            None => next.tags.push(tag),
        }
        next
    }

    /// Return a new id with a `key=value` tag added.
    pub fn with_tag(&self, key: impl Into<Arc<str>>, value: impl Into<Arc<str>>) -> Id {
        self.with(Tag::new(key, value))
    }

    /// Return a new id with all of the given tags added.
    pub fn with_tags(&self, tags: impl IntoIterator<Item = Tag>) -> Id {
        let mut next = self.clone();
        for tag in tags {
            next = next.with(tag);
        }
        next
    }

    /// Look up the value for a tag key. The name is visible as the
    /// pseudo-tag `name`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        if key == "name" {
            return Some(&self.name);
        }
        self.tags
            .iter()
            .find(|t| t.key() == key)
            .map(|t| t.value())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for tag in &self.tags {
            write!(f, ":{tag}")?;
        }
        Ok(())
    }
}

/// Error returned when parsing the serialized form of an [`Id`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseIdError {
    /// The input was empty.
    #[error("empty id string")]
    Empty,
    /// A tag segment was not of the form `key=value`.
    #[error("invalid tag segment: {0}")]
    InvalidTag(String),
}

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let name = match parts.next() {
            Some(n) if !n.is_empty() => n,
            _ => return Err(ParseIdError::Empty),
        };
        let mut id = Id::new(name);
        for part in parts {
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| ParseIdError::InvalidTag(part.to_owned()))?;
            if k.is_empty() {
                return Err(ParseIdError::InvalidTag(part.to_owned()));
            }
            id = id.with_tag(k, v);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_tag_appends_in_order() {
        let id = Id::new("http.requests")
            .with_tag("status", "200")
            .with_tag("method", "GET");
        let keys: Vec<_> = id.tags().iter().map(Tag::key).collect();
        assert_eq!(keys, vec!["status", "method"]);
    }

    #[test]
    fn duplicate_key_last_value_wins() {
        let id = Id::new("a").with_tag("k", "v1").with_tag("k", "v2");
        assert_eq!(id.tags().len(), 1);
        assert_eq!(id.tag_value("k"), Some("v2"));
    }

    #[test]
    fn equality_over_name_and_tags() {
        let a = Id::new("a").with_tag("k", "v");
        let b = Id::new("a").with_tag("k", "v");
        let c = Id::new("a").with_tag("k", "w");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn name_is_a_pseudo_tag() {
        let id = Id::new("cpu.usage").with_tag("host", "i-123");
        assert_eq!(id.tag_value("name"), Some("cpu.usage"));
        assert_eq!(id.tag_value("host"), Some("i-123"));
        assert_eq!(id.tag_value("zone"), None);
    }

    #[test]
    fn display_round_trips() {
        let id = Id::new("server.requests")
            .with_tag("status", "2xx")
            .with_tag("node", "i-42");
        let rendered = id.to_string();
        assert_eq!(rendered, "server.requests:status=2xx:node=i-42");
        let parsed: Id = rendered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("".parse::<Id>(), Err(ParseIdError::Empty));
        assert!(matches!(
            "name:no-equals".parse::<Id>(),
            Err(ParseIdError::InvalidTag(_))
        ));
    }
}

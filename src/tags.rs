use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TagError {
    #[error("tag name must not be empty (value: {value:?})")]
    EmptyName { value: String },
}

/// A single name/value pair attached to an exported artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    name: String,
    value: String,
}

impl Tag {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value)
    }
}

/// Ordered tag list. Duplicate names are kept; resolving them is up to the
/// collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: Vec<Tag>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a tag. Names that are empty after trimming are rejected.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), TagError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(TagError::EmptyName {
                value: value.into(),
            });
        }
        self.tags.push(Tag {
            name,
            value: value.into(),
        });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    pub fn as_slice(&self) -> &[Tag] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// First value recorded under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }

    /// Returns a new set holding `self` followed by `other`.
    pub fn merged(&self, other: &TagSet) -> TagSet {
        let mut tags = Vec::with_capacity(self.tags.len() + other.tags.len());
        tags.extend_from_slice(&self.tags);
        tags.extend_from_slice(&other.tags);
        TagSet { tags }
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

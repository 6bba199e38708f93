//! Hierarchical dotted tags (`Item.Type.Weapon.Rifle`) and tag sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Checks if `tag` equals `parent` or is nested below it.
///
/// `Item.Type.Weapon.Rifle` matches `Item.Type.Weapon` but `Item.Type.WeaponMod`
/// does not.
#[must_use]
pub fn tag_matches(tag: &str, parent: &str) -> bool {
    if parent.is_empty() {
        return false;
    }
    match tag.strip_prefix(parent) {
        Some("") => true,
        Some(rest) => rest.starts_with('.'),
        None => false,
    }
}

/// A single hierarchical tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    /// Creates a tag from its dotted name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the dotted name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks if this tag equals `parent` or is one of its descendants.
    #[must_use]
    pub fn matches(&self, parent: &Tag) -> bool {
        tag_matches(&self.0, &parent.0)
    }

    /// Returns the parent tag, if any.
    #[must_use]
    pub fn parent(&self) -> Option<Tag> {
        self.0.rfind('.').map(|i| Tag::new(&self.0[..i]))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// An ordered set of tags with hierarchical queries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    /// Creates an empty tag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tag. Returns false if it was already present.
    pub fn insert(&mut self, tag: impl Into<Tag>) -> bool {
        self.0.insert(tag.into())
    }

    /// Removes a tag. Returns whether it was present.
    pub fn remove(&mut self, tag: &Tag) -> bool {
        self.0.remove(tag)
    }

    /// Builder-style insert.
    pub fn with(mut self, tag: impl Into<Tag>) -> Self {
        self.insert(tag);
        self
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks if the set holds no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the tags in order.
    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    /// Checks if any tag in this set matches `tag` hierarchically.
    #[must_use]
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.0.iter().any(|own| own.matches(tag))
    }

    /// Checks if any of our tags matches any tag of `other`.
    ///
    /// An empty `other` never matches.
    #[must_use]
    pub fn has_any(&self, other: &TagSet) -> bool {
        other.0.iter().any(|tag| self.has_tag(tag))
    }

    /// Checks if every tag of `other` is matched by one of ours.
    ///
    /// An empty `other` always matches.
    #[must_use]
    pub fn has_all(&self, other: &TagSet) -> bool {
        other.0.iter().all(|tag| self.has_tag(tag))
    }
}

impl<T: Into<Tag>> FromIterator<T> for TagSet {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Tag::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchical_match() {
        assert!(tag_matches("Item.Type.Weapon.Rifle", "Item.Type.Weapon"));
        assert!(tag_matches("Item.Type.Weapon", "Item.Type.Weapon"));
        assert!(!tag_matches("Item.Type.WeaponMod", "Item.Type.Weapon"));
        assert!(!tag_matches("Item.Type", "Item.Type.Weapon"));
        assert!(!tag_matches("Item", ""));
    }

    #[test]
    fn test_has_any_and_all() {
        let item: TagSet = ["Item.Type.Weapon.Rifle", "Item.Rarity.Rare"].into_iter().collect();
        let weapons: TagSet = ["Item.Type.Weapon"].into_iter().collect();
        let armor: TagSet = ["Item.Type.Armor"].into_iter().collect();

        assert!(item.has_any(&weapons));
        assert!(!item.has_any(&armor));
        assert!(!item.has_any(&TagSet::new()));

        let both: TagSet = ["Item.Type.Weapon", "Item.Rarity"].into_iter().collect();
        assert!(item.has_all(&both));
        assert!(item.has_all(&TagSet::new()));
        assert!(!item.has_all(&both.with("Item.Quest")));
    }

    #[test]
    fn test_parent() {
        let tag = Tag::new("Item.Type.Weapon");
        assert_eq!(tag.parent(), Some(Tag::new("Item.Type")));
        assert_eq!(Tag::new("Item").parent(), None);
    }
}

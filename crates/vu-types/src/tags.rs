//! Tag sets attached to every emitted sample and the group hierarchy they're
//! merged with. See `spec.md` §3 (Group) and §6 (`runTags`/`systemTags`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A string-keyed, string-valued tag set. `BTreeMap` keeps iteration order
/// deterministic, which matters for the scenario tests in `spec.md` §8 that
/// assert on an exact tag snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` over `self`; `other`'s values win on key collision.
    /// Mirrors the merge order from `spec.md` §4.3 step 4:
    /// `runTags` → `systemTags` → activation `Tags`.
    pub fn merge(mut self, other: &TagSet) -> Self {
        for (k, v) in other.iter() {
            self.0.insert(k.to_string(), v.to_string());
        }
        self
    }
}

impl From<BTreeMap<String, String>> for TagSet {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl From<std::collections::HashMap<String, String>> for TagSet {
    fn from(map: std::collections::HashMap<String, String>) -> Self {
        Self(map.into_iter().collect())
    }
}

/// A hierarchical label ("", "::child", "::child::grandchild", ...) tagged
/// onto samples for report grouping. The default group is the empty name;
/// `setup`/`teardown` run under synthetic groups of those names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group(String);

impl Group {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn child(&self, name: &str) -> Self {
        if self.0.is_empty() {
            Self(format!("::{name}"))
        } else {
            Self(format!("{}::{name}", self.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "(root)")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_group_nests_with_double_colon() {
        let root = Group::root();
        let child = root.child("a");
        assert_eq!(child.as_str(), "::a");
        assert_eq!(child.child("b").as_str(), "::a::b");
    }

    #[test]
    fn merge_lets_later_tags_win() {
        let mut a = TagSet::new();
        a.insert("scenario", "default").insert("status", "200");
        let mut b = TagSet::new();
        b.insert("status", "500");
        let merged = a.merge(&b);
        assert_eq!(merged.get("status"), Some("500"));
        assert_eq!(merged.get("scenario"), Some("default"));
    }
}

//! Portable archive format: a self-contained tree of `{filename -> bytes}`
//! sufficient to reconstruct a `Bundle` without the original filesystems.
//! See `spec.md` §4.1 (`MakeArchive`/`FromArchive`) and §6.

use crate::options::Options;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A serialized bundle: every module source the compiler touched, the
/// resolved options, and the entry point filename. `BTreeMap` gives a
/// deterministic serialization, which the round-trip test in `spec.md` §8
/// (P3) relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    /// Entry point filename, a key into `files`.
    pub entrypoint: String,
    /// Every module source in the transitive import graph, keyed by the
    /// resolved path used during compilation.
    pub files: BTreeMap<String, Vec<u8>>,
    pub options: Options,
    /// Archive format version, bumped if the on-disk shape changes.
    pub version: u32,
}

impl Archive {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(entrypoint: impl Into<String>, options: Options) -> Self {
        Self {
            entrypoint: entrypoint.into(),
            files: BTreeMap::new(),
            options,
            version: Self::CURRENT_VERSION,
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.into(), bytes.into());
        self
    }

    pub fn entry_source(&self) -> Option<&[u8]> {
        self.files.get(&self.entrypoint).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let archive = Archive::new("main.js", Options::default())
            .with_file("main.js", b"export default function(){}".to_vec())
            .with_file("lib/a.js", b"export function a(){}".to_vec());
        let json = serde_json::to_vec(&archive).unwrap();
        let back: Archive = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.entrypoint, "main.js");
        assert_eq!(back.files.len(), 2);
        assert_eq!(back.entry_source(), archive.entry_source());
    }
}

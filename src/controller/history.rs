//! Revision history of a Stack's spec, stored as annotations
//!
//! Each revision lives under `compose.docker.com/revision-<n>` with the
//! serialized canonical spec as value. Numbers only grow; the content of an
//! existing revision never changes.

use std::collections::BTreeMap;

use kube::Resource;
use tracing::debug;

use super::patch::JsonPatch;
use crate::crd::Stack;
use crate::error::{Error, Result};

pub const REVISION_ANNOTATION_PREFIX: &str = "compose.docker.com/revision-";
pub const ANNOTATIONS_PATH: &str = "/metadata/annotations";
const RESOURCE_VERSION_PATH: &str = "/metadata/resourceVersion";

/// An immutable `(number, spec)` snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revision {
    pub number: u64,
    pub spec: String,
}

impl Revision {
    pub fn annotation_key(&self) -> String {
        format!("{REVISION_ANNOTATION_PREFIX}{}", self.number)
    }
}

/// Revisions retained for one resource, ascending by number
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RevisionHistory {
    revisions: Vec<Revision>,
}

impl RevisionHistory {
    /// Parse revisions from an annotation map; malformed keys are skipped
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let mut revisions: Vec<Revision> = annotations
            .iter()
            .filter_map(|(key, value)| {
                let number = key
                    .strip_prefix(REVISION_ANNOTATION_PREFIX)?
                    .parse::<u64>()
                    .ok()
                    .filter(|n| *n > 0)?;
                Some(Revision {
                    number,
                    spec: value.clone(),
                })
            })
            .collect();
        revisions.sort_by_key(|r| r.number);
        Self { revisions }
    }

    pub fn revisions_of<K: Resource>(resource: &K) -> Self {
        resource
            .meta()
            .annotations
            .as_ref()
            .map(Self::from_annotations)
            .unwrap_or_default()
    }

    /// Append `spec` as revision `last + 1` and return its number
    pub fn add(&mut self, spec: impl Into<String>) -> u64 {
        let number = self.revisions.last().map_or(0, |r| r.number) + 1;
        self.revisions.push(Revision {
            number,
            spec: spec.into(),
        });
        number
    }

    pub fn latest(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    pub fn get(&self, number: u64) -> Option<&Revision> {
        self.revisions
            .binary_search_by_key(&number, |r| r.number)
            .ok()
            .map(|i| &self.revisions[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Revision> {
        self.revisions.iter()
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Drop all but the newest `limit` revisions
    pub fn retain_latest(&mut self, limit: usize) {
        let excess = self.revisions.len().saturating_sub(limit);
        self.revisions.drain(..excess);
    }
}

/// Patch turning the annotations of `current` into those of `updated`.
///
/// Revisions missing from `updated` are removed one by one. New revisions are
/// added as one contiguous batch of key/value additions into the annotations
/// map, ascending by number.
///
/// # Errors
///
/// [`Error::RevisionMutated`] when a number present in both histories carries
/// different content.
pub fn diff(current: &RevisionHistory, updated: &RevisionHistory) -> Result<JsonPatch> {
    let mut patch = JsonPatch::new();

    for revision in current.iter() {
        match updated.get(revision.number) {
            Some(other) if other.spec != revision.spec => {
                return Err(Error::RevisionMutated(revision.number));
            }
            Some(_) => {}
            None => {
                patch = patch.remove(format!(
                    "{ANNOTATIONS_PATH}/{}",
                    super::patch::escape_key(&revision.annotation_key())
                ));
            }
        }
    }

    let mut additions = JsonPatch::new();
    for revision in updated.iter() {
        if current.get(revision.number).is_none() {
            additions = additions.add_kv(
                ANNOTATIONS_PATH,
                &revision.annotation_key(),
                revision.spec.clone(),
            );
        }
    }

    Ok(patch.extend(additions))
}

/// Record the current spec of `stack` as a new revision when it changed.
///
/// Returns the patch to apply to the Stack, already pruned to `limit`
/// revisions, or `None` when the latest revision matches the spec.
pub fn record(stack: &Stack, limit: usize) -> Result<Option<JsonPatch>> {
    let spec = serde_json::to_string(&stack.spec)?;
    let current = RevisionHistory::revisions_of(stack);

    if current.latest().is_some_and(|r| r.spec == spec) {
        return Ok(None);
    }

    let mut updated = current.clone();
    let number = updated.add(spec);
    updated.retain_latest(limit.max(1));
    debug!("Recording revision {} ({} retained)", number, updated.len());

    let patch = diff(&current, &updated)?;
    if stack.metadata.annotations.is_none() {
        // `add` of the whole map would drop annotations set since this read
        let guard = match &stack.metadata.resource_version {
            Some(version) => JsonPatch::new().test(RESOURCE_VERSION_PATH, version.clone()),
            None => JsonPatch::new(),
        };
        return Ok(Some(
            guard
                .add(ANNOTATIONS_PATH, serde_json::json!({}))
                .extend(patch),
        ));
    }
    Ok(Some(patch))
}

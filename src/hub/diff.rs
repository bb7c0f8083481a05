//! Keyed snapshot diffing for channels that report changes instead of full state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

/// One entity that differs between two polls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change<T> {
    pub kind: ChangeKind,
    pub key: String,
    pub before: Option<T>,
    pub after: Option<T>,
}

/// Remembers the previous poll, keyed by entity id
#[derive(Debug, Clone)]
pub struct SnapshotDiff<T> {
    previous: Option<BTreeMap<String, T>>,
}

impl<T> Default for SnapshotDiff<T> {
    fn default() -> Self {
        Self { previous: None }
    }
}

impl<T: Clone + PartialEq> SnapshotDiff<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` until the first snapshot has been recorded
    pub fn is_empty(&self) -> bool {
        self.previous.is_none()
    }

    /// Record `items` as the current snapshot and return what changed
    ///
    /// The first call only establishes the baseline and reports nothing.
    pub fn update(&mut self, items: &[T], key: impl Fn(&T) -> String) -> Vec<Change<T>> {
        self.update_by(items, key, |before, after| before == after)
    }

    /// Like [`update`](Self::update), with `same` deciding whether an entity
    /// present in both polls counts as changed
    pub fn update_by(
        &mut self,
        items: &[T],
        key: impl Fn(&T) -> String,
        same: impl Fn(&T, &T) -> bool,
    ) -> Vec<Change<T>> {
        let current: BTreeMap<String, T> = items
            .iter()
            .map(|item| (key(item), item.clone()))
            .collect();

        let Some(previous) = self.previous.replace(current.clone()) else {
            return vec![];
        };

        let mut changes = vec![];

        for (key, after) in &current {
            match previous.get(key) {
                None => changes.push(Change {
                    kind: ChangeKind::Added,
                    key: key.clone(),
                    before: None,
                    after: Some(after.clone()),
                }),
                Some(before) if !same(before, after) => changes.push(Change {
                    kind: ChangeKind::Changed,
                    key: key.clone(),
                    before: Some(before.clone()),
                    after: Some(after.clone()),
                }),
                Some(_) => {}
            }
        }

        for (key, before) in previous {
            if !current.contains_key(&key) {
                changes.push(Change {
                    kind: ChangeKind::Removed,
                    key,
                    before: Some(before),
                    after: None,
                });
            }
        }

        changes
    }
}

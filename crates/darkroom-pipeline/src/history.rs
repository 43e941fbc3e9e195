//! Append-only history of parameter snapshots.
//!
//! Each [`HistoryItem`] records the full parameter block and enabled
//! flag of one instance after an edit. A cursor separates applied items
//! from the redo tail; appending while the cursor is not at the end
//! discards the tail first.

use serde::{Deserialize, Serialize};

use crate::instance::{InstanceId, ModuleInstance};
use crate::operation::ParamBlock;

/// One recorded edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    /// Monotonic sequence number.
    pub seq: u64,
    /// Instance the edit applies to.
    pub instance: InstanceId,
    /// Module name of the instance.
    pub module: String,
    /// Parameters after the edit.
    pub params: ParamBlock,
    /// Enabled flag after the edit.
    pub enabled: bool,
}

impl HistoryItem {
    /// Returns `true` if the item was recorded for `instance`. Items of
    /// a different module under a reused identifier never match.
    #[must_use]
    pub fn applies_to(&self, instance: &ModuleInstance) -> bool {
        self.instance == instance.id() && self.module == instance.name()
    }
}

/// Parameters and enabled flag of an instance at some point in history.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamState {
    /// Parameter block.
    pub params: ParamBlock,
    /// Enabled flag.
    pub enabled: bool,
}

/// The edit log of one image.
#[derive(Debug, Clone, Default)]
pub struct HistoryStack {
    items: Vec<HistoryItem>,
    cursor: usize,
    next_seq: u64,
}

impl HistoryStack {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a history from persisted items. The cursor is clamped to
    /// the number of items.
    #[must_use]
    pub fn from_parts(items: Vec<HistoryItem>, cursor: usize) -> Self {
        let next_seq = items.iter().map(|i| i.seq + 1).max().unwrap_or(0);
        let cursor = cursor.min(items.len());
        Self {
            items,
            cursor,
            next_seq,
        }
    }

    /// Record that `instance` now has `params` and `enabled`.
    ///
    /// Any undone items past the cursor are discarded first.
    pub fn append(&mut self, instance: &ModuleInstance, params: ParamBlock, enabled: bool) -> u64 {
        self.items.truncate(self.cursor);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push(HistoryItem {
            seq,
            instance: instance.id(),
            module: instance.name().to_string(),
            params,
            enabled,
        });
        self.cursor = self.items.len();
        seq
    }

    /// Most recent applied state of `instance`, or its defaults if it
    /// has no applied history.
    #[must_use]
    pub fn current(&self, instance: &ModuleInstance) -> ParamState {
        self.applied()
            .iter()
            .rev()
            .find(|item| item.applies_to(instance))
            .map_or_else(
                || defaults(instance),
                |item| ParamState {
                    params: item.params.clone(),
                    enabled: item.enabled,
                },
            )
    }

    /// Fold every applied item of `instance` over its defaults.
    #[must_use]
    pub fn replay_from_default(&self, instance: &ModuleInstance) -> ParamState {
        self.applied()
            .iter()
            .filter(|item| item.applies_to(instance))
            .fold(defaults(instance), |_, item| ParamState {
                params: item.params.clone(),
                enabled: item.enabled,
            })
    }

    /// Step back one item. Returns the instance it affected.
    pub fn undo(&mut self) -> Option<InstanceId> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.items.get(self.cursor).map(|item| item.instance)
    }

    /// Step forward one item. Returns the instance it affected.
    pub fn redo(&mut self) -> Option<InstanceId> {
        let instance = self.items.get(self.cursor)?.instance;
        self.cursor += 1;
        Some(instance)
    }

    /// Returns `true` if there is an item to undo.
    #[must_use]
    pub const fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    /// Returns `true` if there is an item to redo.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.cursor < self.items.len()
    }

    /// Items up to the cursor.
    #[must_use]
    pub fn applied(&self) -> &[HistoryItem] {
        self.items.get(..self.cursor).unwrap_or(&self.items)
    }

    /// All items, including the redo tail.
    #[must_use]
    pub fn items(&self) -> &[HistoryItem] {
        &self.items
    }

    /// Number of applied items.
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }
}

fn defaults(instance: &ModuleInstance) -> ParamState {
    ParamState {
        params: instance.default_params().clone(),
        enabled: instance.definition().default_enabled(),
    }
}

//! Per-row ordering state for one cache entry.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::shared::entity::Entity;

/// Last applied timestamp per row id, plus tombstones for deleted rows.
///
/// A row with a tombstone is never re-added by a change event; only an
/// authoritative refetch that still contains the row clears it.
#[derive(Debug, Default, Clone)]
pub struct RowClock {
    applied: HashMap<String, DateTime<Utc>>,
    tombstones: HashSet<String>,
}

impl RowClock {
    /// Whether an insert/update for `id` at `ts` may be applied.
    /// Equal timestamps are admitted so re-deliveries are idempotent.
    pub fn admits_upsert(&self, id: &str, ts: DateTime<Utc>) -> bool {
        if self.tombstones.contains(id) {
            return false;
        }
        self.applied.get(id).map_or(true, |last| ts >= *last)
    }

    /// Whether a delete for `id` may be applied
    pub fn admits_delete(&self, id: &str, ts: Option<DateTime<Utc>>) -> bool {
        match (ts, self.applied.get(id)) {
            (Some(ts), Some(last)) => ts >= *last,
            _ => true,
        }
    }

    pub fn record_upsert(&mut self, id: &str, ts: DateTime<Utc>) {
        let entry = self.applied.entry(id.to_string()).or_insert(ts);
        if ts > *entry {
            *entry = ts;
        }
    }

    pub fn record_delete(&mut self, id: &str) {
        self.tombstones.insert(id.to_string());
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains(id)
    }

    pub fn last_applied(&self, id: &str) -> Option<DateTime<Utc>> {
        self.applied.get(id).copied()
    }

    /// Reset from an authoritative result set
    pub(crate) fn rebase(&mut self, rows: &[Entity]) {
        self.applied = rows
            .iter()
            .map(|row| (row.id().to_string(), row.version_ts()))
            .collect();
        let applied = &self.applied;
        self.tombstones.retain(|id| !applied.contains_key(id));
    }
}

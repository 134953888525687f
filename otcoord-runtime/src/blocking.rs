use std::collections::{HashMap, HashSet};

use otcoord_common::{StationId, TrainId};

/// One fact: `blocked` is prevented from leaving `place` until `blocker`
/// has passed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockEntry {
    pub place: StationId,
    pub blocker: TrainId,
    pub blocked: TrainId,
}

/// Partial predicate over block entries.
#[derive(Debug, Clone, Default)]
pub struct BlockQuery {
    pub place: Option<StationId>,
    pub blocker: Option<TrainId>,
    pub blocked: Option<TrainId>,
}

impl BlockQuery {
    pub fn place(place: &str) -> Self {
        BlockQuery {
            place: Some(place.to_string()),
            ..Default::default()
        }
    }

    pub fn blocker(mut self, blocker: &str) -> Self {
        self.blocker = Some(blocker.to_string());
        self
    }

    pub fn blocked(mut self, blocked: &str) -> Self {
        self.blocked = Some(blocked.to_string());
        self
    }

    fn matches(&self, entry: &BlockEntry) -> bool {
        self.place.as_ref().map_or(true, |p| *p == entry.place)
            && self.blocker.as_ref().map_or(true, |b| *b == entry.blocker)
            && self.blocked.as_ref().map_or(true, |b| *b == entry.blocked)
    }
}

/// In-memory relation of who currently has whom blocked where, the single
/// source of truth for what has already been told to the simulator.
///
/// The derived counters are updated in the same logical operation as the
/// entry set; after every call they equal the cardinality of the matching
/// entry subset.
#[derive(Default)]
pub struct BlockingLedger {
    entries: HashSet<BlockEntry>,
    /// place -> blocked train -> entry count
    by_place: HashMap<StationId, HashMap<TrainId, u32>>,
    /// blocked train -> blocker -> entry count
    by_blocked: HashMap<TrainId, HashMap<TrainId, u32>>,
}

impl BlockingLedger {
    pub fn new() -> Self {
        Default::default()
    }

    /// Idempotent insert. Returns false when the triple was already present.
    pub fn block(&mut self, place: &str, blocker: &str, blocked: &str) -> bool {
        let entry = BlockEntry {
            place: place.to_string(),
            blocker: blocker.to_string(),
            blocked: blocked.to_string(),
        };
        if !self.entries.insert(entry) {
            return false;
        }
        *self
            .by_place
            .entry(place.to_string())
            .or_default()
            .entry(blocked.to_string())
            .or_insert(0) += 1;
        *self
            .by_blocked
            .entry(blocked.to_string())
            .or_default()
            .entry(blocker.to_string())
            .or_insert(0) += 1;
        true
    }

    /// Idempotent inverse of [`BlockingLedger::block`]. No-op when the
    /// triple is absent.
    pub fn unblock(&mut self, place: &str, blocker: &str, blocked: &str) -> bool {
        let entry = BlockEntry {
            place: place.to_string(),
            blocker: blocker.to_string(),
            blocked: blocked.to_string(),
        };
        if !self.entries.remove(&entry) {
            return false;
        }
        decrement(&mut self.by_place, place, blocked);
        decrement(&mut self.by_blocked, blocked, blocker);
        true
    }

    /// Remove and return every entry matching the query.
    pub fn unblock_all(&mut self, query: &BlockQuery) -> Vec<BlockEntry> {
        let removed: Vec<BlockEntry> = self
            .entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        for entry in &removed {
            self.unblock(&entry.place, &entry.blocker, &entry.blocked);
        }
        removed
    }

    /// Is the train blocked anywhere, by anyone.
    pub fn is_blocked(&self, blocked: &str) -> bool {
        self.by_blocked.contains_key(blocked)
    }

    pub fn is_blocked_exact(&self, place: &str, blocker: &str, blocked: &str) -> bool {
        self.entries.contains(&BlockEntry {
            place: place.to_string(),
            blocker: blocker.to_string(),
            blocked: blocked.to_string(),
        })
    }

    pub fn is_blocked_query(&self, query: &BlockQuery) -> bool {
        self.entries.iter().any(|e| query.matches(e))
    }

    /// Distinct trains held at a place. A train blocked by two blockers at
    /// the same place counts once.
    pub fn count_blocked_at(&self, place: &str) -> usize {
        self.by_place.get(place).map_or(0, |m| m.len())
    }

    pub fn entries(&self) -> impl Iterator<Item = &BlockEntry> {
        self.entries.iter()
    }
}

fn decrement(map: &mut HashMap<String, HashMap<String, u32>>, outer: &str, inner: &str) {
    if let Some(counts) = map.get_mut(outer) {
        if let Some(count) = counts.get_mut(inner) {
            *count -= 1;
            if *count == 0 {
                counts.remove(inner);
            }
        }
        if counts.is_empty() {
            map.remove(outer);
        }
    }
}

//! Server-side rendering support: a JSON-safe snapshot codec for the graph
//! and the hydration window that lets freshly hydrated clients serve
//! `network-only` queries from cache instead of re-fetching.

use crate::graph::FieldMap;
use crate::graph::Graph;
use serde::Deserialize;
use serde::Serialize;
use std::cell::Cell;
use std::time::Duration;
use std::time::Instant;

/// A dehydrated graph: `[key, record]` pairs with refs preserved verbatim.
/// No ordering is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub records: Vec<(String, FieldMap)>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub(crate) fn dehydrate(graph: &Graph) -> Snapshot {
    Snapshot {
        records: graph
            .keys()
            .filter_map(|key| {
                graph
                    .get_record(key)
                    .map(|record| (key.clone(), record.fields().clone()))
            })
            .collect(),
    }
}

pub(crate) fn hydrate(graph: &mut Graph, snapshot: Snapshot) {
    for (key, fields) in snapshot.records {
        graph.put_record(&key, fields);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    /// Hydration with a zero timeout: the flag clears at the next flush.
    UntilFlush,
    Until(Instant),
}

/// The `is_hydrating` flag. A zero timeout holds it until the next
/// notification flush; a positive timeout holds it for the full interval.
#[derive(Debug)]
pub(crate) struct HydrationGate {
    state: Cell<GateState>,
}

impl Default for HydrationGate {
    fn default() -> Self {
        Self {
            state: Cell::new(GateState::Idle),
        }
    }
}

impl HydrationGate {
    pub(crate) fn open(&self, timeout: Duration) {
        let state = if timeout.is_zero() {
            GateState::UntilFlush
        } else {
            GateState::Until(Instant::now() + timeout)
        };
        self.state.set(state);
    }

    pub(crate) fn is_hydrating(&self) -> bool {
        match self.state.get() {
            GateState::Idle => false,
            GateState::UntilFlush => true,
            GateState::Until(deadline) => {
                if Instant::now() < deadline {
                    true
                } else {
                    self.state.set(GateState::Idle);
                    false
                }
            }
        }
    }

    pub(crate) fn on_flush(&self) {
        if self.state.get() == GateState::UntilFlush {
            self.state.set(GateState::Idle);
        }
    }
}

//! The driver layer: normalizing incoming data into the graph and
//! materializing documents back out of it, with cross-call memoization.

use crate::config::CacheConfig;
use crate::graph::FieldMap;
use crate::graph::Graph;
use crate::optimistic::OverlayStack;
use crate::planner::Plan;
use serde_json::Value as JsonValue;
use std::rc::Rc;

pub(crate) mod materialize;
pub(crate) mod normalize;

pub use materialize::MaterializeResult;
pub use materialize::OkFlags;
pub use materialize::Source;

pub(crate) use materialize::MemoEntry;
pub(crate) use materialize::MemoKey;
pub(crate) use materialize::MemoStore;

/// How a materialization should read and interact with the memo store.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadOptions {
    pub(crate) canonical: bool,
    pub(crate) prefer_optimistic: bool,
    pub(crate) fingerprint: bool,
    pub(crate) prefer_cache: bool,
    pub(crate) update_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            canonical: true,
            prefer_optimistic: true,
            fingerprint: true,
            prefer_cache: true,
            update_cache: true,
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn materialize(
    config: &CacheConfig,
    graph: &Graph,
    overlays: &OverlayStack,
    memo: &mut MemoStore,
    plan: &Rc<Plan>,
    variables: &FieldMap,
    root_id: &str,
    options: ReadOptions,
) -> MaterializeResult {
    let key = MemoKey {
        plan: Rc::as_ptr(plan) as usize,
        root: root_id.to_string(),
        variables: crate::planner::canonical_json(&JsonValue::Object(variables.clone())),
        canonical: options.canonical,
        optimistic: options.prefer_optimistic,
    };
    let overlay_epoch = overlays.epoch();

    if options.prefer_cache {
        if let Some(entry) = memo.lookup(&key, graph, overlay_epoch) {
            tracing::trace!(root = root_id, "materialize served from memo");
            return MaterializeResult {
                data: entry.data.clone(),
                ok: entry.ok,
                source: Source::Cache,
                hot: true,
                fingerprint: Some(entry.fingerprint),
            };
        }
    }

    let raw = materialize::run(
        config,
        graph,
        overlays,
        &materialize::MaterializeParams {
            plan,
            variables,
            root_id,
            canonical: options.canonical,
            prefer_optimistic: options.prefer_optimistic,
        },
    );
    let fingerprint =
        raw.fingerprint(options.prefer_optimistic.then_some(overlay_epoch));
    let source = if raw.data.is_some() {
        Source::Graph
    } else {
        Source::None
    };

    if options.update_cache {
        memo.store(
            key,
            MemoEntry {
                data: raw.data.clone(),
                ok: raw.ok,
                deps: raw.deps.clone(),
                overlay_epoch,
                fingerprint,
            },
        );
    }

    MaterializeResult {
        data: raw.data,
        ok: raw.ok,
        source,
        hot: false,
        fingerprint: options.fingerprint.then_some(fingerprint),
    }
}

//! Resume and dedup planning.
//!
//! The work list is the input, in input order, minus every item whose id
//! already has a resolved record in the checkpoint.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, warn};

use crate::checkpoint::CheckpointSet;
use crate::dataset::{ItemId, WorkItem};

/// Work computed for one run.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Items to dispatch, in input order.
    pub pending: Vec<WorkItem>,
    /// Records read from the input.
    pub total_input: usize,
    /// Items skipped because the checkpoint already resolves them.
    pub already_resolved: usize,
    /// Records without a usable `id`.
    pub dropped_missing_id: usize,
    /// Records whose id appeared earlier in the input.
    pub duplicates: usize,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_ids(&self) -> Vec<ItemId> {
        self.pending.iter().map(|item| item.id().clone()).collect()
    }
}

/// Computes the pending work for a run.
///
/// Records without an integer or string `id` are dropped with a warning.
/// When an id occurs more than once in the input, the first occurrence wins.
/// Failure records count as resolved unless `retry_failed` is set; a success
/// record with an empty payload never does.
pub fn plan(records: Vec<Value>, checkpoint: &CheckpointSet, retry_failed: bool) -> Plan {
    let mut result = Plan {
        total_input: records.len(),
        ..Default::default()
    };
    let mut seen: HashSet<ItemId> = HashSet::new();

    for (index, record) in records.into_iter().enumerate() {
        let Some(item) = WorkItem::from_value(record) else {
            warn!(index, "Input record has no usable id, skipping");
            result.dropped_missing_id += 1;
            continue;
        };

        if !seen.insert(item.id().clone()) {
            warn!(id = %item.id(), index, "Duplicate id in input, keeping first occurrence");
            result.duplicates += 1;
            continue;
        }

        if checkpoint.is_resolved(item.id(), retry_failed) {
            result.already_resolved += 1;
            continue;
        }

        result.pending.push(item);
    }

    debug!(
        total = result.total_input,
        pending = result.pending.len(),
        resolved = result.already_resolved,
        dropped = result.dropped_missing_id,
        duplicates = result.duplicates,
        "Planned work"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Failure, ResultRecord};
    use serde_json::{json, Map};

    fn checkpoint() -> CheckpointSet {
        let mut set = CheckpointSet::new();
        let mut payload = Map::new();
        payload.insert("translation".to_string(), json!("done"));
        set.insert(ResultRecord::success(ItemId::Int(1), payload));
        set.insert(ResultRecord::failure(
            ItemId::Int(2),
            Failure::validation("missing image"),
        ));
        set.insert(ResultRecord::success(ItemId::Int(3), Map::new()));
        set
    }

    fn input() -> Vec<Value> {
        vec![
            json!({"id": 4}),
            json!({"id": 1}),
            json!({"id": 2}),
            json!({"id": 3}),
            json!({"prompt": "no id"}),
            json!({"id": 4, "prompt": "dup"}),
            json!({"id": "x"}),
        ]
    }

    #[test]
    fn test_plan_skips_resolved() {
        let plan = plan(input(), &checkpoint(), false);
        assert_eq!(
            plan.pending_ids(),
            vec![ItemId::Int(4), ItemId::Int(3), ItemId::from("x")]
        );
        assert_eq!(plan.total_input, 7);
        assert_eq!(plan.already_resolved, 2);
        assert_eq!(plan.dropped_missing_id, 1);
        assert_eq!(plan.duplicates, 1);
    }

    #[test]
    fn test_plan_retry_failed() {
        let plan = plan(input(), &checkpoint(), true);
        assert_eq!(
            plan.pending_ids(),
            vec![ItemId::Int(4), ItemId::Int(2), ItemId::Int(3), ItemId::from("x")]
        );
        assert_eq!(plan.already_resolved, 1);
    }

    #[test]
    fn test_plan_first_duplicate_wins() {
        let plan = plan(input(), &CheckpointSet::new(), false);
        let first = &plan.pending[0];
        assert_eq!(first.id(), &ItemId::Int(4));
        assert!(first.field("prompt").is_none());
    }

    #[test]
    fn test_plan_everything_resolved() {
        let plan = plan(vec![json!({"id": 1}), json!({"id": 2})], &checkpoint(), false);
        assert!(plan.is_empty());
        assert_eq!(plan.already_resolved, 2);
    }
}

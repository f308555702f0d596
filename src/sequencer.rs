// ABOUTME: Transaction-scoped changeid allocation and dependency-safe sequencing order
// ABOUTME: Replaces any process-wide counter with an explicit value owned by the caller

use crate::change::Operation;
use crate::model::TableModel;
use std::collections::HashMap;
use std::ops::Range;

/// Hands out changeid values for one transaction.
///
/// All tables draw from one counter, so ids are strictly increasing per table
/// and the relative order of rows in different tables is a total order that
/// consumers can replay. A sequencer is seeded from the highest changeid
/// already recorded and dropped when the transaction ends.
#[derive(Debug, Clone)]
pub struct Sequencer {
    next: i64,
    last_by_table: HashMap<String, i64>,
}

impl Sequencer {
    /// Start allocating right after `last_assigned` (0 for an empty history).
    pub fn starting_after(last_assigned: i64) -> Self {
        Self {
            next: last_assigned.max(0) + 1,
            last_by_table: HashMap::new(),
        }
    }

    /// Allocate a single changeid for `table`.
    pub fn next_change_id(&mut self, table: &str) -> i64 {
        let id = self.next;
        self.next += 1;
        self.last_by_table.insert(table.to_string(), id);
        id
    }

    /// Allocate `count` consecutive changeids for `table`.
    pub fn reserve(&mut self, table: &str, count: u64) -> Range<i64> {
        let start = self.next;
        let end = start + count as i64;
        if count > 0 {
            self.next = end;
            self.last_by_table.insert(table.to_string(), end - 1);
        }
        start..end
    }

    /// Highest id handed to `table` by this sequencer.
    pub fn last_assigned(&self, table: &str) -> Option<i64> {
        self.last_by_table.get(table).copied()
    }

    /// The id the next allocation will return.
    pub fn peek(&self) -> i64 {
        self.next
    }
}

/// Order in which (table, operation) groups receive changeids.
///
/// `ordered` lists tables parent-before-child. Deletes are sequenced first,
/// children before parents, so a replaying consumer never removes a row that
/// is still referenced. Inserts and updates follow, parents before children,
/// so a referenced row always exists before its referrer.
pub fn sequencing_plan<'a>(ordered: &[&'a TableModel]) -> Vec<(&'a TableModel, Operation)> {
    let mut plan = Vec::with_capacity(ordered.len() * 3);
    for model in ordered.iter().rev() {
        plan.push((*model, Operation::Delete));
    }
    for model in ordered {
        plan.push((*model, Operation::Insert));
        plan.push((*model, Operation::Update));
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Column;

    fn model(table: &str) -> TableModel {
        TableModel::new(table, table, vec!["id".into()], vec![Column::new("id")]).unwrap()
    }

    #[test]
    fn test_ids_are_strictly_increasing_across_tables() {
        let mut seq = Sequencer::starting_after(10);
        assert_eq!(seq.next_change_id("a"), 11);
        assert_eq!(seq.next_change_id("b"), 12);
        assert_eq!(seq.next_change_id("a"), 13);
        assert_eq!(seq.last_assigned("a"), Some(13));
        assert_eq!(seq.last_assigned("b"), Some(12));
        assert_eq!(seq.last_assigned("c"), None);
    }

    #[test]
    fn test_reserve_ranges() {
        let mut seq = Sequencer::starting_after(0);
        assert_eq!(seq.reserve("a", 3), 1..4);
        assert_eq!(seq.reserve("b", 0), 4..4);
        assert_eq!(seq.last_assigned("b"), None);
        assert_eq!(seq.reserve("b", 2), 4..6);
        assert_eq!(seq.peek(), 6);
    }

    #[test]
    fn test_negative_seed_is_clamped() {
        let mut seq = Sequencer::starting_after(-5);
        assert_eq!(seq.next_change_id("a"), 1);
    }

    #[test]
    fn test_sequencing_plan_orders_deletes_child_first() {
        let parent = model("parent");
        let child = model("child");
        let plan: Vec<(String, Operation)> = sequencing_plan(&[&parent, &child])
            .into_iter()
            .map(|(m, op)| (m.table().to_string(), op))
            .collect();
        assert_eq!(
            plan,
            vec![
                ("child".to_string(), Operation::Delete),
                ("parent".to_string(), Operation::Delete),
                ("parent".to_string(), Operation::Insert),
                ("parent".to_string(), Operation::Update),
                ("child".to_string(), Operation::Insert),
                ("child".to_string(), Operation::Update),
            ]
        );
    }
}

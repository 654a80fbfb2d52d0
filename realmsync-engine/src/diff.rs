//! Generic desired-vs-actual partitioning.
//!
//! Every category (and every nested collection) goes through [`plan_by`]:
//! entries are matched by identity key and split into create / update / skip
//! / delete. Duplicate desired keys resolve last-wins.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::AddAssign;

/// A resource with an identity key and a structural equality rule.
pub trait Resource {
    type Key: Ord + Clone + fmt::Display;

    fn key(&self) -> Self::Key;

    /// True when `actual` already matches `self` in every mutable field.
    fn same_as(&self, actual: &Self) -> bool;
}

/// Partition of one collection.
#[derive(Debug)]
pub struct Plan<'d, 'a, T> {
    pub create: Vec<&'d T>,
    /// `(desired, actual)` pairs that differ.
    pub update: Vec<(&'d T, &'a T)>,
    /// `(desired, actual)` pairs that already match.
    pub skip: Vec<(&'d T, &'a T)>,
    pub delete: Vec<&'a T>,
}

impl<'d, 'a, T> Plan<'d, 'a, T> {
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    /// Every matched `(desired, actual)` pair, updated or not.
    pub fn matched(&self) -> impl Iterator<Item = (&'d T, &'a T)> + '_ {
        self.update.iter().chain(self.skip.iter()).copied()
    }
}

/// Keep only the last desired entry per key, in the order the winners appear.
pub fn dedup_last_wins<T, K, FK>(items: &[T], key: FK) -> Vec<&T>
where
    K: Ord,
    FK: Fn(&T) -> K,
{
    let mut last: BTreeMap<K, usize> = BTreeMap::new();
    for (index, item) in items.iter().enumerate() {
        last.insert(key(item), index);
    }
    let mut winners: Vec<usize> = last.into_values().collect();
    winners.sort_unstable();
    winners.into_iter().map(|i| &items[i]).collect()
}

/// Partition `desired` against `actual` using an explicit key and equality rule.
pub fn plan_by<'d, 'a, T, K, FK, FE>(
    desired: &'d [T],
    actual: &'a [T],
    key: FK,
    same: FE,
) -> Plan<'d, 'a, T>
where
    K: Ord,
    FK: Fn(&T) -> K,
    FE: Fn(&T, &T) -> bool,
{
    // The first actual entry per key is the match; later ones are extras.
    let mut by_key: BTreeMap<K, (usize, &'a T)> = BTreeMap::new();
    let mut extras: Vec<(usize, &'a T)> = Vec::new();
    for (index, item) in actual.iter().enumerate() {
        match by_key.entry(key(item)) {
            Entry::Vacant(slot) => {
                slot.insert((index, item));
            }
            Entry::Occupied(_) => extras.push((index, item)),
        }
    }

    let mut plan = Plan {
        create: Vec::new(),
        update: Vec::new(),
        skip: Vec::new(),
        delete: Vec::new(),
    };

    for wanted in dedup_last_wins(desired, &key) {
        match by_key.remove(&key(wanted)) {
            None => plan.create.push(wanted),
            Some((_, existing)) if same(wanted, existing) => plan.skip.push((wanted, existing)),
            Some((_, existing)) => plan.update.push((wanted, existing)),
        }
    }

    // Whatever is left had no desired counterpart; keep actual order.
    let mut leftover: Vec<(usize, &'a T)> = by_key.into_values().chain(extras).collect();
    leftover.sort_unstable_by_key(|(index, _)| *index);
    plan.delete = leftover.into_iter().map(|(_, item)| item).collect();

    plan
}

/// Partition using the type's own [`Resource`] rules.
pub fn plan<'d, 'a, T: Resource>(desired: &'d [T], actual: &'a [T]) -> Plan<'d, 'a, T> {
    plan_by(desired, actual, T::key, T::same_as)
}

/// Members to add and members to remove for a plain set.
pub fn set_changes(desired: &[String], actual: &[String]) -> (Vec<String>, Vec<String>) {
    let plan = plan_by(desired, actual, |s: &String| s.clone(), |_, _| true);
    // A repeated member is still one member: never remove what is wanted.
    let wanted: BTreeSet<&String> = desired.iter().collect();
    let mut seen = BTreeSet::new();
    let remove = plan
        .delete
        .into_iter()
        .filter(|member| !wanted.contains(member) && seen.insert(*member))
        .cloned()
        .collect();
    (plan.create.into_iter().cloned().collect(), remove)
}

/// Write counts reported by a reconciler.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChangeSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
}

impl ChangeSummary {
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    pub fn is_noop(&self) -> bool {
        self.changes() == 0
    }
}

impl AddAssign for ChangeSummary {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.skipped += other.skipped;
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} deleted={} unchanged={}",
            self.created, self.updated, self.deleted, self.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: &'static str,
        value: u32,
    }

    fn item(name: &'static str, value: u32) -> Item {
        Item { name, value }
    }

    fn names<T>(items: &[&T], f: impl Fn(&T) -> &'static str) -> Vec<&'static str> {
        items.iter().map(|i| f(*i)).collect()
    }

    #[test]
    fn test_plan_partitions_four_ways() {
        let desired = vec![item("a", 1), item("b", 2), item("c", 3)];
        let actual = vec![item("b", 2), item("c", 30), item("d", 4)];
        let plan = plan_by(&desired, &actual, |i| i.name, |d, a| d.value == a.value);

        assert_eq!(names(&plan.create, |i| i.name), vec!["a"]);
        assert_eq!(plan.skip.len(), 1);
        assert_eq!(plan.skip[0].1.name, "b");
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].0.value, 3);
        assert_eq!(plan.update[0].1.value, 30);
        assert_eq!(names(&plan.delete, |i| i.name), vec!["d"]);
        assert!(!plan.is_noop());
    }

    #[test]
    fn test_duplicate_desired_last_wins() {
        let desired = vec![item("a", 1), item("b", 2), item("a", 9)];
        let actual = vec![item("a", 9)];
        let plan = plan_by(&desired, &actual, |i| i.name, |d, a| d.value == a.value);

        // The later "a" is diffed and matches actual.
        assert_eq!(plan.skip.len(), 1);
        assert_eq!(plan.skip[0].0.value, 9);
        assert_eq!(names(&plan.create, |i| i.name), vec!["b"]);
        assert!(plan.update.is_empty());
    }

    #[test]
    fn test_dedup_keeps_winner_order() {
        let items = vec![item("x", 1), item("y", 1), item("x", 2), item("z", 1)];
        let winners = dedup_last_wins(&items, |i| i.name);
        let order: Vec<(&str, u32)> = winners.iter().map(|i| (i.name, i.value)).collect();
        assert_eq!(order, vec![("y", 1), ("x", 2), ("z", 1)]);
    }

    #[test]
    fn test_identical_collections_are_noop() {
        let desired = vec![item("a", 1), item("b", 2)];
        let actual = desired.clone();
        let plan = plan_by(&desired, &actual, |i| i.name, |d, a| d == a);
        assert!(plan.is_noop());
        assert_eq!(plan.skip.len(), 2);
    }

    #[test]
    fn test_set_changes() {
        let desired = vec!["a".to_string(), "b".to_string(), "b".to_string()];
        let actual = vec!["b".to_string(), "c".to_string()];
        let (add, remove) = set_changes(&desired, &actual);
        assert_eq!(add, vec!["a".to_string()]);
        assert_eq!(remove, vec!["c".to_string()]);

        let (add, remove) = set_changes(&[], &actual);
        assert!(add.is_empty());
        assert_eq!(remove.len(), 2);
    }

    #[test]
    fn test_duplicate_actual_keys_are_deleted() {
        let desired = vec![item("a", 1)];
        let actual = vec![item("a", 1), item("b", 2), item("a", 7), item("c", 3)];
        let plan = plan_by(&desired, &actual, |i| i.name, |d, a| d.value == a.value);

        assert_eq!(plan.skip.len(), 1);
        assert_eq!(plan.skip[0].1.value, 1);
        let deleted: Vec<(&str, u32)> = plan.delete.iter().map(|i| (i.name, i.value)).collect();
        assert_eq!(deleted, vec![("b", 2), ("a", 7), ("c", 3)]);
    }

    #[test]
    fn test_set_changes_ignores_repeated_members() {
        let desired = vec!["a".to_string()];
        let actual = vec!["a".to_string(), "a".to_string(), "z".to_string(), "z".to_string()];
        let (add, remove) = set_changes(&desired, &actual);
        assert!(add.is_empty());
        assert_eq!(remove, vec!["z".to_string()]);
    }

    #[test]
    fn test_summary_accumulates() {
        let mut total = ChangeSummary::default();
        total += ChangeSummary {
            created: 1,
            skipped: 2,
            ..Default::default()
        };
        total += ChangeSummary {
            deleted: 1,
            ..Default::default()
        };
        assert_eq!(total.changes(), 2);
        assert_eq!(total.skipped, 2);
        assert!(!total.is_noop());
        assert!(ChangeSummary::default().is_noop());
    }
}

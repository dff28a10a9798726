use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
};

/// A set that remembers insertion order. Re-inserting a present value keeps its place.
#[derive(Debug, Clone)]
pub struct PendingSet<T: Clone + Eq + Hash> {
    order: VecDeque<T>,
    members: HashSet<T>,
}

impl<T: Clone + Eq + Hash> Default for PendingSet<T> {
    fn default() -> Self {
        PendingSet {
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }
}

impl<T: Clone + Eq + Hash> PendingSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: T) -> bool {
        if self.members.insert(value.clone()) {
            self.order.push_back(value);
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, value: &T) -> bool {
        if self.members.remove(value) {
            self.order.retain(|other| other != value);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    pub fn pop_front(&mut self) -> Option<T> {
        let value = self.order.pop_front()?;
        self.members.remove(&value);
        Some(value)
    }

    /// Empties the set, returning its values oldest first.
    pub fn take(&mut self) -> Vec<T> {
        self.members.clear();
        self.order.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_set_keeps_first_insertion_order() {
        let mut set = PendingSet::new();
        assert!(set.insert(3));
        assert!(set.insert(1));
        assert!(!set.insert(3));
        assert!(set.insert(2));
        assert!(set.remove(&1));
        assert_eq!(set.take(), vec![3, 2]);
        assert!(set.is_empty());
    }
}

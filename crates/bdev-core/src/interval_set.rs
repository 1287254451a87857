//! Set of disjoint half-open byte ranges.
//!
//! Inserting a range merges it with every range it overlaps or touches, so
//! queuing `[0,100)` and `[100,200)` leaves a single `[0,200)`. Used for
//! discard coalescing and for the optional in-flight overlap check.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    /// start → length, never empty, never overlapping or adjacent.
    map: BTreeMap<u64, u64>,
    size: u64,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `[offset, offset + len)`, merging neighbours.
    pub fn insert(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset.saturating_add(len);

        // A range starting at or before `start` may reach into us.
        if let Some((&s, &l)) = self.map.range(..=start).next_back() {
            if s + l >= start {
                start = s;
                end = end.max(s + l);
                self.map.remove(&s);
                self.size -= l;
            }
        }
        // Swallow every range starting inside (or right at the end of) us.
        while let Some((&s, &l)) = self.map.range(start..=end).next() {
            end = end.max(s + l);
            self.map.remove(&s);
            self.size -= l;
        }

        self.map.insert(start, end - start);
        self.size += end - start;
    }

    pub fn insert_set(&mut self, other: &IntervalSet) {
        for (s, l) in other.iter() {
            self.insert(s, l);
        }
    }

    /// Remove `[offset, offset + len)` from the set, splitting ranges as needed.
    pub fn erase(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let end = offset.saturating_add(len);
        let touched: Vec<(u64, u64)> = self
            .overlapping(offset, len)
            .collect();
        for (s, l) in touched {
            self.map.remove(&s);
            self.size -= l;
            if s < offset {
                self.map.insert(s, offset - s);
                self.size += offset - s;
            }
            if s + l > end {
                self.map.insert(end, s + l - end);
                self.size += s + l - end;
            }
        }
    }

    /// Remove every byte of `other` from this set.
    pub fn subtract(&mut self, other: &IntervalSet) {
        for (s, l) in other.iter() {
            self.erase(s, l);
        }
    }

    /// True when any byte of `[offset, offset + len)` is in the set.
    pub fn intersects(&self, offset: u64, len: u64) -> bool {
        self.overlapping(offset, len).next().is_some()
    }

    /// True when the whole of `[offset, offset + len)` is in the set.
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        match self.map.range(..=offset).next_back() {
            Some((&s, &l)) => s + l >= offset.saturating_add(len),
            None => false,
        }
    }

    /// True when the two sets share at least one byte.
    pub fn intersects_set(&self, other: &IntervalSet) -> bool {
        other.iter().any(|(s, l)| self.intersects(s, l))
    }

    fn overlapping(&self, offset: u64, len: u64) -> impl Iterator<Item = (u64, u64)> + '_ {
        let end = offset.saturating_add(len);
        let first = self
            .map
            .range(..offset)
            .next_back()
            .filter(|(&s, &l)| s + l > offset)
            .map(|(&s, &l)| (s, l));
        let rest = self
            .map
            .range(offset..end)
            .map(|(&s, &l)| (s, l));
        first.into_iter().chain(rest).filter(move |_| len > 0)
    }

    /// Iterate `(offset, len)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.map.iter().map(|(&s, &l)| (s, l))
    }

    pub fn num_intervals(&self) -> usize {
        self.map.len()
    }

    /// Total bytes covered.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.size = 0;
    }
}

impl FromIterator<(u64, u64)> for IntervalSet {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        let mut set = IntervalSet::new();
        for (s, l) in iter {
            set.insert(s, l);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(s: &IntervalSet) -> Vec<(u64, u64)> {
        s.iter().collect()
    }

    #[test]
    fn test_adjacent_ranges_merge() {
        let mut s = IntervalSet::new();
        s.insert(0, 100);
        s.insert(100, 100);
        assert_eq!(ranges(&s), vec![(0, 200)]);
        assert_eq!(s.size(), 200);
    }

    #[test]
    fn test_overlapping_and_bridging() {
        let mut s = IntervalSet::new();
        s.insert(0, 10);
        s.insert(20, 10);
        s.insert(40, 10);
        assert_eq!(s.num_intervals(), 3);
        // Bridges all three.
        s.insert(5, 40);
        assert_eq!(ranges(&s), vec![(0, 50)]);
        assert_eq!(s.size(), 50);
    }

    #[test]
    fn test_contained_insert_is_noop() {
        let mut s = IntervalSet::new();
        s.insert(0, 100);
        s.insert(10, 5);
        assert_eq!(ranges(&s), vec![(0, 100)]);
        assert_eq!(s.size(), 100);
    }

    #[test]
    fn test_disjoint_stay_separate() {
        let s: IntervalSet = [(300, 10), (0, 10), (100, 10)].into_iter().collect();
        assert_eq!(ranges(&s), vec![(0, 10), (100, 10), (300, 10)]);
    }

    #[test]
    fn test_erase_splits() {
        let mut s = IntervalSet::new();
        s.insert(0, 100);
        s.erase(40, 20);
        assert_eq!(ranges(&s), vec![(0, 40), (60, 40)]);
        assert_eq!(s.size(), 80);
        s.erase(0, 1000);
        assert!(s.is_empty());
        assert_eq!(s.size(), 0);
    }

    #[test]
    fn test_subtract_and_intersects() {
        let mut a: IntervalSet = [(0, 100), (200, 100)].into_iter().collect();
        let b: IntervalSet = [(50, 200)].into_iter().collect();
        assert!(a.intersects_set(&b));
        a.subtract(&b);
        assert_eq!(ranges(&a), vec![(0, 50), (250, 50)]);
        assert!(!a.intersects_set(&b));
    }

    #[test]
    fn test_intersects_edges() {
        let s: IntervalSet = [(100, 100)].into_iter().collect();
        assert!(!s.intersects(0, 100));
        assert!(s.intersects(0, 101));
        assert!(s.intersects(199, 1));
        assert!(!s.intersects(200, 50));
        assert!(s.contains(120, 80));
        assert!(!s.contains(120, 81));
    }
}

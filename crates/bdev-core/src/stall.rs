//! Stall tracking for in-flight AIO operations.
//!
//! Every queued op is linked here at submission and unlinked at
//! completion. The list is kept in submission order, so the head is always
//! the oldest unresolved op and the completion thread can compare its age
//! against the warn / suicide thresholds in O(1).
//!
//! The list lives in an arena: entries are slots addressed by index, the
//! doubly linked list is built from slot indices, and freed slots go on a
//! free list for reuse. A `StallLink` carries a generation counter so a
//! stale link (slot already reused) is ignored instead of unlinking
//! somebody else's entry.
//!
//! | Operation | Cost |
//! |-----------|------|
//! | link      | O(1) amortized |
//! | unlink    | O(1) |
//! | oldest    | O(1) |

use std::time::{Duration, Instant};

const NIL: u32 = u32::MAX;

/// Position of an entry in a [`StallTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StallLink {
    slot: u32,
    generation: u32,
}

struct Slot {
    submitted: Instant,
    prev: u32,
    next: u32,
    generation: u32,
    occupied: bool,
}

pub struct StallTracker {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl StallTracker {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Append an entry submitted now.
    pub fn link(&mut self) -> StallLink {
        self.link_at(Instant::now())
    }

    /// Append an entry submitted at `submitted`.
    ///
    /// Callers link in submission order; the list is never re-sorted.
    pub fn link_at(&mut self, submitted: Instant) -> StallLink {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot {
                    submitted,
                    prev: NIL,
                    next: NIL,
                    generation: 0,
                    occupied: false,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let tail = self.tail;
        let slot = &mut self.slots[idx as usize];
        slot.submitted = submitted;
        slot.prev = tail;
        slot.next = NIL;
        slot.occupied = true;
        let generation = slot.generation;

        if tail == NIL {
            self.head = idx;
        } else {
            self.slots[tail as usize].next = idx;
        }
        self.tail = idx;
        self.len += 1;

        StallLink { slot: idx, generation }
    }

    /// Remove an entry. Returns its submission time, or `None` for a stale link.
    pub fn unlink(&mut self, link: StallLink) -> Option<Instant> {
        let slot = self.slots.get_mut(link.slot as usize)?;
        if !slot.occupied || slot.generation != link.generation {
            return None;
        }
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        let (prev, next, submitted) = (slot.prev, slot.next, slot.submitted);

        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }

        self.free.push(link.slot);
        self.len -= 1;
        Some(submitted)
    }

    /// The earliest unresolved entry and its submission time.
    pub fn oldest(&self) -> Option<(StallLink, Instant)> {
        if self.head == NIL {
            return None;
        }
        let slot = &self.slots[self.head as usize];
        Some((
            StallLink {
                slot: self.head,
                generation: slot.generation,
            },
            slot.submitted,
        ))
    }

    /// Age of the earliest unresolved entry at `now`.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        self.oldest()
            .map(|(_, submitted)| now.saturating_duration_since(submitted))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for StallTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let t = StallTracker::new();
        assert!(t.oldest().is_none());
        assert!(t.oldest_age(Instant::now()).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn test_oldest_follows_completion_order() {
        let base = Instant::now();
        let mut t = StallTracker::new();
        let a = t.link_at(base);
        let b = t.link_at(base + Duration::from_millis(1));
        let c = t.link_at(base + Duration::from_millis(2));

        assert_eq!(t.oldest().unwrap().0, a);

        // Completing a middle entry does not change the oldest.
        t.unlink(b);
        assert_eq!(t.oldest().unwrap().0, a);

        t.unlink(a);
        let (link, submitted) = t.oldest().unwrap();
        assert_eq!(link, c);
        assert_eq!(submitted, base + Duration::from_millis(2));

        t.unlink(c);
        assert!(t.oldest().is_none());
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn test_oldest_age() {
        let base = Instant::now();
        let mut t = StallTracker::new();
        t.link_at(base);
        let age = t.oldest_age(base + Duration::from_millis(250)).unwrap();
        assert_eq!(age, Duration::from_millis(250));
    }

    #[test]
    fn test_stale_link_ignored() {
        let mut t = StallTracker::new();
        let a = t.link();
        assert!(t.unlink(a).is_some());
        // Slot is reused by the next link; the old handle must not touch it.
        let b = t.link();
        assert!(t.unlink(a).is_none());
        assert_eq!(t.len(), 1);
        assert_eq!(t.oldest().unwrap().0, b);
    }

    #[test]
    fn test_slot_reuse_keeps_order() {
        let base = Instant::now();
        let mut t = StallTracker::new();
        let links: Vec<_> = (0..8)
            .map(|i| t.link_at(base + Duration::from_micros(i)))
            .collect();
        for l in &links[..4] {
            t.unlink(*l);
        }
        // New entries reuse freed slots but go to the back of the list.
        let late = t.link_at(base + Duration::from_micros(100));
        assert_eq!(t.oldest().unwrap().0, links[4]);
        for l in &links[4..] {
            t.unlink(*l);
        }
        assert_eq!(t.oldest().unwrap().0, late);
    }
}

//! Child collection index.
//!
//! A node's children are an ordered list of handles. Lists backed by a
//! relational query are either loaded whole ([`ChildIndex::Flat`]) or, for
//! lazy relations, as a fixed-length list of slots filled window by window
//! ([`ChildIndex::Segmented`]). Embedded-store lists are always flat and are
//! the authoritative copy of the collection.

use crate::handle::Handle;
use crate::key::Key;

/// When a list was last loaded, in terms of the owner's change counter and
/// the engine clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LoadStamp {
    pub(crate) clock: u64,
    pub(crate) counter: u64,
}

#[derive(Debug, Clone)]
pub(crate) enum ChildIndex {
    Flat(Vec<Handle>),
    Segmented(Vec<Option<Handle>>),
}

/// Result of looking at one position.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Loaded(Handle),
    Unloaded,
    OutOfRange,
}

#[derive(Debug, Clone)]
pub(crate) struct ChildList {
    index: ChildIndex,
    stamp: LoadStamp,
    stale: bool,
}

impl ChildList {
    pub(crate) fn flat(handles: Vec<Handle>, stamp: LoadStamp) -> Self {
        Self {
            index: ChildIndex::Flat(handles),
            stamp,
            stale: false,
        }
    }

    pub(crate) fn segmented(total: usize, stamp: LoadStamp) -> Self {
        Self {
            index: ChildIndex::Segmented(vec![None; total]),
            stamp,
            stale: false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.index {
            ChildIndex::Flat(v) => v.len(),
            ChildIndex::Segmented(v) => v.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn slot(&self, index: usize) -> Slot {
        match &self.index {
            ChildIndex::Flat(v) => v.get(index).cloned().map_or(Slot::OutOfRange, Slot::Loaded),
            ChildIndex::Segmented(v) => match v.get(index) {
                None => Slot::OutOfRange,
                Some(None) => Slot::Unloaded,
                Some(Some(h)) => Slot::Loaded(h.clone()),
            },
        }
    }

    /// Returns the start of every window in `start..start + length` that
    /// still has unloaded slots.
    pub(crate) fn missing_windows(&self, start: usize, length: usize, window: usize) -> Vec<usize> {
        let ChildIndex::Segmented(slots) = &self.index else {
            return Vec::new();
        };
        let window = window.max(1);
        let end = start.saturating_add(length).min(slots.len());
        let mut windows = Vec::new();
        let mut at = start - start % window;
        while at < end {
            let upper = (at + window).min(slots.len());
            if slots[at..upper].iter().any(Option::is_none) {
                windows.push(at);
            }
            at += window;
        }
        windows
    }

    /// Fills slots from `start` with loaded handles.
    pub(crate) fn fill(&mut self, start: usize, handles: Vec<Handle>) {
        if let ChildIndex::Segmented(slots) = &mut self.index {
            for (offset, handle) in handles.into_iter().enumerate() {
                if let Some(slot) = slots.get_mut(start + offset) {
                    *slot = Some(handle);
                }
            }
        }
    }

    pub(crate) fn is_fully_loaded(&self) -> bool {
        match &self.index {
            ChildIndex::Flat(_) => true,
            ChildIndex::Segmented(v) => v.iter().all(Option::is_some),
        }
    }

    /// Turns a fully loaded segmented list into a flat one. Local edits
    /// only operate on flat lists.
    pub(crate) fn flatten(&mut self) -> bool {
        if let ChildIndex::Segmented(slots) = &self.index {
            if slots.iter().any(Option::is_none) {
                return false;
            }
            let handles = slots.iter().flatten().cloned().collect();
            self.index = ChildIndex::Flat(handles);
        }
        true
    }

    /// Returns the loaded handles in order.
    pub(crate) fn handles(&self) -> Vec<Handle> {
        match &self.index {
            ChildIndex::Flat(v) => v.clone(),
            ChildIndex::Segmented(v) => v.iter().flatten().cloned().collect(),
        }
    }

    pub(crate) fn position(&self, handle: &Handle) -> Option<usize> {
        match &self.index {
            ChildIndex::Flat(v) => v.iter().position(|h| h == handle),
            ChildIndex::Segmented(v) => v.iter().position(|h| h.as_ref() == Some(handle)),
        }
    }

    pub(crate) fn contains_key(&self, key: &Key) -> bool {
        self.handles().iter().any(|h| h.key().as_ref() == Some(key))
    }

    /// Inserts at `index`, or appends if out of range. Returns false if the
    /// list is not flat.
    pub(crate) fn insert(&mut self, index: usize, handle: Handle) -> bool {
        if !self.flatten() {
            return false;
        }
        if let ChildIndex::Flat(v) = &mut self.index {
            let at = index.min(v.len());
            v.insert(at, handle);
        }
        true
    }

    /// Removes the first entry equal to `handle`.
    pub(crate) fn remove(&mut self, handle: &Handle) -> Option<Handle> {
        if !self.flatten() {
            return None;
        }
        match &mut self.index {
            ChildIndex::Flat(v) => {
                let at = v.iter().position(|h| h == handle)?;
                Some(v.remove(at))
            }
            ChildIndex::Segmented(_) => None,
        }
    }

    pub(crate) fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Returns true if a query-backed list must be loaded again: it was
    /// marked stale, its owner's collection changed, or rows of the child
    /// mapping changed since it was loaded.
    pub(crate) fn needs_reload(&self, counter: u64, data_change: u64) -> bool {
        self.stale || counter > self.stamp.counter || data_change > self.stamp.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(id: &str) -> Handle {
        Handle::for_key(Key::embedded(id))
    }

    #[test]
    fn flat_insert_and_remove() {
        let mut list = ChildList::flat(vec![h("1"), h("2")], LoadStamp::default());
        assert!(list.insert(1, h("3")));
        assert!(list.insert(99, h("4")));
        let keys: Vec<String> = list.handles().iter().filter_map(|x| x.key()).map(|k| k.id()).collect();
        assert_eq!(keys, ["1", "3", "2", "4"]);
        assert!(list.remove(&h("3")).is_some());
        assert!(list.remove(&h("3")).is_none());
        assert_eq!(list.position(&h("2")), Some(1));
    }

    #[test]
    fn segmented_windows() {
        let mut list = ChildList::segmented(25, LoadStamp::default());
        assert!(matches!(list.slot(3), Slot::Unloaded));
        assert!(matches!(list.slot(25), Slot::OutOfRange));
        assert_eq!(list.missing_windows(5, 10, 10), vec![0, 10]);

        list.fill(0, (0..10).map(|i| h(&i.to_string())).collect());
        assert_eq!(list.missing_windows(5, 10, 10), vec![10]);
        assert!(matches!(list.slot(3), Slot::Loaded(_)));
        assert!(!list.is_fully_loaded());
        assert!(!list.insert(0, h("x")));

        list.fill(10, (10..20).map(|i| h(&i.to_string())).collect());
        list.fill(20, (20..25).map(|i| h(&i.to_string())).collect());
        assert!(list.is_fully_loaded());
        assert!(list.insert(0, h("x")));
        assert_eq!(list.len(), 26);
    }

    #[test]
    fn reload_rules() {
        let stamp = LoadStamp {
            clock: 10,
            counter: 2,
        };
        let mut list = ChildList::flat(Vec::new(), stamp);
        assert!(!list.needs_reload(2, 10));
        assert!(list.needs_reload(3, 10));
        assert!(list.needs_reload(2, 11));
        list.mark_stale();
        assert!(list.needs_reload(2, 10));
    }
}

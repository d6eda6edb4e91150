//! Arena-backed binary heap with position tracking.
//!
//! Records live in an [`Arena`] and are referred to by slot id. Several
//! [`IndexedHeap`]s may order the same records by different keys; each heap
//! remembers where every slot currently sits, so a record whose key changed
//! can be re-sifted (or removed) in O(log n) without a linear search.

use std::marker::PhantomData;

/// Ordering used by one heap. The heap root is the element for which `less`
/// holds against every other element.
pub trait HeapOrder<E> {
    fn less(a: &E, b: &E) -> bool;
}

/// Slot storage with id reuse.
#[derive(Debug, Clone)]
pub struct Arena<E> {
    slots: Vec<Option<E>>,
    free: Vec<usize>,
    len: usize,
}

impl<E> Default for Arena<E> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<E> Arena<E> {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, reusing a freed slot if there is one. Returns its id.
    pub fn insert(&mut self, value: E) -> usize {
        self.len += 1;
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(value);
                id
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    /// Take the value out of slot `id` and free the slot for reuse.
    ///
    /// Callers must first remove `id` from every heap ordering it.
    pub fn remove(&mut self, id: usize) -> Option<E> {
        let value = self.slots.get_mut(id)?.take()?;
        self.free.push(id);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, id: usize) -> Option<&E> {
        self.slots.get(id)?.as_ref()
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut E> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot count including freed slots; bounds every id handed out so far.
    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

const ABSENT: usize = usize::MAX;

/// Binary heap of arena slot ids ordered by `O`.
///
/// Cloning a heap yields an independent snapshot: popping from the clone
/// leaves the original and its position table untouched.
#[derive(Debug)]
pub struct IndexedHeap<E, O> {
    ids: Vec<usize>,
    /// Position of each slot id in `ids`, `ABSENT` when not in this heap.
    pos: Vec<usize>,
    _order: PhantomData<fn(&E) -> O>,
}

impl<E, O> Clone for IndexedHeap<E, O> {
    fn clone(&self) -> Self {
        Self {
            ids: self.ids.clone(),
            pos: self.pos.clone(),
            _order: PhantomData,
        }
    }
}

impl<E, O> Default for IndexedHeap<E, O> {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            pos: Vec::new(),
            _order: PhantomData,
        }
    }
}

impl<E, O: HeapOrder<E>> IndexedHeap<E, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether slot `id` is in this heap.
    pub fn contains(&self, id: usize) -> bool {
        self.pos.get(id).is_some_and(|&p| p != ABSENT)
    }

    /// Id at the root without removing it.
    pub fn peek(&self) -> Option<usize> {
        self.ids.first().copied()
    }

    /// Add slot `id`, which must not already be in this heap.
    pub fn push(&mut self, arena: &Arena<E>, id: usize) {
        debug_assert!(!self.contains(id), "slot {} pushed twice", id);
        if self.pos.len() < arena.capacity() {
            self.pos.resize(arena.capacity(), ABSENT);
        }
        self.ids.push(id);
        let at = self.ids.len() - 1;
        self.pos[id] = at;
        self.sift_up(arena, at);
    }

    /// Remove and return the id at the root.
    pub fn pop(&mut self, arena: &Arena<E>) -> Option<usize> {
        let root = self.peek()?;
        self.remove_at(arena, 0);
        Some(root)
    }

    /// Remove an arbitrary slot. Returns false when it was not in the heap.
    pub fn remove(&mut self, arena: &Arena<E>, id: usize) -> bool {
        if !self.contains(id) {
            return false;
        }
        let at = self.pos[id];
        self.remove_at(arena, at);
        true
    }

    /// Restore heap order after the key of `id` changed in the arena.
    pub fn fix(&mut self, arena: &Arena<E>, id: usize) {
        if !self.contains(id) {
            return;
        }
        let at = self.pos[id];
        if !self.sift_down(arena, at) {
            self.sift_up(arena, at);
        }
    }

    fn remove_at(&mut self, arena: &Arena<E>, at: usize) {
        let last = self.ids.len() - 1;
        if at != last {
            self.swap(at, last);
        }
        if let Some(removed) = self.ids.pop() {
            self.pos[removed] = ABSENT;
        }

        if at < self.ids.len() && !self.sift_down(arena, at) {
            self.sift_up(arena, at);
        }
    }

    fn less(&self, arena: &Arena<E>, i: usize, j: usize) -> bool {
        match (arena.get(self.ids[i]), arena.get(self.ids[j])) {
            (Some(a), Some(b)) => O::less(a, b),
            _ => false,
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.ids.swap(i, j);
        self.pos[self.ids[i]] = i;
        self.pos[self.ids[j]] = j;
    }

    fn sift_up(&mut self, arena: &Arena<E>, mut at: usize) {
        while at > 0 {
            let parent = (at - 1) / 2;
            if !self.less(arena, at, parent) {
                break;
            }
            self.swap(at, parent);
            at = parent;
        }
    }

    /// Returns true when the element moved.
    fn sift_down(&mut self, arena: &Arena<E>, start: usize) -> bool {
        let n = self.ids.len();
        let mut at = start;
        loop {
            let left = 2 * at + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.less(arena, right, left) {
                child = right;
            }
            if !self.less(arena, child, at) {
                break;
            }
            self.swap(at, child);
            at = child;
        }
        at > start
    }
}

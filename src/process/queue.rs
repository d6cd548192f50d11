//! Intrusive process queues.
//!
//! Control blocks live in one arena and every queue links them by arena
//! index. Each process carries one [`Link`] per queue kind, so it can be on
//! the all-processes list and on either the ready list or one wait queue
//! at the same time. Unlinking is O(1) wherever the process sits.

use core::marker::PhantomData;

pub const QUEUE_KINDS: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

/// Which of a process's links a queue threads through.
pub trait QueueKind {
    const SLOT: usize;
}

#[derive(Debug)]
pub struct AllProcesses;
#[derive(Debug)]
pub struct Ready;
#[derive(Debug)]
pub struct Blocked;

impl QueueKind for AllProcesses {
    const SLOT: usize = 0;
}

impl QueueKind for Ready {
    const SLOT: usize = 1;
}

impl QueueKind for Blocked {
    const SLOT: usize = 2;
}

/// Arena that owns the links.
pub trait LinkStore {
    fn link(&self, index: usize, kind: usize) -> Link;
    fn link_mut(&mut self, index: usize, kind: usize) -> &mut Link;
}

#[derive(Debug)]
pub struct ProcessQueue<K> {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    _kind: PhantomData<K>,
}

impl<K: QueueKind> ProcessQueue<K> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _kind: PhantomData,
        }
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back<S: LinkStore>(&mut self, store: &mut S, index: usize) {
        *store.link_mut(index, K::SLOT) = Link {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(tail) => store.link_mut(tail, K::SLOT).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    /// Removes `index`, which must be on this queue.
    pub fn unlink<S: LinkStore>(&mut self, store: &mut S, index: usize) {
        let Link { prev, next } = store.link(index, K::SLOT);
        match prev {
            Some(prev) => store.link_mut(prev, K::SLOT).next = next,
            None => {
                debug_assert_eq!(self.head, Some(index));
                self.head = next;
            }
        }
        match next {
            Some(next) => store.link_mut(next, K::SLOT).prev = prev,
            None => {
                debug_assert_eq!(self.tail, Some(index));
                self.tail = prev;
            }
        }
        *store.link_mut(index, K::SLOT) = Link::default();
        self.len -= 1;
    }

    pub fn pop_front<S: LinkStore>(&mut self, store: &mut S) -> Option<usize> {
        let head = self.head?;
        self.unlink(store, head);
        Some(head)
    }

    pub fn next_of<S: LinkStore>(&self, store: &S, index: usize) -> Option<usize> {
        store.link(index, K::SLOT).next
    }

    pub fn iter<'a, S: LinkStore>(&self, store: &'a S) -> Iter<'a, S, K> {
        Iter {
            store,
            cursor: self.head,
            _kind: PhantomData,
        }
    }
}

impl<K: QueueKind> Default for ProcessQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, S, K> {
    store: &'a S,
    cursor: Option<usize>,
    _kind: PhantomData<K>,
}

impl<S: LinkStore, K: QueueKind> Iterator for Iter<'_, S, K> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let index = self.cursor?;
        self.cursor = self.store.link(index, K::SLOT).next;
        Some(index)
    }
}

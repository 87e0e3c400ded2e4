//! One size class of a pool: a FIFO free list plus an in-use count.
//!
//! The bucket's length is its in-use count plus its free-list size. The max
//! length is soft: it never rejects a `get`, it only tells the pool to free a
//! released value instead of keeping it.

use std::collections::VecDeque;

use crate::trace::warn_event;

/// How a bucket holds its free values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// Free values are held until popped or trimmed.
    Strong,
    /// Free values may be reclaimed wholesale under allocation pressure,
    /// independent of the pool's byte accounting having asked for it.
    Reclaimable,
}

/// Recyclable wrapper around a free entry of a reclaimable bucket.
struct Slot<T> {
    value: Option<T>,
}

enum FreeList<T> {
    Strong(VecDeque<T>),
    Reclaimable {
        entries: VecDeque<Box<Slot<T>>>,
        spare: Vec<Box<Slot<T>>>,
    },
}

impl<T> FreeList<T> {
    fn new(kind: BucketKind) -> Self {
        match kind {
            BucketKind::Strong => FreeList::Strong(VecDeque::new()),
            BucketKind::Reclaimable => FreeList::Reclaimable {
                entries: VecDeque::new(),
                spare: Vec::new(),
            },
        }
    }

    fn len(&self) -> usize {
        match self {
            FreeList::Strong(q) => q.len(),
            FreeList::Reclaimable { entries, .. } => entries.len(),
        }
    }

    fn push(&mut self, value: T) {
        match self {
            FreeList::Strong(q) => q.push_back(value),
            FreeList::Reclaimable { entries, spare } => {
                let mut slot = spare.pop().unwrap_or_else(|| Box::new(Slot { value: None }));
                slot.value = Some(value);
                entries.push_back(slot);
            }
        }
    }

    fn pop(&mut self) -> Option<T> {
        match self {
            FreeList::Strong(q) => q.pop_front(),
            FreeList::Reclaimable { entries, spare } => {
                let mut slot = entries.pop_front()?;
                let value = slot.value.take();
                spare.push(slot);
                value
            }
        }
    }
}

pub struct Bucket<T> {
    item_size: usize,
    max_length: usize,
    in_use_length: usize,
    kind: BucketKind,
    free_list: FreeList<T>,
}

impl<T> Bucket<T> {
    /// An empty bucket for items of `item_size` bytes that already has
    /// `in_use_length` values checked out.
    pub fn new(kind: BucketKind, item_size: usize, max_length: usize, in_use_length: usize) -> Self {
        debug_assert!(item_size > 0, "bucket item size must be positive");
        Self {
            item_size,
            max_length,
            in_use_length,
            kind,
            free_list: FreeList::new(kind),
        }
    }

    /// A strong bucket with no length limit.
    pub fn unbounded(item_size: usize) -> Self {
        Self::new(BucketKind::Strong, item_size, usize::MAX, 0)
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn kind(&self) -> BucketKind {
        self.kind
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use_length
    }

    pub fn free_list_size(&self) -> usize {
        self.free_list.len()
    }

    /// Whether in-use plus free exceeds the max length.
    pub fn is_max_length_exceeded(&self) -> bool {
        self.in_use_length.saturating_add(self.free_list_size()) > self.max_length
    }

    /// Take a free value and count it as in use.
    pub fn get(&mut self) -> Option<T> {
        let value = self.pop();
        if value.is_some() {
            self.in_use_length += 1;
        }
        value
    }

    /// Take the oldest free value without touching the in-use count.
    pub fn pop(&mut self) -> Option<T> {
        self.free_list.pop()
    }

    /// Return a value to the free list and count it as no longer in use.
    pub fn release(&mut self, value: T) {
        self.decrement_in_use_count();
        self.free_list.push(value);
    }

    pub fn increment_in_use_count(&mut self) {
        self.in_use_length += 1;
    }

    pub fn decrement_in_use_count(&mut self) {
        if self.in_use_length == 0 {
            warn_event!(item_size = self.item_size, "bucket in-use count already zero");
            return;
        }
        self.in_use_length -= 1;
    }

    /// Drop every free entry of a reclaimable bucket, handing the values back.
    /// Strong buckets keep theirs.
    pub fn reclaim(&mut self) -> Vec<T> {
        if self.kind != BucketKind::Reclaimable {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.free_list_size());
        while let Some(v) = self.pop() {
            out.push(v);
        }
        out
    }

    /// Pop every free value.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.free_list_size());
        while let Some(v) = self.pop() {
            out.push(v);
        }
        out
    }
}

impl<T> std::fmt::Debug for Bucket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("item_size", &self.item_size)
            .field("max_length", &self.max_length)
            .field("in_use", &self.in_use_length)
            .field("free", &self.free_list_size())
            .field("kind", &self.kind)
            .finish()
    }
}

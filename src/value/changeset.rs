//! Change sets: ordered sets of field indices.
//!
//! A [`ChangeSet`] records which fields of a value tree were written since a
//! reference point. Indices refer to the flattened preorder numbering of the
//! associated [`Shape`](crate::Shape); two change sets over the same shape can
//! be unioned or intersected bit-wise.
//!
//! Backed by packed `u64` words. Capacity is fixed at construction to the
//! shape's field count, which also enforces the "every index is valid for the
//! shape" invariant.

const WORD_BITS: usize = 64;

/// An ordered set of field indices over a fixed capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    words: Vec<u64>,
    capacity: usize,
}

impl ChangeSet {
    /// Create an empty set able to hold indices `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(WORD_BITS)],
            capacity,
        }
    }

    /// Create a set with every index in `0..capacity` present.
    pub fn all(capacity: usize) -> Self {
        let mut set = Self::new(capacity);
        set.set_all();
        set
    }

    /// Capacity in indices.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add an index. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.capacity {
            self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
    }

    /// Remove an index.
    pub fn clear(&mut self, index: usize) {
        if index < self.capacity {
            self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }

    /// Whether an index is present.
    pub fn contains(&self, index: usize) -> bool {
        index < self.capacity && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Add every index in `0..capacity`.
    pub fn set_all(&mut self) {
        for word in &mut self.words {
            *word = u64::MAX;
        }
        self.trim_tail();
    }

    /// Remove every index.
    pub fn clear_all(&mut self) {
        for word in &mut self.words {
            *word = 0;
        }
    }

    /// Whether no index is present.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Number of indices present.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// In-place union (`self |= other`).
    ///
    /// The shorter capacity bounds the result; extra bits in `other` are
    /// ignored.
    pub fn union_with(&mut self, other: &ChangeSet) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
        self.trim_tail();
    }

    /// In-place intersection (`self &= other`).
    pub fn intersect_with(&mut self, other: &ChangeSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    /// Union returned as a new set.
    pub fn union(&self, other: &ChangeSet) -> ChangeSet {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    /// Intersection returned as a new set.
    pub fn intersection(&self, other: &ChangeSet) -> ChangeSet {
        let mut out = self.clone();
        out.intersect_with(other);
        out
    }

    /// Copy the contents of `other` into `self` (capacities must match in
    /// practice; extra source bits are dropped).
    pub fn copy_from(&mut self, other: &ChangeSet) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w = other.words.get(i).copied().unwrap_or(0);
        }
        self.trim_tail();
    }

    /// Iterate present indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, word)| {
            let mut w = *word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(wi * WORD_BITS + bit)
            })
        })
    }

    // Mask off bits beyond capacity in the last word.
    fn trim_tail(&mut self) {
        let tail = self.capacity % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << tail) - 1;
            }
        }
    }
}

impl std::fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (n, index) in self.iter().enumerate() {
            if n > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{index}")?;
        }
        write!(f, "}}")
    }
}

//! Labeled tensor indices with runtime identity.
//!
//! An [`Index`] is identified by a unique ID drawn from a process-wide counter
//! and a "prime level", a small integer used to distinguish two copies of the
//! same physical degree of freedom within one expression (e.g. the bra and ket
//! sides of an inner product). The dimension and tags of an index are
//! metadata: two indices compare equal iff their IDs and prime levels match.
//!
//! ```
//! use peps_contract::index::Index;
//!
//! let s = Index::with_tags(2, "Site,n=1");
//! let sp = s.prime();
//! assert_ne!(s, sp);
//! assert_eq!(s, sp.noprime());
//! assert_eq!(sp.dim(), 2);
//! ```

use std::{
    fmt,
    hash::{ Hash, Hasher },
    sync::{ Arc, atomic::{ AtomicU64, Ordering } },
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn generate_id() -> u64 { NEXT_ID.fetch_add(1, Ordering::Relaxed) }

/// A tensor index.
///
/// Cloning an `Index` is cheap; tags are reference-counted.
#[derive(Clone, Debug)]
pub struct Index {
    id: u64,
    dim: usize,
    plev: u32,
    tags: Arc<str>,
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.plev == other.plev
    }
}

impl Eq for Index { }

impl Hash for Index {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.plev.hash(state);
    }
}

impl Index {
    /// Create a new index with a fresh identity and no tags.
    ///
    /// *Panics* if `dim` is zero.
    pub fn new(dim: usize) -> Self { Self::with_tags(dim, "") }

    /// Create a new index with a fresh identity and a comma-separated list of
    /// tags.
    ///
    /// *Panics* if `dim` is zero.
    pub fn with_tags(dim: usize, tags: &str) -> Self {
        assert!(dim > 0, "index dimension must be non-zero");
        Self { id: generate_id(), dim, plev: 0, tags: tags.into() }
    }

    /// Create an index with an explicitly chosen identity.
    ///
    /// Two indices built from the same `id` refer to the same degree of
    /// freedom regardless of `dim`; giving them different dimensions is a
    /// bookkeeping error that surfaces as an index mismatch on contraction.
    pub fn from_raw(id: u64, dim: usize) -> Self {
        assert!(dim > 0, "index dimension must be non-zero");
        Self { id, dim, plev: 0, tags: "".into() }
    }

    /// Return the identity token.
    pub fn id(&self) -> u64 { self.id }

    /// Return the number of values the index can take.
    pub fn dim(&self) -> usize { self.dim }

    /// Return the prime level.
    pub fn plev(&self) -> u32 { self.plev }

    /// Return the tag string.
    pub fn tags(&self) -> &str { &self.tags }

    /// Return `true` if `tag` is one of the comma-separated tags.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.split(',').any(|t| t.trim() == tag)
    }

    /// Return a copy with prime level increased by one.
    pub fn prime(&self) -> Self { self.set_prime(self.plev + 1) }

    /// Return a copy with prime level zero.
    pub fn noprime(&self) -> Self { self.set_prime(0) }

    /// Return a copy with the given prime level.
    pub fn set_prime(&self, plev: u32) -> Self {
        Self { plev, ..self.clone() }
    }

    /// Return a new index with the same dimension, tags, and prime level but a
    /// fresh identity.
    pub fn sim(&self) -> Self {
        Self { id: generate_id(), ..self.clone() }
    }

    /// Return a label for printing purposes.
    pub fn label(&self) -> String { self.to_string() }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tags.is_empty() {
            write!(f, "#{}:{}", self.id, self.dim)?;
        } else {
            write!(f, "{}#{}:{}", self.tags, self.id, self.dim)?;
        }
        (0..self.plev).try_for_each(|_| write!(f, "'"))
    }
}

/// Return the indices that appear exactly once across all given lists, in order
/// of first appearance.
///
/// For a well-formed network (no index held by more than two tensors) these
/// are its free indices.
pub fn symmetric_difference<'a, I, J>(lists: I) -> Vec<Index>
where
    I: IntoIterator<Item = J>,
    J: IntoIterator<Item = &'a Index>,
{
    let mut counts: Vec<(Index, usize)> = Vec::new();
    let mut position: rustc_hash::FxHashMap<Index, usize> =
        rustc_hash::FxHashMap::default();
    for list in lists.into_iter() {
        for idx in list.into_iter() {
            match position.get(idx) {
                Some(k) => { counts[*k].1 += 1; },
                None => {
                    position.insert(idx.clone(), counts.len());
                    counts.push((idx.clone(), 1));
                },
            }
        }
    }
    counts.into_iter()
        .filter_map(|(idx, n)| (n == 1).then_some(idx))
        .collect()
}

/// Return the product of all index dimensions; 1 for an empty list.
pub fn total_dim<'a, I>(indices: I) -> usize
where I: IntoIterator<Item = &'a Index>
{
    indices.into_iter().map(|idx| idx.dim()).product()
}

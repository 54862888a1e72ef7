//! Leaf tensors and the (possibly nested) networks built from them.
//!
//! Tensors are registered once in a [`Leaves`] arena and are afterwards
//! referred to only by [`LeafId`] handles. The identity of a leaf is its handle:
//! two numerically equal tensors registered separately are distinct leaves,
//! while two references to the same handle are the same leaf wherever they
//! appear.
//!
//! A [`Network`] is an un-contracted tensor expression: either a single leaf or
//! a group of sub-networks. Network edges are identified by common indices, so
//! each particular index can only exist as either an unbonded degree of freedom
//! or a bond between exactly two tensors in the network.
//!
//! ```
//! use peps_contract::{
//!     index::Index,
//!     network::{ Leaves, Network },
//!     tensor::Tensor,
//! };
//!
//! let a = Index::new(3);
//! let b = Index::new(4);
//! let c = Index::new(5);
//!
//! let mut leaves = Leaves::new();
//! let x = leaves.insert(Tensor::new([a.clone(), b.clone()], |_| 1.0).unwrap());
//! let y = leaves.insert(Tensor::new([b, c.clone()], |_| 2.0).unwrap());
//!
//! let net = Network::from_leaves([x, y]);
//! assert_eq!(net.free_indices(&leaves).unwrap(), vec![a, c]);
//!
//! let res = net.contract_exact(&leaves).unwrap();
//! assert!(res.data().iter().all(|v| *v == 8.0));
//! ```

use std::ops::{ Deref, DerefMut };
use rustc_hash::{ FxHashMap as HashMap, FxHashSet as HashSet };
use thiserror::Error;
use crate::{
    index::{ self, Index },
    tensor::{ Tensor, TensorError },
};

#[derive(Debug, Error)]
pub enum NetworkError {
    /// Returned when index/tensor bookkeeping is inconsistent, e.g. an index
    /// held by more than two tensors or a free index that no tensor holds.
    #[error("malformed network: {0}")]
    MalformedNetwork(String),

    /// Returned when two tensors are contracted over an index they hold with
    /// different dimensions.
    #[error("index mismatch: {0}")]
    IndexMismatch(String),

    /// Returned when a node of a contraction graph cannot be resolved to a
    /// computed value or a scalar placeholder.
    #[error("unresolved graph node: {0}")]
    ScalarDegenerateNode(String),

    /// Returned when truncation parameters admit no positive rank.
    #[error("truncation infeasible: {0}")]
    TruncationInfeasible(String),

    /// Returned when a leaf handle doesn't exist in a [`Leaves`] arena.
    #[error("missing leaf {0}")]
    MissingLeaf(usize),

    /// Returned by anything involving an operation on the level of individual
    /// tensors.
    #[error("tensor error: {0}")]
    TensorError(TensorError),
}

impl From<TensorError> for NetworkError {
    fn from(err: TensorError) -> Self {
        match err {
            TensorError::IndexMismatch(msg) => Self::IndexMismatch(msg),
            TensorError::TruncationInfeasible(msg) =>
                Self::TruncationInfeasible(msg),
            err => Self::TensorError(err),
        }
    }
}
use NetworkError::*;
pub type NetworkResult<T> = Result<T, NetworkError>;

macro_rules! isomorphism {
    (
        $docstring:literal,
        $name:ident ($iso_to:ident),
        derive: { $($derive:ident),* $(,)? } $(,)?
    ) => {
        #[doc = $docstring]
        #[derive($($derive),*)]
        pub struct $name(pub $iso_to);

        impl From<$iso_to> for $name {
            fn from(x: $iso_to) -> Self { Self(x) }
        }

        impl From<$name> for $iso_to {
            fn from(x: $name) -> Self { x.0 }
        }

        impl From<&$name> for $name {
            fn from(x: &$name) -> Self { *x }
        }

        impl Deref for $name {
            type Target = $iso_to;

            fn deref(&self) -> &Self::Target { &self.0 }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target { &mut self.0 }
        }
    }
}

isomorphism!(
    "Sugared `usize` representing the handle of a registered leaf tensor.",
    LeafId (usize),
    derive: { Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash },
);

/// An arena of leaf tensors.
///
/// Handles count from zero in order of insertion and are never reused.
/// Replacing the value behind a handle (see [`Self::set`]) keeps the handle
/// and so keeps the identity of the leaf.
#[derive(Clone, Debug, Default)]
pub struct Leaves {
    data: Vec<Tensor>,
}

impl Leaves {
    /// Create a new, empty arena.
    pub fn new() -> Self { Self { data: Vec::new() } }

    /// Register a tensor and return its handle.
    pub fn insert(&mut self, tensor: Tensor) -> LeafId {
        self.data.push(tensor);
        LeafId(self.data.len() - 1)
    }

    /// Return the number of registered tensors.
    pub fn len(&self) -> usize { self.data.len() }

    /// Return `true` if no tensors are registered.
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Return a reference to a registered tensor, if it exists.
    pub fn get<I>(&self, id: I) -> Option<&Tensor>
    where I: Into<LeafId>
    {
        self.data.get(id.into().0)
    }

    /// Like [`Self::get`], but failing with [`NetworkError::MissingLeaf`].
    pub fn try_get<I>(&self, id: I) -> NetworkResult<&Tensor>
    where I: Into<LeafId>
    {
        let id = id.into();
        self.data.get(id.0).ok_or(MissingLeaf(id.0))
    }

    /// Replace the value behind a handle.
    ///
    /// Fails if the handle doesn't exist or the new tensor doesn't hold the
    /// same indices (in any order) as the old one.
    pub fn set<I>(&mut self, id: I, tensor: Tensor) -> NetworkResult<()>
    where I: Into<LeafId>
    {
        let id = id.into();
        let old = self.data.get_mut(id.0).ok_or(MissingLeaf(id.0))?;
        let same_indices =
            old.rank() == tensor.rank()
            && old.indices().iter()
                .all(|idx| {
                    tensor.indices().iter()
                        .any(|new| new == idx && new.dim() == idx.dim())
                });
        if !same_indices {
            return Err(MalformedNetwork(
                format!("replacement for leaf {} changes its indices", id.0)));
        }
        *old = tensor;
        Ok(())
    }

    /// Return an iterator over all handles and tensors, in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (LeafId, &Tensor)> + '_ {
        self.data.iter().enumerate().map(|(k, t)| (LeafId(k), t))
    }

    /// Return the indices a leaf occurrence presents to a network.
    pub fn indices_of(&self, leaf: &LeafRef) -> NetworkResult<Vec<Index>> {
        let tensor = self.try_get(leaf.id)?;
        Ok(tensor.indices().iter().map(|idx| leaf.map_index(idx)).collect())
    }

    /// Return the tensor of a leaf occurrence with its replacements applied.
    pub fn value_of(&self, leaf: &LeafRef) -> NetworkResult<Tensor> {
        let tensor = self.try_get(leaf.id)?;
        if leaf.relabel.is_empty() {
            Ok(tensor.clone())
        } else {
            tensor.replace_indices(&leaf.relabel).map_err(NetworkError::from)
        }
    }
}

/// A reference to a registered tensor, seen through an optional replacement of
/// some of its indices.
///
/// Replacements let the same leaf appear under different index labels, e.g. as
/// the bra copy of a ket tensor with primed link indices, without registering a
/// second tensor. Two `LeafRef`s are the same occurrence iff both the handle and
/// the replacements agree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LeafRef {
    pub id: LeafId,
    pub relabel: Vec<(Index, Index)>,
}

impl From<LeafId> for LeafRef {
    fn from(id: LeafId) -> Self { Self { id, relabel: Vec::new() } }
}

impl LeafRef {
    /// Reference a leaf under its own indices.
    pub fn new(id: LeafId) -> Self { id.into() }

    /// Reference a leaf with the given `(old, new)` index replacements.
    pub fn relabeled(id: LeafId, relabel: Vec<(Index, Index)>) -> Self {
        Self { id, relabel }
    }

    /// Map an index of the underlying tensor to the index this occurrence
    /// presents.
    pub fn map_index(&self, idx: &Index) -> Index {
        self.relabel.iter()
            .find(|(old, _)| old == idx)
            .map(|(_, new)| new.clone())
            .unwrap_or_else(|| idx.clone())
    }

    /// Map an index presented by this occurrence back to the underlying
    /// tensor's index.
    pub fn unmap_index(&self, idx: &Index) -> Index {
        self.relabel.iter()
            .find(|(_, new)| new == idx)
            .map(|(old, _)| old.clone())
            .unwrap_or_else(|| idx.clone())
    }

    /// Return the replacements that undo this occurrence's relabeling.
    pub fn inverse_relabel(&self) -> Vec<(Index, Index)> {
        self.relabel.iter()
            .map(|(old, new)| (new.clone(), old.clone()))
            .collect()
    }
}

/// An edge in a [`Network`].
///
/// A wire is either an unbonded degree of freedom belonging to a single leaf
/// occurrence or a bond between exactly two (numbered by order of appearance).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wire {
    Unpaired(usize),
    Paired(usize, usize),
}

/// An un-contracted tensor expression.
///
/// The free indices of a group are the symmetric difference of its children's
/// free indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Network {
    Leaf(LeafRef),
    Group(Vec<Network>),
}

impl From<LeafId> for Network {
    fn from(id: LeafId) -> Self { Self::Leaf(id.into()) }
}

impl From<LeafRef> for Network {
    fn from(leaf: LeafRef) -> Self { Self::Leaf(leaf) }
}

impl Network {
    /// Create a flat group of leaves.
    pub fn from_leaves<I, L>(leaves: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<LeafRef>,
    {
        Self::Group(
            leaves.into_iter().map(|l| Self::Leaf(l.into())).collect())
    }

    /// Create a group from sub-networks.
    pub fn group<I>(children: I) -> Self
    where I: IntoIterator<Item = Network>
    {
        Self::Group(children.into_iter().collect())
    }

    /// Return `true` if `self` holds no leaves at all.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Leaf(_) => false,
            Self::Group(children) => children.iter().all(|c| c.is_empty()),
        }
    }

    /// Return all leaf occurrences in depth-first order.
    pub fn flatten(&self) -> Vec<&LeafRef> {
        fn go<'a>(net: &'a Network, acc: &mut Vec<&'a LeafRef>) {
            match net {
                Network::Leaf(leaf) => { acc.push(leaf); },
                Network::Group(children) => {
                    children.iter().for_each(|c| go(c, acc));
                },
            }
        }

        let mut acc = Vec::new();
        go(self, &mut acc);
        acc
    }

    /// Return the number of leaf occurrences.
    pub fn count_leaves(&self) -> usize { self.flatten().len() }

    /// Return the free (uncontracted) indices of `self`, in order of first
    /// appearance.
    pub fn free_indices(&self, leaves: &Leaves) -> NetworkResult<Vec<Index>> {
        match self {
            Self::Leaf(leaf) => leaves.indices_of(leaf),
            Self::Group(children) => {
                let child_free: Vec<Vec<Index>> =
                    children.iter()
                    .map(|c| c.free_indices(leaves))
                    .collect::<NetworkResult<_>>()?;
                Ok(index::symmetric_difference(&child_free))
            },
        }
    }

    /// Compute the wiring of the flattened network: for each index, which leaf
    /// occurrence(s) (numbered in [`Self::flatten`] order) hold it.
    ///
    /// Fails if the same leaf occurrence is listed twice, if any index is held
    /// by more than two occurrences, if a leaf holds the same index twice after
    /// relabeling, or if a leaf handle is missing.
    pub fn wires(&self, leaves: &Leaves)
        -> NetworkResult<Vec<(Index, Wire)>>
    {
        let mut wires: Vec<(Index, Wire)> = Vec::new();
        let mut position: HashMap<Index, usize> = HashMap::default();
        let mut seen: HashSet<&LeafRef> = HashSet::default();
        for (k, leaf) in self.flatten().into_iter().enumerate() {
            if !seen.insert(leaf) {
                return Err(MalformedNetwork(format!(
                    "leaf {} occurs more than once", leaf.id.0)));
            }
            let indices = leaves.indices_of(leaf)?;
            for idx in indices.into_iter() {
                match position.get(&idx) {
                    Some(p) => {
                        let (_, wire) = &mut wires[*p];
                        match *wire {
                            Wire::Unpaired(j) if j != k => {
                                *wire = Wire::Paired(j, k);
                            },
                            _ => {
                                return Err(MalformedNetwork(format!(
                                    "index {} appears in more than two places",
                                    idx.label(),
                                )));
                            },
                        }
                    },
                    None => {
                        position.insert(idx.clone(), wires.len());
                        wires.push((idx, Wire::Unpaired(k)));
                    },
                }
            }
        }
        Ok(wires)
    }

    /// Check the binary tensor-network invariant.
    pub fn validate(&self, leaves: &Leaves) -> NetworkResult<()> {
        self.wires(leaves).map(|_| ())
    }

    /// Contract the network exactly into a single output tensor whose indices
    /// are [`Self::free_indices`] in order.
    ///
    /// Groups are contracted child by child; the tensors of a group are then
    /// combined greedily, always contracting next the pair of tensors sharing
    /// an index whose result is smallest. Tensors with no common indices are
    /// combined by tensor products at the end. An empty network contracts to
    /// the scalar 1.
    pub fn contract_exact(&self, leaves: &Leaves) -> NetworkResult<Tensor> {
        self.validate(leaves)?;
        let free = self.free_indices(leaves)?;
        let res = self.contract_exact_inner(leaves)?;
        res.permuted(&free).map_err(NetworkError::from)
    }

    fn contract_exact_inner(&self, leaves: &Leaves) -> NetworkResult<Tensor> {
        match self {
            Self::Leaf(leaf) => leaves.value_of(leaf),
            Self::Group(children) => {
                let nodes: Vec<Tensor> =
                    children.iter()
                    .map(|c| c.contract_exact_inner(leaves))
                    .collect::<NetworkResult<_>>()?;
                contract_greedy(nodes)
            },
        }
    }
}

/// Size of the result of contracting two operands with the given index lists.
pub(crate) fn pair_cost<T, F>(a: &[T], b: &[T], dim: F) -> usize
where
    T: PartialEq,
    F: Fn(&T) -> usize,
{
    a.iter()
        .filter(|idx| !b.contains(idx))
        .chain(b.iter().filter(|idx| !a.contains(idx)))
        .map(dim)
        .product()
}

/// Simple greedy algorithm to find the next contraction step, optimized over
/// only a single contraction: among all pairs sharing at least one index,
/// return the one with the smallest result. Ties go to the earliest pair.
pub(crate) fn find_contraction<T, F>(nodes: &[Vec<T>], dim: F)
    -> Option<(usize, usize)>
where
    T: PartialEq,
    F: Fn(&T) -> usize + Copy,
{
    let n = nodes.len();
    (0..n)
        .flat_map(|a| (a + 1..n).map(move |b| (a, b)))
        .filter(|(a, b)| nodes[*a].iter().any(|idx| nodes[*b].contains(idx)))
        .min_by_key(|(a, b)| pair_cost(&nodes[*a], &nodes[*b], dim))
}

fn contract_greedy(mut nodes: Vec<Tensor>) -> NetworkResult<Tensor> {
    loop {
        let sigs: Vec<Vec<Index>> =
            nodes.iter().map(|t| t.indices().to_vec()).collect();
        let Some((a, b)) = find_contraction(&sigs, Index::dim) else { break; };
        // b > a, so removing b first leaves a in place
        let t_b = nodes.swap_remove(b);
        let t_a = nodes.swap_remove(a);
        nodes.push(t_a.contract(&t_b)?);
    }
    let mut remaining = nodes.into_iter();
    let acc = remaining.next().unwrap_or_else(|| Tensor::new_scalar(1.0));
    remaining.try_fold(acc, |a, t| a.contract(&t))
        .map_err(NetworkError::from)
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use super::*;

    #[test]
    fn free_indices_of_nested_groups() {
        let mut rng = StdRng::seed_from_u64(1);
        let (i, j, k, l) =
            (Index::new(2), Index::new(3), Index::new(2), Index::new(3));
        let mut leaves = Leaves::new();
        let a = leaves.insert(
            Tensor::random([i.clone(), j.clone()], &mut rng).unwrap());
        let b = leaves.insert(
            Tensor::random([j.clone(), k.clone()], &mut rng).unwrap());
        let c = leaves.insert(
            Tensor::random([k.clone(), l.clone()], &mut rng).unwrap());
        let net = Network::group([
            Network::from_leaves([a, b]),
            Network::from(c),
        ]);
        assert_eq!(net.free_indices(&leaves).unwrap(), vec![i.clone(), l.clone()]);
        assert_eq!(net.count_leaves(), 3);

        let res = net.contract_exact(&leaves).unwrap();
        let direct = leaves.get(a).unwrap()
            .contract(leaves.get(b).unwrap()).unwrap()
            .contract(leaves.get(c).unwrap()).unwrap();
        assert_eq!(res.indices(), &[i, l]);
        assert!(res.rel_error(&direct).unwrap() < 1e-12);
    }

    #[test]
    fn index_in_three_places_is_malformed() {
        let i = Index::new(2);
        let mut leaves = Leaves::new();
        let ids: Vec<LeafId> =
            (0..3)
            .map(|_| leaves.insert(Tensor::new([i.clone()], |_| 1.0).unwrap()))
            .collect();
        let net = Network::from_leaves(ids);
        assert!(matches!(net.validate(&leaves), Err(MalformedNetwork(_))));
    }

    #[test]
    fn repeated_leaf_is_malformed() {
        let (i, j) = (Index::new(2), Index::new(3));
        let mut leaves = Leaves::new();
        let a = leaves.insert(Tensor::new([i.clone(), j.clone()], |_| 1.0).unwrap());
        let net = Network::from_leaves([a, a]);
        assert!(matches!(net.validate(&leaves), Err(MalformedNetwork(_))));
        assert!(matches!(net.contract_exact(&leaves), Err(MalformedNetwork(_))));
        // nesting doesn't hide the repeat
        let nested = Network::group([
            Network::from_leaves([a]),
            Network::from_leaves([a]),
        ]);
        assert!(matches!(nested.validate(&leaves), Err(MalformedNetwork(_))));
        // a relabeled copy is a different occurrence
        let bra = LeafRef::relabeled(a, vec![(j.clone(), j.prime())]);
        let pair = Network::from_leaves([LeafRef::new(a), bra]);
        assert!(pair.validate(&leaves).is_ok());
    }

    #[test]
    fn relabeled_leaf_forms_inner_product() {
        let mut rng = StdRng::seed_from_u64(2);
        let s = Index::new(2);
        let l = Index::new(3);
        let mut leaves = Leaves::new();
        let a = leaves.insert(
            Tensor::random([s.clone(), l.clone()], &mut rng).unwrap());
        let bra = LeafRef::relabeled(a, vec![(l.clone(), l.prime())]);
        let net = Network::from_leaves([LeafRef::new(a), bra]);
        assert_eq!(net.free_indices(&leaves).unwrap(), vec![l.clone(), l.prime()]);
        let rho = net.contract_exact(&leaves).unwrap();
        let t = leaves.get(a).unwrap();
        let trace: f64 = (0..3).map(|x| rho.data()[[x, x].as_slice()]).sum();
        assert_approx_eq!(f64, trace, t.dot(t).unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn empty_network_is_one() {
        let leaves = Leaves::new();
        let res = Network::group([]).contract_exact(&leaves).unwrap();
        assert_approx_eq!(f64, res.scalar().unwrap(), 1.0);
    }

    #[test]
    fn set_keeps_identity_and_checks_indices() {
        let i = Index::new(2);
        let i_id = i.id();
        let mut leaves = Leaves::new();
        let a = leaves.insert(Tensor::new([i.clone()], |_| 1.0).unwrap());
        leaves.set(a, Tensor::new([i], |_| 2.0).unwrap()).unwrap();
        assert_eq!(leaves.get(a).unwrap().elems(), vec![2.0, 2.0]);
        assert!(leaves.set(a, Tensor::new([Index::new(2)], |_| 0.0).unwrap()).is_err());
        let wider = Index::from_raw(i_id, 3);
        assert!(leaves.set(a, Tensor::new([wider], |_| 0.0).unwrap()).is_err());
        assert_eq!(leaves.get(a).unwrap().shape(), vec![2]);
        assert!(matches!(leaves.try_get(LeafId(7)), Err(MissingLeaf(7))));
    }
}

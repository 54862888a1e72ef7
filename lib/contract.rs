//! Evaluation of networks into single tensors, either exactly or along a
//! binary tree with bounded-rank compression of intermediate results.
//!
//! Tree contraction proceeds bottom-up. After each internal node is
//! contracted, the indices of its result `R` fall into two groups: *outer*
//! indices (free indices of the whole network, plus bonds created by earlier
//! compressions) and *cut* indices (bonds to tensors outside the subtree). When
//! the truncated singular value decomposition of `R` as an outer × cut matrix
//! needs fewer singular values than the total outer dimension, `R` is replaced
//! by `W = S V†` over a new bond, and the isometry `U` is put aside. The root
//! result is finally contracted with all kept isometries in reverse order,
//! which maps every bond back to the outer indices it stands for.
//!
//! With `cutoff = 0` and `max_dim` at least every bond rank, the result is the
//! exact contraction.

use log::debug;
use rustc_hash::{ FxHashSet as HashSet };
use crate::{
    index::{ self, Index },
    network::{ Leaves, LeafRef, Network, NetworkError, NetworkResult },
    tensor::{ Tensor, Truncation },
    tree::{ BinaryTree, Split },
};

/// The record of a single compression.
#[derive(Clone, Debug)]
pub struct Compression {
    /// Isometry over the outer indices and the new bond.
    pub isometry: Tensor,
    /// The new bond index.
    pub bond: Index,
    /// Number of singular values kept.
    pub rank: usize,
    /// Relative weight of the discarded singular values.
    pub discarded: f64,
}

/// Output of [`compress`].
#[derive(Clone, Debug)]
pub struct CompressedNode {
    /// The tensor passed on to the parent node.
    pub tensor: Tensor,
    /// `Some` iff the input was replaced by a smaller representative.
    pub compression: Option<Compression>,
}

/// Compress `tensor` across the split between the indices in `outer` and all
/// others.
///
/// Nothing happens if the outer side is trivial, the cut side is empty, or the
/// truncated rank would not be smaller than the total outer dimension.
pub fn compress(tensor: Tensor, outer: &[Index], trunc: Truncation)
    -> NetworkResult<CompressedNode>
{
    let o: Vec<Index> =
        tensor.indices().iter()
        .filter(|idx| outer.contains(idx))
        .cloned()
        .collect();
    let dim_o = index::total_dim(&o);
    if dim_o <= 1 || o.len() == tensor.rank() {
        return Ok(CompressedNode { tensor, compression: None });
    }
    let svd = tensor.svd(&o, trunc)?;
    if svd.rank >= dim_o {
        return Ok(CompressedNode { tensor, compression: None });
    }
    debug!(
        "compressed {} outer dims to rank {} (discarded weight {:.3e})",
        dim_o, svd.rank, svd.discarded,
    );
    let compression = Compression {
        isometry: svd.u,
        bond: svd.bond,
        rank: svd.rank,
        discarded: svd.discarded,
    };
    Ok(CompressedNode { tensor: svd.q, compression: Some(compression) })
}

struct TreeContraction<'a> {
    leaves: &'a Leaves,
    trunc: Truncation,
    outer: HashSet<Index>,
    kept: Vec<Tensor>,
}

impl<'a> TreeContraction<'a> {
    fn eval(&mut self, tree: &BinaryTree<LeafRef>, root: bool)
        -> NetworkResult<Tensor>
    {
        match tree {
            BinaryTree::Leaf(leaf) => self.leaves.value_of(leaf),
            BinaryTree::Node(l, r) => {
                let left = self.eval(l, false)?;
                let right = self.eval(r, false)?;
                let res = left.contract(&right)?;
                if root { return Ok(res); }
                let outer: Vec<Index> =
                    res.indices().iter()
                    .filter(|idx| self.outer.contains(idx))
                    .cloned()
                    .collect();
                let node = compress(res, &outer, self.trunc)?;
                if let Some(comp) = node.compression {
                    self.outer.insert(comp.bond);
                    self.kept.push(comp.isometry);
                }
                Ok(node.tensor)
            },
        }
    }
}

/// Contract a tree of leaf occurrences with bounded-rank compression.
///
/// The output holds the indices that appear exactly once over the tree's
/// leaves, in order of first appearance.
///
/// Fails with [`NetworkError::TruncationInfeasible`] if `max_dim` is zero or
/// `cutoff` is negative or non-finite, and with
/// [`NetworkError::IndexMismatch`] if two operands hold a common index with
/// different dimensions.
pub fn contract_tree(
    tree: &BinaryTree<LeafRef>,
    leaves: &Leaves,
    cutoff: f64,
    max_dim: usize,
) -> NetworkResult<Tensor>
{
    let trunc = Truncation { cutoff, max_dim };
    trunc.check()?;
    let leaf_indices: Vec<Vec<Index>> =
        tree.leaves().into_iter()
        .map(|leaf| leaves.indices_of(leaf))
        .collect::<NetworkResult<_>>()?;
    let free = index::symmetric_difference(&leaf_indices);

    let mut state = TreeContraction {
        leaves,
        trunc,
        outer: free.iter().cloned().collect(),
        kept: Vec::new(),
    };
    let mut res = state.eval(tree, true)?;
    let nkept = state.kept.len();
    for u in state.kept.iter().rev() {
        res = res.contract(u)?;
    }
    if nkept > 0 { debug!("tree contraction kept {} isometries", nkept); }
    res.permuted(&free).map_err(NetworkError::from)
}

/// A method of contracting a [`Network`] into a single tensor over its free
/// indices (in [`Network::free_indices`] order).
pub trait Contractor {
    fn contract(&self, network: &Network, leaves: &Leaves)
        -> NetworkResult<Tensor>;
}

/// Exact greedy pairwise contraction.
#[derive(Copy, Clone, Debug, Default)]
pub struct ExactContractor;

impl Contractor for ExactContractor {
    fn contract(&self, network: &Network, leaves: &Leaves)
        -> NetworkResult<Tensor>
    {
        network.contract_exact(leaves)
    }
}

/// Contraction along a tree from [`Network::build_tree`] with bounded-rank
/// compression.
#[derive(Copy, Clone, Debug)]
pub struct TreeContractor {
    pub split: Split,
    pub cutoff: f64,
    pub max_dim: usize,
}

impl Contractor for TreeContractor {
    fn contract(&self, network: &Network, leaves: &Leaves)
        -> NetworkResult<Tensor>
    {
        let tree = network.build_tree(leaves, self.split)?;
        let free = network.free_indices(leaves)?;
        contract_tree(&tree, leaves, self.cutoff, self.max_dim)?
            .permuted(&free)
            .map_err(NetworkError::from)
    }
}

/// Choice of [`Contractor`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// [`ExactContractor`]; truncation parameters are ignored.
    #[default]
    Exact,
    /// [`TreeContractor`] with the given index split.
    Tree { split: Split },
}

impl Strategy {
    /// Return the contractor implementing `self`.
    pub fn contractor(self, cutoff: f64, max_dim: usize) -> Box<dyn Contractor> {
        match self {
            Self::Exact => Box::new(ExactContractor),
            Self::Tree { split } =>
                Box::new(TreeContractor { split, cutoff, max_dim }),
        }
    }
}

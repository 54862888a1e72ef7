//! Hierarchical contraction orders as binary trees over leaf occurrences.
//!
//! A contraction tree is built by recursively bisecting the free indices of a
//! network (the "index tree") and sending each tensor to the half its support
//! overlaps most, so that every internal node of the result covers a
//! contiguous patch of the network with a small boundary. Tensors that touch no
//! free index follow their nearest neighbors. No attempt is made at finding an
//! optimal order.

use std::collections::VecDeque;
use rustc_hash::{ FxHashSet as HashSet };
use crate::{
    index::Index,
    network::{ Leaves, LeafRef, Network, NetworkError, NetworkResult },
};
use NetworkError::*;

/// A full binary tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BinaryTree<T> {
    Leaf(T),
    Node(Box<BinaryTree<T>>, Box<BinaryTree<T>>),
}

impl<T> BinaryTree<T> {
    /// Join two trees under a new root.
    pub fn node(left: Self, right: Self) -> Self {
        Self::Node(Box::new(left), Box::new(right))
    }

    /// Return `true` if `self` is a single leaf.
    pub fn is_leaf(&self) -> bool { matches!(self, Self::Leaf(_)) }

    /// Return references to all leaf values, left to right.
    pub fn leaves(&self) -> Vec<&T> {
        fn go<'a, U>(tree: &'a BinaryTree<U>, acc: &mut Vec<&'a U>) {
            match tree {
                BinaryTree::Leaf(x) => { acc.push(x); },
                BinaryTree::Node(l, r) => { go(l, acc); go(r, acc); },
            }
        }

        let mut acc = Vec::new();
        go(self, &mut acc);
        acc
    }

    /// Return the number of leaves.
    pub fn num_leaves(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Node(l, r) => l.num_leaves() + r.num_leaves(),
        }
    }

    /// Return the number of edges on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf(_) => 0,
            Self::Node(l, r) => 1 + l.depth().max(r.depth()),
        }
    }
}

/// Rule for bisecting an ordered list of free indices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Split {
    /// Even positions to the left, odd positions to the right.
    #[default]
    Interleaved,
    /// First half to the left, second half to the right.
    Contiguous,
}

impl Split {
    fn halves<T: Clone>(self, items: &[T]) -> (Vec<T>, Vec<T>) {
        match self {
            Self::Interleaved => {
                let left = items.iter().step_by(2).cloned().collect();
                let right = items.iter().skip(1).step_by(2).cloned().collect();
                (left, right)
            },
            Self::Contiguous => {
                let mid = (items.len() + 1) / 2;
                (items[..mid].to_vec(), items[mid..].to_vec())
            },
        }
    }
}

/// Recursively bisect `free` down to single indices.
///
/// Returns `None` for an empty list.
pub fn index_tree(free: &[Index], split: Split) -> Option<BinaryTree<Index>> {
    match free.len() {
        0 => None,
        1 => Some(BinaryTree::Leaf(free[0].clone())),
        _ => {
            let (l, r) = split.halves(free);
            let left = index_tree(&l, split)?;
            let right = index_tree(&r, split)?;
            Some(BinaryTree::node(left, right))
        },
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Side { Left, Right }

// index lists of the tensors being partitioned; items are positions in `sup`
struct Partitioner<'a> {
    sup: &'a [Vec<Index>],
}

impl<'a> Partitioner<'a> {
    fn shared(&self, a: usize, b: usize) -> usize {
        self.sup[a].iter().filter(|idx| self.sup[b].contains(idx)).count()
    }

    fn partition(&self, items: &[usize], itree: Option<&BinaryTree<Index>>)
        -> BinaryTree<usize>
    {
        if items.len() == 1 { return BinaryTree::Leaf(items[0]); }
        match itree {
            Some(BinaryTree::Node(l, r)) => {
                let (left, right) = self.assign(items, l, r);
                if left.is_empty() {
                    self.partition(&right, Some(r))
                } else if right.is_empty() {
                    self.partition(&left, Some(l))
                } else {
                    BinaryTree::node(
                        self.partition(&left, Some(l)),
                        self.partition(&right, Some(r)),
                    )
                }
            },
            _ => {
                let order = self.bfs_order(items);
                let mid = (order.len() + 1) / 2;
                BinaryTree::node(
                    self.partition(&order[..mid], None),
                    self.partition(&order[mid..], None),
                )
            },
        }
    }

    fn assign(
        &self,
        items: &[usize],
        l: &BinaryTree<Index>,
        r: &BinaryTree<Index>,
    ) -> (Vec<usize>, Vec<usize>)
    {
        let l_idx: Vec<&Index> = l.leaves();
        let r_idx: Vec<&Index> = r.leaves();
        let mut side: Vec<Option<Side>> =
            items.iter()
            .map(|&k| {
                let ol = self.sup[k].iter().filter(|i| l_idx.contains(i)).count();
                let or = self.sup[k].iter().filter(|i| r_idx.contains(i)).count();
                if ol + or == 0 {
                    None
                } else if ol >= or {
                    Some(Side::Left)
                } else {
                    Some(Side::Right)
                }
            })
            .collect();

        // closest-neighbor sweep for tensors touching neither half
        loop {
            let mut changed = false;
            for (j, &k) in items.iter().enumerate() {
                if side[j].is_some() { continue; }
                let (mut bl, mut br) = (0, 0);
                for (jj, &kk) in items.iter().enumerate() {
                    match side[jj] {
                        Some(Side::Left) => { bl += self.shared(k, kk); },
                        Some(Side::Right) => { br += self.shared(k, kk); },
                        None => { },
                    }
                }
                if bl + br > 0 {
                    side[j] = Some(if bl >= br { Side::Left } else { Side::Right });
                    changed = true;
                }
            }
            if !changed { break; }
        }

        let mut left: Vec<usize> = Vec::new();
        let mut right: Vec<usize> = Vec::new();
        for (j, &k) in items.iter().enumerate() {
            match side[j] {
                Some(Side::Left) => { left.push(k); },
                Some(Side::Right) => { right.push(k); },
                None => { },
            }
        }
        // disconnected from both halves
        for (j, &k) in items.iter().enumerate() {
            if side[j].is_none() {
                if left.len() <= right.len() {
                    left.push(k);
                } else {
                    right.push(k);
                }
            }
        }
        (left, right)
    }

    // breadth-first over shared bonds, restarting at the next unvisited item
    // for each disconnected component
    fn bfs_order(&self, items: &[usize]) -> Vec<usize> {
        let mut visited: HashSet<usize> = HashSet::default();
        let mut order: Vec<usize> = Vec::with_capacity(items.len());
        for &start in items.iter() {
            if !visited.insert(start) { continue; }
            let mut queue: VecDeque<usize> = VecDeque::from([start]);
            while let Some(k) = queue.pop_front() {
                order.push(k);
                for &kk in items.iter() {
                    if !visited.contains(&kk) && self.shared(k, kk) > 0 {
                        visited.insert(kk);
                        queue.push_back(kk);
                    }
                }
            }
        }
        order
    }
}

/// Build a binary contraction tree over a flat list of leaf occurrences,
/// guided by the free indices `free` of the network they form.
///
/// Every input occurrence appears in exactly one leaf of the result. Rank-0
/// tensors are attached at the root as extra scalar factors.
///
/// Fails with [`NetworkError::MalformedNetwork`] if `tensors` is empty,
/// contains the same occurrence twice, or if some index of `free` is held by
/// none of the tensors.
pub fn build_tree(
    leaves: &Leaves,
    tensors: &[LeafRef],
    free: &[Index],
    split: Split,
) -> NetworkResult<BinaryTree<LeafRef>>
{
    if tensors.is_empty() {
        return Err(MalformedNetwork("cannot build a tree over no tensors".into()));
    }
    let mut seen: HashSet<&LeafRef> = HashSet::default();
    if let Some(dup) = tensors.iter().find(|t| !seen.insert(*t)) {
        return Err(MalformedNetwork(format!(
            "leaf {} occurs more than once", dup.id.0)));
    }
    let sup: Vec<Vec<Index>> =
        tensors.iter()
        .map(|t| leaves.indices_of(t))
        .collect::<NetworkResult<_>>()?;
    if let Some(idx) = free.iter().find(|idx| !sup.iter().any(|s| s.contains(idx))) {
        return Err(MalformedNetwork(format!(
            "free index {} is not held by any tensor", idx.label())));
    }

    let (scalars, items): (Vec<usize>, Vec<usize>) =
        (0..tensors.len()).partition(|&k| sup[k].is_empty());
    let itree = index_tree(free, split);
    let partitioner = Partitioner { sup: &sup };
    let mut tree: Option<BinaryTree<usize>> =
        (!items.is_empty()).then(|| partitioner.partition(&items, itree.as_ref()));
    for k in scalars.into_iter() {
        tree = Some(match tree {
            Some(t) => BinaryTree::node(t, BinaryTree::Leaf(k)),
            None => BinaryTree::Leaf(k),
        });
    }
    let tree = tree.ok_or_else(|| MalformedNetwork("empty tree".into()))?;
    Ok(tree.map(&|k| tensors[k].clone()))
}

impl<T> BinaryTree<T> {
    /// Apply `f` to every leaf value, keeping the shape of the tree.
    pub fn map<U, F>(self, f: &F) -> BinaryTree<U>
    where F: Fn(T) -> U
    {
        match self {
            Self::Leaf(x) => BinaryTree::Leaf(f(x)),
            Self::Node(l, r) => BinaryTree::node((*l).map(f), (*r).map(f)),
        }
    }
}

impl Network {
    /// Validate `self` and build a contraction tree over its flattened leaf
    /// occurrences, guided by its free indices.
    pub fn build_tree(&self, leaves: &Leaves, split: Split)
        -> NetworkResult<BinaryTree<LeafRef>>
    {
        self.validate(leaves)?;
        let free = self.free_indices(leaves)?;
        let tensors: Vec<LeafRef> =
            self.flatten().into_iter().cloned().collect();
        build_tree(leaves, &tensors, &free, split)
    }
}

#[cfg(test)]
mod tests {
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::tensor::Tensor;
    use super::*;

    // nrow x ncol grid of random tensors with one open index per site
    fn grid(nrow: usize, ncol: usize, leaves: &mut Leaves) -> Network {
        let mut rng = StdRng::seed_from_u64(20);
        let h: Vec<Index> = (0..nrow * ncol).map(|_| Index::new(2)).collect();
        let v: Vec<Index> = (0..nrow * ncol).map(|_| Index::new(2)).collect();
        let mut ids = Vec::new();
        for r in 0..nrow {
            for c in 0..ncol {
                let mut idx = vec![Index::new(2)];
                if c > 0 { idx.push(h[r * ncol + c - 1].clone()); }
                if c + 1 < ncol { idx.push(h[r * ncol + c].clone()); }
                if r > 0 { idx.push(v[(r - 1) * ncol + c].clone()); }
                if r + 1 < nrow { idx.push(v[r * ncol + c].clone()); }
                ids.push(leaves.insert(Tensor::random(idx, &mut rng).unwrap()));
            }
        }
        Network::from_leaves(ids)
    }

    #[test]
    fn index_tree_splits() {
        let idx: Vec<Index> = (0..5).map(|_| Index::new(2)).collect();
        let t = index_tree(&idx, Split::Interleaved).unwrap();
        let order: Vec<&Index> = t.leaves();
        assert_eq!(order, vec![&idx[0], &idx[4], &idx[2], &idx[1], &idx[3]]);
        let t = index_tree(&idx, Split::Contiguous).unwrap();
        assert_eq!(t.leaves(), idx.iter().collect::<Vec<_>>());
        assert_eq!(t.depth(), 3);
        assert!(index_tree(&[], Split::Interleaved).is_none());
    }

    #[test]
    fn tree_partition_is_total() {
        let mut leaves = Leaves::new();
        let net = grid(3, 4, &mut leaves);
        for split in [Split::Interleaved, Split::Contiguous] {
            let tree = net.build_tree(&leaves, split).unwrap();
            let mut got: Vec<usize> =
                tree.leaves().into_iter().map(|l| l.id.0).collect();
            got.sort_unstable();
            let expected: Vec<usize> =
                net.flatten().into_iter().map(|l| l.id.0).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn closed_network_uses_bfs_halves() {
        // ring of six tensors with no free indices
        let mut leaves = Leaves::new();
        let b: Vec<Index> = (0..6).map(|_| Index::new(2)).collect();
        let ids: Vec<_> =
            (0..6)
            .map(|k| {
                let t = Tensor::new(
                    [b[k].clone(), b[(k + 1) % 6].clone()], |_| 1.0).unwrap();
                leaves.insert(t)
            })
            .collect();
        let net = Network::from_leaves(ids);
        let tree = net.build_tree(&leaves, Split::default()).unwrap();
        assert_eq!(tree.num_leaves(), 6);
        assert!(tree.depth() <= 3);
    }

    #[test]
    fn scalars_attach_at_root() {
        let mut leaves = Leaves::new();
        let i = Index::new(2);
        let a = leaves.insert(Tensor::new([i.clone()], |_| 1.0).unwrap());
        let s = leaves.insert(Tensor::new_scalar(2.0));
        let tree = build_tree(
            &leaves, &[LeafRef::new(s), LeafRef::new(a)], &[i], Split::default())
            .unwrap();
        match tree {
            BinaryTree::Node(l, r) => {
                assert_eq!(*l, BinaryTree::Leaf(LeafRef::new(a)));
                assert_eq!(*r, BinaryTree::Leaf(LeafRef::new(s)));
            },
            _ => panic!("expected a node"),
        }
    }

    #[test]
    fn malformed_inputs() {
        let mut leaves = Leaves::new();
        let i = Index::new(2);
        let a = leaves.insert(Tensor::new([i.clone()], |_| 1.0).unwrap());
        let err = build_tree(&leaves, &[], &[], Split::default());
        assert!(matches!(err, Err(MalformedNetwork(_))));
        let err = build_tree(
            &leaves, &[LeafRef::new(a), LeafRef::new(a)], &[], Split::default());
        assert!(matches!(err, Err(MalformedNetwork(_))));
        let err = build_tree(
            &leaves, &[LeafRef::new(a)], &[Index::new(3)], Split::default());
        assert!(matches!(err, Err(MalformedNetwork(_))));
    }
}

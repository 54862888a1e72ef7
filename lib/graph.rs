//! Reusable, differentiable contraction graphs over batches of networks.
//!
//! [`generate_expression`] turns a batch of networks into a symbolic
//! [`Expression`]: a topologically ordered list of pairwise contractions over
//! abstract [`Symbol`]s, with one variable *slot* per distinct leaf occurrence.
//! The concrete leaf occurrences and indices are kept apart in a [`Binding`],
//! so that an expression can be reused for any batch with the same topology
//! (see [`crate::cache`]).
//!
//! The same leaf occurrence is a single variable node wherever it appears in
//! the batch, and identical pairwise contractions are shared between
//! networks, so every intermediate is computed once per evaluation. The
//! reverse pass walks the same node list backwards, accumulating adjoints over
//! all uses of a node, and sums the slot adjoints per [`LeafId`].
//!
//! ```
//! use peps_contract::{
//!     graph,
//!     index::Index,
//!     network::{ Leaves, Network },
//!     tensor::Tensor,
//! };
//!
//! let i = Index::new(2);
//! let mut leaves = Leaves::new();
//! let a = leaves.insert(Tensor::from_elems([i.clone()], vec![1.0, 2.0]).unwrap());
//! let b = leaves.insert(Tensor::from_elems([i], vec![3.0, 4.0]).unwrap());
//!
//! let nets = [Network::from_leaves([a, b])];
//! let (expr, binding) = graph::generate_expression(&nets, &leaves).unwrap();
//! let (val, grads) =
//!     graph::value_and_grad(&expr, &binding, &leaves, |x| (x[0], vec![1.0]))
//!     .unwrap();
//! assert_eq!(val, 11.0);
//! assert_eq!(grads[&a].elems(), vec![3.0, 4.0]);
//! ```

use std::{
    collections::BTreeMap,
    ops::{ Deref, DerefMut },
};
use log::debug;
use rustc_hash::{ FxHashMap as HashMap };
use crate::{
    index::Index,
    network::{
        find_contraction,
        LeafId,
        LeafRef,
        Leaves,
        Network,
        NetworkError,
        NetworkResult,
    },
    tensor::Tensor,
};
use NetworkError::*;

isomorphism!(
    "Sugared `usize` standing for one distinct index of a batch.",
    Symbol (usize),
    derive: { Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash },
);

isomorphism!(
    "Sugared `usize` identifying a node of an [`Expression`].",
    NodeId (usize),
    derive: { Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash },
);

/// Operation computed by a [`SymbolicNode`].
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// The value of a variable slot.
    Variable(usize),
    /// A constant scalar; `Scalar(1.0)` stands in for empty networks.
    Scalar(f64),
    /// Contraction of two earlier nodes over all common symbols.
    Contract(NodeId, NodeId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct SymbolicNode {
    pub op: Op,
    /// Symbols of the node's value (as a set; the order of a computed value's
    /// indices may differ).
    pub signature: Vec<Symbol>,
}

/// A symbolic contraction graph.
///
/// Nodes are stored in topological order: every `Contract` refers only to
/// nodes before it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Expression {
    pub nodes: Vec<SymbolicNode>,
    /// One node per network of the batch.
    pub outputs: Vec<NodeId>,
    /// Index order of each output.
    pub output_signatures: Vec<Vec<Symbol>>,
    /// Indices of each variable slot.
    pub slot_signatures: Vec<Vec<Symbol>>,
    /// Dimension of each symbol.
    pub dims: Vec<usize>,
}

impl Expression {
    /// Return the number of nodes.
    pub fn len(&self) -> usize { self.nodes.len() }

    /// Return `true` if there are no nodes.
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    /// Return the number of `Contract` nodes.
    pub fn num_contractions(&self) -> usize {
        self.nodes.iter()
            .filter(|node| matches!(node.op, Op::Contract(..)))
            .count()
    }
}

/// Concrete leaf occurrences and indices behind the slots and symbols of an
/// [`Expression`].
///
/// Slots and symbols are numbered by first appearance in a depth-first walk of
/// the batch, leaf by leaf.
#[derive(Clone, Debug, Default)]
pub struct Binding {
    slots: Vec<LeafRef>,
    symbols: Vec<Index>,
    slot_pos: HashMap<LeafRef, usize>,
    symbol_pos: HashMap<Index, usize>,
}

impl Binding {
    /// Number the leaf occurrences and indices of a batch.
    pub fn of(networks: &[Network], leaves: &Leaves) -> NetworkResult<Self> {
        let mut binding = Self::default();
        for net in networks.iter() {
            for leaf in net.flatten().into_iter() {
                binding.register(leaf, leaves)?;
            }
        }
        Ok(binding)
    }

    fn register(&mut self, leaf: &LeafRef, leaves: &Leaves)
        -> NetworkResult<usize>
    {
        if let Some(k) = self.slot_pos.get(leaf) { return Ok(*k); }
        for idx in leaves.indices_of(leaf)?.into_iter() {
            if !self.symbol_pos.contains_key(&idx) {
                self.symbol_pos.insert(idx.clone(), self.symbols.len());
                self.symbols.push(idx);
            }
        }
        let k = self.slots.len();
        self.slot_pos.insert(leaf.clone(), k);
        self.slots.push(leaf.clone());
        Ok(k)
    }

    /// Return the leaf occurrence bound to each slot.
    pub fn slots(&self) -> &[LeafRef] { &self.slots }

    /// Return the index bound to each symbol.
    pub fn symbols(&self) -> &[Index] { &self.symbols }

    /// Return the slot of a leaf occurrence.
    pub fn slot_of(&self, leaf: &LeafRef) -> Option<usize> {
        self.slot_pos.get(leaf).copied()
    }

    /// Return the symbol of an index.
    pub fn symbol_of(&self, idx: &Index) -> Option<Symbol> {
        self.symbol_pos.get(idx).copied().map(Symbol)
    }

    fn slot(&self, slot: usize) -> NetworkResult<&LeafRef> {
        self.slots.get(slot)
            .ok_or_else(|| ScalarDegenerateNode(
                format!("slot {} has no bound leaf", slot)))
    }

    fn resolve(&self, sig: &[Symbol]) -> NetworkResult<Vec<Index>> {
        sig.iter()
            .map(|s| {
                self.symbols.get(s.0).cloned()
                    .ok_or_else(|| ScalarDegenerateNode(
                        format!("symbol {} has no bound index", s.0)))
            })
            .collect()
    }

    fn symbols_of(&self, indices: &[Index]) -> NetworkResult<Vec<Symbol>> {
        indices.iter()
            .map(|idx| {
                self.symbol_of(idx)
                    .ok_or_else(|| MalformedNetwork(
                        format!("index {} is not part of the batch", idx.label())))
            })
            .collect()
    }
}

struct Generator<'a> {
    binding: &'a Binding,
    expr: Expression,
    variables: HashMap<usize, NodeId>,
    contractions: HashMap<(NodeId, NodeId), NodeId>,
    one: Option<NodeId>,
}

impl<'a> Generator<'a> {
    fn push(&mut self, op: Op, signature: Vec<Symbol>) -> NodeId {
        self.expr.nodes.push(SymbolicNode { op, signature });
        NodeId(self.expr.nodes.len() - 1)
    }

    fn variable(&mut self, slot: usize) -> NodeId {
        if let Some(id) = self.variables.get(&slot) { return *id; }
        let sig = self.expr.slot_signatures[slot].clone();
        let id = self.push(Op::Variable(slot), sig);
        self.variables.insert(slot, id);
        id
    }

    fn one(&mut self) -> NodeId {
        if let Some(id) = self.one { return id; }
        let id = self.push(Op::Scalar(1.0), Vec::new());
        self.one = Some(id);
        id
    }

    fn contract(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let key = (a.min(b), a.max(b));
        if let Some(id) = self.contractions.get(&key) { return *id; }
        let sig_a = &self.expr.nodes[key.0.0].signature;
        let sig_b = &self.expr.nodes[key.1.0].signature;
        let sig: Vec<Symbol> =
            sig_a.iter().filter(|s| !sig_b.contains(s))
            .chain(sig_b.iter().filter(|s| !sig_a.contains(s)))
            .copied()
            .collect();
        let id = self.push(Op::Contract(key.0, key.1), sig);
        self.contractions.insert(key, id);
        id
    }

    fn network(&mut self, net: &Network) -> NetworkResult<NodeId> {
        match net {
            Network::Leaf(leaf) => {
                let slot = self.binding.slot_of(leaf)
                    .ok_or_else(|| MalformedNetwork(
                        format!("leaf {} is not part of the batch", leaf.id.0)))?;
                Ok(self.variable(slot))
            },
            Network::Group(children) => {
                let nodes: Vec<NodeId> =
                    children.iter()
                    .map(|c| self.network(c))
                    .collect::<NetworkResult<_>>()?;
                Ok(self.reduce(nodes))
            },
        }
    }

    // greedy pairwise reduction by smallest result, then outer products
    fn reduce(&mut self, mut nodes: Vec<NodeId>) -> NodeId {
        loop {
            let sigs: Vec<Vec<Symbol>> =
                nodes.iter()
                .map(|n| self.expr.nodes[n.0].signature.clone())
                .collect();
            let dims = &self.expr.dims;
            let Some((a, b)) = find_contraction(&sigs, |s: &Symbol| dims[s.0])
                else { break; };
            let n_b = nodes.swap_remove(b);
            let n_a = nodes.swap_remove(a);
            let c = self.contract(n_a, n_b);
            nodes.push(c);
        }
        let mut remaining = nodes.into_iter();
        match remaining.next() {
            Some(first) => remaining.fold(first, |acc, n| self.contract(acc, n)),
            None => self.one(),
        }
    }
}

/// Build the symbolic contraction graph of a batch of networks, along with the
/// binding of its slots and symbols to the batch's leaf occurrences and
/// indices.
///
/// Fails with [`NetworkError::MalformedNetwork`] if any network is malformed.
pub fn generate_expression(networks: &[Network], leaves: &Leaves)
    -> NetworkResult<(Expression, Binding)>
{
    networks.iter().try_for_each(|net| net.validate(leaves))?;
    let binding = Binding::of(networks, leaves)?;
    let slot_signatures: Vec<Vec<Symbol>> =
        binding.slots().iter()
        .map(|leaf| binding.symbols_of(&leaves.indices_of(leaf)?))
        .collect::<NetworkResult<_>>()?;
    let dims: Vec<usize> = binding.symbols().iter().map(Index::dim).collect();
    let expr = {
        let mut generator = Generator {
            binding: &binding,
            expr: Expression {
                slot_signatures,
                dims,
                ..Expression::default()
            },
            variables: HashMap::default(),
            contractions: HashMap::default(),
            one: None,
        };
        for net in networks.iter() {
            let node = generator.network(net)?;
            let free = net.free_indices(leaves)?;
            let sig = binding.symbols_of(&free)?;
            generator.expr.outputs.push(node);
            generator.expr.output_signatures.push(sig);
        }
        generator.expr
    };
    debug!(
        "generated expression: {} networks, {} slots, {} nodes ({} contractions)",
        networks.len(), expr.slot_signatures.len(), expr.len(),
        expr.num_contractions(),
    );
    Ok((expr, binding))
}

/// Gradients of a scalar function with respect to leaf tensors, one tensor per
/// leaf with the leaf's own index order.
pub type Gradients = BTreeMap<LeafId, Tensor>;

/// A forward pass through an [`Expression`], holding every node's value for a
/// later reverse pass.
#[derive(Clone, Debug)]
pub struct Evaluation<'a> {
    expr: &'a Expression,
    binding: &'a Binding,
    leaves: &'a Leaves,
    values: Vec<Tensor>,
    outputs: Vec<Tensor>,
}

/// Evaluate every node of `expr` once, in order.
///
/// Fails with [`NetworkError::ScalarDegenerateNode`] if a node refers to a
/// node that has not been computed yet or to a slot without a bound leaf, and
/// with [`NetworkError::MalformedNetwork`] if a bound leaf doesn't hold the
/// indices of its slot.
pub fn forward<'a>(
    expr: &'a Expression,
    binding: &'a Binding,
    leaves: &'a Leaves,
) -> NetworkResult<Evaluation<'a>>
{
    let mut values: Vec<Tensor> = Vec::with_capacity(expr.len());
    for (k, node) in expr.nodes.iter().enumerate() {
        let value = match &node.op {
            Op::Variable(slot) => {
                let leaf = binding.slot(*slot)?;
                let value = leaves.value_of(leaf)?;
                let sig = expr.slot_signatures.get(*slot)
                    .ok_or_else(|| ScalarDegenerateNode(
                        format!("slot {} has no signature", slot)))?;
                let expected = binding.resolve(sig)?;
                if value.rank() != expected.len()
                    || expected.iter().any(|idx| !value.has_index(idx))
                {
                    return Err(MalformedNetwork(format!(
                        "leaf {} does not match slot {}", leaf.id.0, slot)));
                }
                value
            },
            Op::Scalar(x) => Tensor::new_scalar(*x),
            Op::Contract(a, b) => {
                let (Some(va), Some(vb)) = (values.get(a.0), values.get(b.0))
                    else {
                        return Err(ScalarDegenerateNode(format!(
                            "node {} refers to unresolved node {} or {}",
                            k, a.0, b.0,
                        )));
                    };
                va.contract(vb)?
            },
        };
        values.push(value);
    }
    let outputs: Vec<Tensor> =
        expr.outputs.iter().zip(&expr.output_signatures)
        .map(|(out, sig)| {
            let value = values.get(out.0)
                .ok_or_else(|| ScalarDegenerateNode(
                    format!("output node {} does not exist", out.0)))?;
            value.permuted(&binding.resolve(sig)?).map_err(NetworkError::from)
        })
        .collect::<NetworkResult<_>>()?;
    Ok(Evaluation { expr, binding, leaves, values, outputs })
}

/// Evaluate all outputs of `expr`.
pub fn evaluate(expr: &Expression, binding: &Binding, leaves: &Leaves)
    -> NetworkResult<Vec<Tensor>>
{
    forward(expr, binding, leaves).map(|ev| ev.outputs)
}

fn accumulate(acc: &mut Option<Tensor>, grad: Tensor, order: &[Index])
    -> NetworkResult<()>
{
    let grad = grad.permuted(order)?;
    match acc {
        Some(a) => { a.add_assign_checked(&grad)?; },
        None => { *acc = Some(grad); },
    }
    Ok(())
}

impl<'a> Evaluation<'a> {
    /// Return the value of each output.
    pub fn outputs(&self) -> &[Tensor] { &self.outputs }

    /// Consume `self`, returning only the output values.
    pub fn into_outputs(self) -> Vec<Tensor> { self.outputs }

    /// Propagate adjoints of the outputs back to the leaves.
    ///
    /// `output_grads` holds one tensor per output with the output's indices
    /// (in any order). Every leaf bound to a slot receives exactly one
    /// gradient; leaves that no output depends on get zeros.
    pub fn backward(&self, output_grads: &[Tensor]) -> NetworkResult<Gradients> {
        if output_grads.len() != self.outputs.len() {
            return Err(MalformedNetwork(format!(
                "got {} output gradients for {} outputs",
                output_grads.len(), self.outputs.len(),
            )));
        }
        let mut adjoints: Vec<Option<Tensor>> = vec![None; self.values.len()];
        for (out, grad) in self.expr.outputs.iter().zip(output_grads) {
            let order = self.values[out.0].indices();
            accumulate(&mut adjoints[out.0], grad.clone(), order)?;
        }

        let nslots = self.binding.slots().len();
        let mut slot_adjoints: Vec<Option<Tensor>> = vec![None; nslots];
        for k in (0..self.values.len()).rev() {
            let Some(dc) = adjoints[k].take() else { continue; };
            match &self.expr.nodes[k].op {
                Op::Contract(a, b) => {
                    let (va, vb) = (&self.values[a.0], &self.values[b.0]);
                    let da = dc.contract(vb)?;
                    let db = dc.contract(va)?;
                    accumulate(&mut adjoints[a.0], da, va.indices())?;
                    accumulate(&mut adjoints[b.0], db, vb.indices())?;
                },
                Op::Variable(slot) => {
                    let order = self.values[k].indices();
                    accumulate(&mut slot_adjoints[*slot], dc, order)?;
                },
                Op::Scalar(_) => { },
            }
        }

        let mut grads = Gradients::new();
        for leaf in self.binding.slots().iter() {
            if !grads.contains_key(&leaf.id) {
                let zero = self.leaves.try_get(leaf.id)?.zeros_like();
                grads.insert(leaf.id, zero);
            }
        }
        for (leaf, adj) in self.binding.slots().iter().zip(slot_adjoints) {
            let Some(adj) = adj else { continue; };
            let adj = adj.replace_indices(&leaf.inverse_relabel())?;
            if let Some(g) = grads.get_mut(&leaf.id) {
                let adj = adj.permuted(g.indices())?;
                g.add_assign_checked(&adj)?;
            }
        }
        Ok(grads)
    }
}

/// Evaluate a scalar loss of the (scalar) outputs of `expr` and its gradient
/// with respect to every bound leaf.
///
/// `loss` maps the output values to the loss and its partial derivatives with
/// respect to each output.
///
/// Fails with [`NetworkError::ScalarDegenerateNode`] if an output is not a
/// scalar.
pub fn value_and_grad<F>(
    expr: &Expression,
    binding: &Binding,
    leaves: &Leaves,
    loss: F,
) -> NetworkResult<(f64, Gradients)>
where F: FnOnce(&[f64]) -> (f64, Vec<f64>)
{
    let ev = forward(expr, binding, leaves)?;
    let x: Vec<f64> =
        ev.outputs().iter().enumerate()
        .map(|(k, t)| {
            t.scalar().map_err(|_| ScalarDegenerateNode(
                format!("output {} has rank {}", k, t.rank())))
        })
        .collect::<NetworkResult<_>>()?;
    let (val, dx) = loss(&x);
    if dx.len() != x.len() {
        return Err(MalformedNetwork(format!(
            "loss returned {} partial derivatives for {} outputs",
            dx.len(), x.len(),
        )));
    }
    let output_grads: Vec<Tensor> =
        dx.into_iter().map(Tensor::new_scalar).collect();
    let grads = ev.backward(&output_grads)?;
    Ok((val, grads))
}

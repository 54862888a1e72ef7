//! Contraction of 2D tensor networks (PEPS) with bounded-rank approximation and
//! reverse-mode differentiation.
//!
//! Tensors are registered once in a [`Leaves`](network::Leaves) arena and
//! combined into un-contracted [`Network`](network::Network)s. A network can
//! then be
//! - contracted exactly or along a [binary tree](tree) with SVD compression of
//!   intermediate results ([`contract`]);
//! - turned, together with other networks sharing the same leaves, into a
//!   symbolic [contraction graph](graph) that is evaluated in one pass and
//!   differentiated with respect to every leaf;
//! - looked up by topology in a [cache](cache) of contraction graphs, so that
//!   repeated evaluations with new tensor values skip the order search.
//!
//! All settings are passed explicitly through a [`Context`](context::Context).
//! The [`peps`] and [`optim`] modules use these pieces to minimize the energy of
//! a PEPS for a given set of local terms.

pub mod index;
pub mod tensor;
#[macro_use]
pub mod network;
pub mod tree;
pub mod contract;
pub mod graph;
pub mod cache;
pub mod context;
pub mod optim;
pub mod peps;

pub use crate::{
    context::{ Context, ContractionConfig },
    contract::Strategy,
    index::Index,
    network::{ LeafId, LeafRef, Leaves, Network, NetworkError, NetworkResult },
    tensor::Tensor,
    tree::Split,
};

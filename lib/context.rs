//! Explicit configuration for contraction calls.
//!
//! A [`Context`] carries the contraction strategy, the truncation parameters
//! and an expression cache. It is created by the caller (typically at the start
//! of an optimization loop) and passed to every call that needs it; nothing is
//! kept in global state.

use std::sync::Arc;
use crate::{
    cache::{ NetworkCache, TopologySignature },
    contract::Strategy,
    graph::{ self, Binding, Expression, Gradients },
    network::{ Leaves, Network, NetworkResult },
    tensor::Tensor,
    tree::Split,
};

/// Contraction settings.
///
/// `cutoff` and `max_dim` only affect [`Strategy::Tree`]; the differentiable
/// graph always contracts exactly.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ContractionConfig {
    pub strategy: Strategy,
    pub cutoff: f64,
    pub max_dim: usize,
}

impl Default for ContractionConfig {
    fn default() -> Self {
        Self { strategy: Strategy::Exact, cutoff: 0.0, max_dim: usize::MAX }
    }
}

impl ContractionConfig {
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Shorthand for `with_strategy(Strategy::Tree { split })`.
    pub fn with_tree(self, split: Split) -> Self {
        self.with_strategy(Strategy::Tree { split })
    }

    pub fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }

    pub fn with_max_dim(mut self, max_dim: usize) -> Self {
        self.max_dim = max_dim;
        self
    }
}

/// Configuration plus an expression cache owned by the caller.
#[derive(Debug, Default)]
pub struct Context {
    pub config: ContractionConfig,
    pub cache: NetworkCache,
}

impl Context {
    /// Create a new context with an empty cache.
    pub fn new(config: ContractionConfig) -> Self {
        Self { config, cache: NetworkCache::new() }
    }

    /// Contract a single network with the configured strategy.
    pub fn contract(&self, network: &Network, leaves: &Leaves)
        -> NetworkResult<Tensor>
    {
        self.config.strategy
            .contractor(self.config.cutoff, self.config.max_dim)
            .contract(network, leaves)
    }

    /// Return the (possibly cached) expression for a batch along with the
    /// binding of its slots to the batch's current leaf occurrences.
    pub fn expression(&self, networks: &[Network], leaves: &Leaves)
        -> NetworkResult<(Arc<Expression>, Binding)>
    {
        let binding = Binding::of(networks, leaves)?;
        let sig = TopologySignature::with_binding(networks, leaves, &binding)?;
        let expr = self.cache.get_or_build(&sig, || {
            graph::generate_expression(networks, leaves).map(|(expr, _)| expr)
        })?;
        Ok((expr, binding))
    }

    /// Evaluate every network of a batch through the differentiable graph.
    pub fn evaluate(&self, networks: &[Network], leaves: &Leaves)
        -> NetworkResult<Vec<Tensor>>
    {
        let (expr, binding) = self.expression(networks, leaves)?;
        graph::evaluate(&expr, &binding, leaves)
    }

    /// Evaluate a loss of the scalar outputs of a batch and its gradient with
    /// respect to every leaf in the batch.
    ///
    /// See [`graph::value_and_grad`].
    pub fn value_and_grad<F>(
        &self,
        networks: &[Network],
        leaves: &Leaves,
        loss: F,
    ) -> NetworkResult<(f64, Gradients)>
    where F: FnOnce(&[f64]) -> (f64, Vec<f64>)
    {
        let (expr, binding) = self.expression(networks, leaves)?;
        graph::value_and_grad(&expr, &binding, leaves, loss)
    }
}

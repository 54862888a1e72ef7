//! First-order minimization over collections of leaf tensors.
//!
//! The contraction engine exposes its loss through [`Objective`], a
//! `(value, gradient) = loss_and_grad(parameters)` callback, and its parameter
//! type [`Params`] supports the vector-space operations an optimizer needs:
//! addition, scaling and an inner product.
//!
//! Three reference optimizers are provided: plain [`GradientDescent`],
//! Polak-Ribière [`ConjugateGradient`], and [`Lbfgs`]. All of them use a
//! backtracking [`LineSearch`] with the Armijo condition and never accept a
//! step that increases the loss.

use std::ops::{ Add, Mul, Neg, Sub };
use itertools::Itertools;
use log::{ info, warn };
use thiserror::Error;
use crate::{
    graph::Gradients,
    network::{ LeafId, Leaves, NetworkError },
    tensor::Tensor,
};

#[derive(Debug, Error)]
pub enum OptimError {
    /// Returned when evaluating the objective fails.
    #[error("objective error: {0}")]
    Network(#[from] NetworkError),

    /// Returned when the objective produces a NaN or infinite loss.
    #[error("non-finite loss {0}")]
    NonFiniteLoss(f64),

    /// Returned when a gradient doesn't cover the same leaves as the
    /// parameters.
    #[error("gradient does not match parameters")]
    GradientMismatch,
}
use OptimError::*;
pub type OptimResult<T> = Result<T, OptimError>;

/// Real inner product.
pub trait InnerProduct {
    fn dot(&self, other: &Self) -> f64;

    fn norm(&self) -> f64 { self.dot(self).sqrt() }
}

/// An ordered set of leaf tensors, treated as one vector.
///
/// `Params` implement addition, subtraction, negation and multiplication by
/// `f64` through the usual operators on references; binary operations require
/// both operands to hold the same leaves with the same indices and panic
/// otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct Params {
    entries: Vec<(LeafId, Tensor)>,
}

impl Params {
    /// Collect the current values of the given leaves.
    ///
    /// Handles are deduplicated and sorted. Fails if a handle is missing.
    pub fn from_leaves<I>(leaves: &Leaves, ids: I) -> OptimResult<Self>
    where I: IntoIterator<Item = LeafId>
    {
        let entries: Vec<(LeafId, Tensor)> =
            ids.into_iter()
            .sorted()
            .dedup()
            .map(|id| -> OptimResult<(LeafId, Tensor)> {
                Ok((id, leaves.try_get(id)?.clone()))
            })
            .collect::<OptimResult<_>>()?;
        Ok(Self { entries })
    }

    /// Select the gradients of the leaves in `self` from a full set of
    /// gradients.
    ///
    /// Fails if a leaf of `self` has no gradient.
    pub fn select(&self, grads: &Gradients) -> OptimResult<Self> {
        let entries: Vec<(LeafId, Tensor)> =
            self.entries.iter()
            .map(|(id, t)| -> OptimResult<(LeafId, Tensor)> {
                let g = grads.get(id).ok_or(GradientMismatch)?;
                let g = g.permuted(t.indices()).map_err(|_| GradientMismatch)?;
                Ok((*id, g))
            })
            .collect::<OptimResult<_>>()?;
        Ok(Self { entries })
    }

    /// Write the values of `self` back into the leaf arena.
    pub fn write_into(&self, leaves: &mut Leaves) -> OptimResult<()> {
        self.entries.iter()
            .try_for_each(|(id, t)| leaves.set(*id, t.clone()))
            .map_err(OptimError::from)
    }

    /// Return the number of leaves.
    pub fn len(&self) -> usize { self.entries.len() }

    /// Return `true` if there are no leaves.
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Return the tensor of a leaf, if present.
    pub fn get(&self, id: LeafId) -> Option<&Tensor> {
        self.entries.iter().find(|(k, _)| *k == id).map(|(_, t)| t)
    }

    /// Return an iterator over all leaves and tensors in handle order.
    pub fn iter(&self) -> impl Iterator<Item = (LeafId, &Tensor)> + '_ {
        self.entries.iter().map(|(id, t)| (*id, t))
    }

    /// Return the leaf handles in order.
    pub fn ids(&self) -> Vec<LeafId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    fn zip_with<F>(&self, other: &Self, f: F) -> Self
    where F: Fn(&Tensor, &Tensor) -> Tensor
    {
        if self.ids() != other.ids() {
            panic!("{}", GradientMismatch);
        }
        let entries =
            self.entries.iter().zip(&other.entries)
            .map(|((id, l), (_, r))| (*id, f(l, r)))
            .collect();
        Self { entries }
    }

    fn map<F>(&self, f: F) -> Self
    where F: Fn(&Tensor) -> Tensor
    {
        let entries = self.entries.iter().map(|(id, t)| (*id, f(t))).collect();
        Self { entries }
    }
}

impl InnerProduct for Params {
    fn dot(&self, other: &Self) -> f64 {
        if self.ids() != other.ids() {
            panic!("{}", GradientMismatch);
        }
        self.entries.iter().zip(&other.entries)
            .map(|((_, l), (_, r))| {
                match l.dot(r) {
                    Ok(x) => x,
                    Err(err) => panic!("{}", err),
                }
            })
            .sum()
    }
}

impl Add<&Params> for &Params {
    type Output = Params;

    fn add(self, other: &Params) -> Params { self.zip_with(other, |l, r| l + r) }
}

impl Sub<&Params> for &Params {
    type Output = Params;

    fn sub(self, other: &Params) -> Params { self.zip_with(other, |l, r| l - r) }
}

impl Mul<f64> for &Params {
    type Output = Params;

    fn mul(self, a: f64) -> Params { self.map(|t| t * a) }
}

impl Neg for &Params {
    type Output = Params;

    fn neg(self) -> Params { self.map(|t| -t) }
}

/// A differentiable scalar function of [`Params`].
pub trait Objective {
    /// Return the loss at `params` and its gradient, holding the same leaves
    /// as `params`.
    fn loss_and_grad(&mut self, params: &Params) -> OptimResult<(f64, Params)>;
}

fn checked<O>(obj: &mut O, params: &Params) -> OptimResult<(f64, Params)>
where O: Objective + ?Sized
{
    let (f, g) = obj.loss_and_grad(params)?;
    if !f.is_finite() { return Err(NonFiniteLoss(f)); }
    if g.ids() != params.ids() { return Err(GradientMismatch); }
    Ok((f, g))
}

/// Backtracking line search with the Armijo sufficient-decrease condition.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LineSearch {
    /// First step length tried.
    pub initial_step: f64,
    /// Factor applied to the step length after each rejection.
    pub shrink: f64,
    /// Armijo constant `c` in `f(x + t d) <= f(x) + c t (g · d)`.
    pub armijo: f64,
    /// Maximum number of trial steps.
    pub max_steps: usize,
}

impl Default for LineSearch {
    fn default() -> Self {
        Self { initial_step: 1.0, shrink: 0.5, armijo: 1e-4, max_steps: 30 }
    }
}

// an accepted point
struct Point {
    x: Params,
    f: f64,
    g: Params,
}

impl LineSearch {
    /// Search along `dir` from `x` with loss `f` and gradient `g`.
    ///
    /// Returns `None` if `dir` is not a descent direction or no trial step
    /// satisfied the Armijo condition.
    fn search<O>(
        &self,
        obj: &mut O,
        x: &Params,
        f: f64,
        g: &Params,
        dir: &Params,
        t0: f64,
    ) -> OptimResult<Option<(Point, f64)>>
    where O: Objective + ?Sized
    {
        let slope = g.dot(dir);
        if !(slope < 0.0) { return Ok(None); }
        let mut t = t0;
        for _ in 0..self.max_steps {
            let x_new = x + &(dir * t);
            match obj.loss_and_grad(&x_new) {
                Ok((f_new, g_new))
                    if f_new.is_finite()
                    && f_new <= f + self.armijo * t * slope =>
                {
                    if g_new.ids() != x.ids() { return Err(GradientMismatch); }
                    return Ok(Some((Point { x: x_new, f: f_new, g: g_new }, t)));
                },
                Ok(_) => { },
                Err(err) => { return Err(err); },
            }
            t *= self.shrink;
        }
        Ok(None)
    }
}

/// Output of a minimization.
#[derive(Clone, Debug)]
pub struct OptimizeResult {
    /// Final parameters.
    pub params: Params,
    /// Loss at the initial point followed by the loss after each accepted
    /// step.
    pub losses: Vec<f64>,
}

impl OptimizeResult {
    /// Return the final loss.
    pub fn loss(&self) -> f64 { self.losses.last().copied().unwrap_or(f64::NAN) }
}

/// A first-order minimizer.
pub trait Optimizer {
    fn minimize<O>(&self, obj: &mut O, init: Params) -> OptimResult<OptimizeResult>
    where O: Objective + ?Sized;
}

/// Steepest descent.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GradientDescent {
    pub line_search: LineSearch,
    pub max_iters: usize,
    /// Stop when the gradient norm falls below this.
    pub grad_tol: f64,
}

impl Default for GradientDescent {
    fn default() -> Self {
        Self {
            line_search: LineSearch::default(),
            max_iters: 100,
            grad_tol: 1e-8,
        }
    }
}

impl Optimizer for GradientDescent {
    fn minimize<O>(&self, obj: &mut O, init: Params) -> OptimResult<OptimizeResult>
    where O: Objective + ?Sized
    {
        let (f, g) = checked(obj, &init)?;
        let mut cur = Point { x: init, f, g };
        let mut losses = vec![cur.f];
        let mut step = self.line_search.initial_step;
        for iter in 0..self.max_iters {
            if cur.g.norm() < self.grad_tol { break; }
            let dir = -&cur.g;
            let res = self.line_search.search(
                obj, &cur.x, cur.f, &cur.g, &dir, step)?;
            let Some((next, t)) = res else {
                warn!("gradient descent: line search failed at iteration {}", iter);
                break;
            };
            // next search starts a little beyond the last accepted step
            step = (2.0 * t).min(self.line_search.initial_step);
            cur = next;
            losses.push(cur.f);
            info!("gradient descent: iteration {}, loss = {:.10}", iter, cur.f);
        }
        Ok(OptimizeResult { params: cur.x, losses })
    }
}

/// Nonlinear conjugate gradient with the Polak-Ribière+ update, restarting
/// from the steepest-descent direction whenever the conjugate direction fails.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ConjugateGradient {
    pub line_search: LineSearch,
    pub max_iters: usize,
    pub grad_tol: f64,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self {
            line_search: LineSearch::default(),
            max_iters: 100,
            grad_tol: 1e-8,
        }
    }
}

impl Optimizer for ConjugateGradient {
    fn minimize<O>(&self, obj: &mut O, init: Params) -> OptimResult<OptimizeResult>
    where O: Objective + ?Sized
    {
        let (f, g) = checked(obj, &init)?;
        let mut cur = Point { x: init, f, g };
        let mut losses = vec![cur.f];
        let mut dir = -&cur.g;
        let mut restarted = true;
        let mut iter = 0;
        while iter < self.max_iters {
            if cur.g.norm() < self.grad_tol { break; }
            let res = self.line_search.search(
                obj, &cur.x, cur.f, &cur.g, &dir, self.line_search.initial_step)?;
            let Some((next, _)) = res else {
                if restarted {
                    warn!("conjugate gradient: line search failed at iteration {}", iter);
                    break;
                }
                dir = -&cur.g;
                restarted = true;
                continue;
            };
            let gg = cur.g.dot(&cur.g);
            let beta = (next.g.dot(&(&next.g - &cur.g)) / gg).max(0.0);
            dir = &(-&next.g) + &(&dir * beta);
            restarted = beta == 0.0;
            if next.g.dot(&dir) >= 0.0 {
                dir = -&next.g;
                restarted = true;
            }
            cur = next;
            losses.push(cur.f);
            info!("conjugate gradient: iteration {}, loss = {:.10}", iter, cur.f);
            iter += 1;
        }
        Ok(OptimizeResult { params: cur.x, losses })
    }
}

/// Limited-memory BFGS with the two-loop recursion.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Lbfgs {
    pub line_search: LineSearch,
    pub max_iters: usize,
    pub grad_tol: f64,
    /// Number of correction pairs kept.
    pub history: usize,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Self {
            line_search: LineSearch::default(),
            max_iters: 100,
            grad_tol: 1e-8,
            history: 8,
        }
    }
}

impl Lbfgs {
    fn direction(g: &Params, pairs: &[(Params, Params, f64)]) -> Params {
        let mut q = g.clone();
        let mut alpha: Vec<f64> = Vec::with_capacity(pairs.len());
        for (s, y, rho) in pairs.iter().rev() {
            let a = rho * s.dot(&q);
            q = &q - &(y * a);
            alpha.push(a);
        }
        if let Some((s, y, _)) = pairs.last() {
            q = &q * (s.dot(y) / y.dot(y));
        }
        for ((s, y, rho), a) in pairs.iter().zip(alpha.into_iter().rev()) {
            let b = rho * y.dot(&q);
            q = &q + &(s * (a - b));
        }
        -&q
    }
}

impl Optimizer for Lbfgs {
    fn minimize<O>(&self, obj: &mut O, init: Params) -> OptimResult<OptimizeResult>
    where O: Objective + ?Sized
    {
        let (f, g) = checked(obj, &init)?;
        let mut cur = Point { x: init, f, g };
        let mut losses = vec![cur.f];
        let mut pairs: Vec<(Params, Params, f64)> = Vec::new();
        let mut iter = 0;
        while iter < self.max_iters {
            if cur.g.norm() < self.grad_tol { break; }
            let dir = Self::direction(&cur.g, &pairs);
            let res = self.line_search.search(
                obj, &cur.x, cur.f, &cur.g, &dir, self.line_search.initial_step)?;
            let Some((next, _)) = res else {
                if pairs.is_empty() {
                    warn!("L-BFGS: line search failed at iteration {}", iter);
                    break;
                }
                pairs.clear();
                continue;
            };
            let s = &next.x - &cur.x;
            let y = &next.g - &cur.g;
            let sy = s.dot(&y);
            if sy > 1e-12 {
                if pairs.len() == self.history { pairs.remove(0); }
                pairs.push((s, y, 1.0 / sy));
            }
            cur = next;
            losses.push(cur.f);
            info!("L-BFGS: iteration {}, loss = {:.10}", iter, cur.f);
            iter += 1;
        }
        Ok(OptimizeResult { params: cur.x, losses })
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;
    use crate::index::Index;
    use super::*;

    // f(x) = Σ_k w_k (x_k - 1)² over a single leaf
    struct Quadratic {
        weights: Vec<f64>,
        calls: usize,
    }

    impl Objective for Quadratic {
        fn loss_and_grad(&mut self, params: &Params)
            -> OptimResult<(f64, Params)>
        {
            self.calls += 1;
            let (id, t) = params.iter().next().ok_or(GradientMismatch)?;
            let x = t.elems();
            let f: f64 =
                x.iter().zip(&self.weights)
                .map(|(xk, w)| w * (xk - 1.0).powi(2))
                .sum();
            let g: Vec<f64> =
                x.iter().zip(&self.weights)
                .map(|(xk, w)| 2.0 * w * (xk - 1.0))
                .collect();
            let g = Tensor::from_elems(t.indices().to_vec(), g)
                .map_err(NetworkError::from)?;
            let grads: Gradients = [(id, g)].into_iter().collect();
            Ok((f, params.select(&grads)?))
        }
    }

    fn setup() -> (Quadratic, Params) {
        let i = Index::new(4);
        let mut leaves = Leaves::new();
        let id = leaves.insert(
            Tensor::from_elems([i], vec![3.0, -2.0, 0.5, 4.0]).unwrap());
        let obj = Quadratic { weights: vec![1.0, 10.0, 0.5, 3.0], calls: 0 };
        (obj, Params::from_leaves(&leaves, [id]).unwrap())
    }

    fn assert_non_increasing(losses: &[f64]) {
        assert!(losses.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn params_algebra() {
        let (_, p) = setup();
        let q = &p * 2.0;
        assert_approx_eq!(f64, p.dot(&q), 2.0 * p.dot(&p));
        let z = &(&q - &p) - &p;
        assert_approx_eq!(f64, z.norm(), 0.0);
        let n = &p + &(-&p);
        assert_approx_eq!(f64, n.norm(), 0.0);
        assert_eq!(p.len(), 1);
    }

    #[test]
    #[should_panic]
    fn params_mismatch_panics() {
        let (_, p) = setup();
        let (_, other) = setup();
        let _ = &p + &other;
    }

    fn check_run(name: &str, res: &OptimizeResult, obj: &Quadratic) {
        assert_non_increasing(&res.losses);
        assert!(res.loss() < 1e-8, "{} ended at {}", name, res.loss());
        assert!(obj.calls > 1);
    }

    #[test]
    fn optimizers_reach_minimum() {
        let (mut obj, p) = setup();
        let gd = GradientDescent {
            line_search: LineSearch { initial_step: 0.04, ..Default::default() },
            max_iters: 1000,
            ..Default::default()
        };
        let res = gd.minimize(&mut obj, p).unwrap();
        check_run("gradient descent", &res, &obj);

        let (mut obj, p) = setup();
        let cg = ConjugateGradient { max_iters: 1000, ..Default::default() };
        let res = cg.minimize(&mut obj, p).unwrap();
        check_run("conjugate gradient", &res, &obj);

        let (mut obj, p) = setup();
        let res = Lbfgs::default().minimize(&mut obj, p).unwrap();
        check_run("L-BFGS", &res, &obj);
        let x = res.params.iter().next().unwrap().1.elems();
        x.iter().for_each(|xk| assert_approx_eq!(f64, *xk, 1.0, epsilon = 1e-4));
    }

    #[test]
    fn non_finite_loss_is_an_error() {
        struct Bad;
        impl Objective for Bad {
            fn loss_and_grad(&mut self, params: &Params)
                -> OptimResult<(f64, Params)>
            {
                Ok((f64::NAN, params.clone()))
            }
        }
        let (_, p) = setup();
        assert!(matches!(
            GradientDescent::default().minimize(&mut Bad, p),
            Err(NonFiniteLoss(_)),
        ));
    }
}

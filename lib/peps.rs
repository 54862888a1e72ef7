//! Projected entangled pair states on open rectangular lattices.
//!
//! A [`Peps`] registers one tensor per lattice site, each holding a physical
//! index and one link index per nearest neighbor. The norm ⟨ψ|ψ⟩ and the
//! expectation values ⟨ψ|h|ψ⟩ of local terms are built as [`Network`]s in which
//! the bra is the same set of leaves seen through primed link indices, so that
//! gradients with respect to each site tensor collect both the bra and the ket
//! contributions.
//!
//! Local terms are supplied from outside (see [`Peps::add_term`]); the lattice
//! coordinates of a term only decide which site tensors it connects to.

use rand::Rng;
use crate::{
    context::Context,
    index::Index,
    network::{ LeafId, LeafRef, Leaves, Network, NetworkError, NetworkResult },
    optim::{ Objective, OptimResult, Params },
    tensor::Tensor,
};
use NetworkError::*;

/// A local operator acting on a few lattice sites.
///
/// The operator is a registered leaf holding the primed physical indices of
/// its sites (the output side, matched by the bra) followed by the unprimed
/// ones (the input side, matched by the ket).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalTerm {
    pub sites: Vec<(usize, usize)>,
    pub op: LeafId,
}

/// A lattice cut between rows `row` and `row + 1`, handed to a
/// [`ProjectorOracle`].
///
/// For each column, `upper` holds the ket and bra vertical links as seen by
/// row `row`, and `lower` holds the fresh indices that row `row + 1` is
/// reconnected to.
#[derive(Clone, Debug)]
pub struct RowCut {
    pub row: usize,
    pub upper: Vec<Index>,
    pub lower: Vec<Index>,
}

/// Provider of projector tensors inserted across a [`RowCut`] of the norm
/// network, e.g. from a boundary-MPS approximation of the rows above it.
///
/// The returned leaves must together hold exactly the indices of
/// `cut.upper` and `cut.lower` as free indices.
pub trait ProjectorOracle {
    fn projectors(&self, peps: &Peps, leaves: &mut Leaves, cut: &RowCut)
        -> NetworkResult<Vec<LeafRef>>;
}

/// Exact projectors: one identity tensor per upper/lower index pair.
#[derive(Copy, Clone, Debug, Default)]
pub struct IdentityProjectors;

impl ProjectorOracle for IdentityProjectors {
    fn projectors(&self, _peps: &Peps, leaves: &mut Leaves, cut: &RowCut)
        -> NetworkResult<Vec<LeafRef>>
    {
        cut.upper.iter().zip(&cut.lower)
            .map(|(u, l)| -> NetworkResult<LeafRef> {
                let delta = Tensor::new(
                    [u.clone(), l.clone()],
                    |ix| if ix[0] == ix[1] { 1.0 } else { 0.0 },
                )?;
                Ok(LeafRef::new(leaves.insert(delta)))
            })
            .collect()
    }
}

/// A PEPS on an `nrow × ncol` open lattice.
#[derive(Clone, Debug)]
pub struct Peps {
    nrow: usize,
    ncol: usize,
    sites: Vec<LeafId>,
    phys: Vec<Index>,
    // hlinks[r * (ncol - 1) + c] joins (r, c) and (r, c + 1)
    hlinks: Vec<Index>,
    // vlinks[r * ncol + c] joins (r, c) and (r + 1, c)
    vlinks: Vec<Index>,
}

impl Peps {
    /// Register a PEPS with elements drawn uniformly from `[-1, 1)`.
    ///
    /// Fails if any of the dimensions is zero.
    pub fn random<R>(
        leaves: &mut Leaves,
        nrow: usize,
        ncol: usize,
        phys_dim: usize,
        bond_dim: usize,
        rng: &mut R,
    ) -> NetworkResult<Self>
    where R: Rng + ?Sized
    {
        if nrow == 0 || ncol == 0 || phys_dim == 0 || bond_dim == 0 {
            return Err(MalformedNetwork(
                "PEPS dimensions must be non-zero".into()));
        }
        let phys: Vec<Index> =
            (0..nrow * ncol)
            .map(|k| Index::with_tags(
                phys_dim, &format!("Site,r={},c={}", k / ncol, k % ncol)))
            .collect();
        let hlinks: Vec<Index> =
            (0..nrow * (ncol - 1))
            .map(|_| Index::with_tags(bond_dim, "Link,h"))
            .collect();
        let vlinks: Vec<Index> =
            (0..(nrow - 1) * ncol)
            .map(|_| Index::with_tags(bond_dim, "Link,v"))
            .collect();
        let mut peps = Self {
            nrow,
            ncol,
            sites: Vec::with_capacity(nrow * ncol),
            phys,
            hlinks,
            vlinks,
        };
        for r in 0..nrow {
            for c in 0..ncol {
                let indices: Vec<Index> =
                    [peps.phys(r, c).clone()].into_iter()
                    .chain(peps.links(r, c))
                    .collect();
                let t = Tensor::random(indices, rng)?;
                peps.sites.push(leaves.insert(t));
            }
        }
        Ok(peps)
    }

    /// Return the number of rows.
    pub fn nrow(&self) -> usize { self.nrow }

    /// Return the number of columns.
    pub fn ncol(&self) -> usize { self.ncol }

    /// Return the handle of the tensor at `(r, c)`.
    ///
    /// *Panics* if `(r, c)` is out of bounds.
    pub fn site(&self, r: usize, c: usize) -> LeafId {
        self.sites[r * self.ncol + c]
    }

    /// Return all site handles in row-major order.
    pub fn sites(&self) -> &[LeafId] { &self.sites }

    /// Return the physical index at `(r, c)`.
    ///
    /// *Panics* if `(r, c)` is out of bounds.
    pub fn phys(&self, r: usize, c: usize) -> &Index {
        &self.phys[r * self.ncol + c]
    }

    fn up(&self, r: usize, c: usize) -> Option<&Index> {
        (r > 0).then(|| &self.vlinks[(r - 1) * self.ncol + c])
    }

    fn down(&self, r: usize, c: usize) -> Option<&Index> {
        (r + 1 < self.nrow).then(|| &self.vlinks[r * self.ncol + c])
    }

    fn left(&self, r: usize, c: usize) -> Option<&Index> {
        (c > 0).then(|| &self.hlinks[r * (self.ncol - 1) + c - 1])
    }

    fn right(&self, r: usize, c: usize) -> Option<&Index> {
        (c + 1 < self.ncol).then(|| &self.hlinks[r * (self.ncol - 1) + c])
    }

    /// Return the link indices of the tensor at `(r, c)` (left, right, up,
    /// down, skipping those on the lattice boundary).
    pub fn links(&self, r: usize, c: usize) -> Vec<Index> {
        [self.left(r, c), self.right(r, c), self.up(r, c), self.down(r, c)]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    fn check_site(&self, r: usize, c: usize) -> NetworkResult<()> {
        if r < self.nrow && c < self.ncol {
            Ok(())
        } else {
            Err(MalformedNetwork(format!(
                "site ({}, {}) is outside the {}x{} lattice",
                r, c, self.nrow, self.ncol,
            )))
        }
    }

    /// Register a local term from the row-major elements of its matrix, with
    /// rows indexing the output (bra) side.
    ///
    /// Fails if a site is out of bounds or repeated, or if the number of
    /// elements doesn't match.
    pub fn add_term(
        &self,
        leaves: &mut Leaves,
        sites: &[(usize, usize)],
        elems: Vec<f64>,
    ) -> NetworkResult<LocalTerm>
    {
        sites.iter().try_for_each(|&(r, c)| self.check_site(r, c))?;
        let out: Vec<Index> =
            sites.iter().map(|&(r, c)| self.phys(r, c).prime()).collect();
        let inp: Vec<Index> =
            sites.iter().map(|&(r, c)| self.phys(r, c).clone()).collect();
        let op = Tensor::from_elems(out.into_iter().chain(inp), elems)
            .map_err(|err| MalformedNetwork(format!("bad local term: {}", err)))?;
        Ok(LocalTerm { sites: sites.to_vec(), op: leaves.insert(op) })
    }

    fn ket(&self, r: usize, c: usize) -> LeafRef {
        LeafRef::new(self.site(r, c))
    }

    // bra copy: all links primed, physical index primed if `primed_phys`;
    // `lowered` replaces the up link of row r (ket side) when a cut sits
    // above it. The physical index always gets an entry, so the bra stays a
    // different occurrence from the ket even on a lattice without links.
    fn bra(&self, r: usize, c: usize, primed_phys: bool, lowered: Option<&Index>)
        -> LeafRef
    {
        let mut relabel: Vec<(Index, Index)> =
            self.links(r, c).into_iter()
            .map(|l| {
                let new = match (self.up(r, c), lowered) {
                    (Some(up), Some(low)) if *up == l => low.prime(),
                    _ => l.prime(),
                };
                (l, new)
            })
            .collect();
        let s = self.phys(r, c).clone();
        let s_bra = if primed_phys { s.prime() } else { s.clone() };
        relabel.push((s, s_bra));
        LeafRef::relabeled(self.site(r, c), relabel)
    }

    fn ket_lowered(&self, r: usize, c: usize, lowered: Option<&Index>) -> LeafRef {
        match (self.up(r, c), lowered) {
            (Some(up), Some(low)) =>
                LeafRef::relabeled(self.site(r, c), vec![(up.clone(), low.clone())]),
            _ => self.ket(r, c),
        }
    }

    /// Return the ket network with open physical indices.
    pub fn grid_network(&self) -> Network {
        Network::group(
            (0..self.nrow).map(|r| {
                Network::group((0..self.ncol).map(|c| self.ket(r, c).into()))
            })
        )
    }

    // one group of ket and bra tensors per row
    fn sandwich_rows(&self, primed: &[(usize, usize)]) -> Vec<Network> {
        (0..self.nrow)
            .map(|r| {
                Network::group((0..self.ncol).flat_map(|c| {
                    let bra = self.bra(r, c, primed.contains(&(r, c)), None);
                    [Network::from(self.ket(r, c)), Network::from(bra)]
                }))
            })
            .collect()
    }

    /// Return the network of ⟨ψ|ψ⟩, one group per lattice row.
    pub fn norm_network(&self) -> Network {
        Network::Group(self.sandwich_rows(&[]))
    }

    /// Return the network of ⟨ψ|h|ψ⟩ for a local term `h`.
    pub fn term_network(&self, term: &LocalTerm) -> NetworkResult<Network> {
        term.sites.iter().try_for_each(|&(r, c)| self.check_site(r, c))?;
        let mut rows = self.sandwich_rows(&term.sites);
        rows.push(Network::from(term.op));
        Ok(Network::Group(rows))
    }

    /// Return the network of ⟨ψ|ψ⟩ with projectors from `oracle` inserted
    /// across every cut between neighboring rows.
    ///
    /// Each row group holds the row's ket and bra tensors followed by the
    /// projectors of the cut below it.
    pub fn norm_network_with<O>(&self, oracle: &O, leaves: &mut Leaves)
        -> NetworkResult<Network>
    where O: ProjectorOracle + ?Sized
    {
        let mut rows: Vec<Network> = Vec::with_capacity(self.nrow);
        // fresh ket-side indices of the cut above the current row
        let mut lowered: Vec<Index> = Vec::new();
        for r in 0..self.nrow {
            let mut row: Vec<Network> = Vec::new();
            for c in 0..self.ncol {
                let low = lowered.get(c);
                row.push(self.ket_lowered(r, c, low).into());
                row.push(self.bra(r, c, false, low).into());
            }
            if r + 1 < self.nrow {
                let down: Vec<Index> =
                    (0..self.ncol)
                    .filter_map(|c| self.down(r, c).cloned())
                    .collect();
                let fresh: Vec<Index> = down.iter().map(Index::sim).collect();
                let cut = RowCut {
                    row: r,
                    upper: down.iter()
                        .flat_map(|v| [v.clone(), v.prime()])
                        .collect(),
                    lower: fresh.iter()
                        .flat_map(|w| [w.clone(), w.prime()])
                        .collect(),
                };
                let projectors = oracle.projectors(self, leaves, &cut)?;
                row.extend(projectors.into_iter().map(Network::from));
                lowered = fresh;
            }
            rows.push(Network::Group(row));
        }
        let net = Network::Group(rows);
        net.validate(leaves)?;
        Ok(net)
    }

    /// Return the current site tensors as optimization parameters.
    pub fn params(&self, leaves: &Leaves) -> OptimResult<Params> {
        Params::from_leaves(leaves, self.sites.iter().copied())
    }
}

/// The energy `Σ_t ⟨ψ|h_t|ψ⟩ / ⟨ψ|ψ⟩` of a PEPS as an optimization objective
/// over its site tensors.
///
/// All expectation values and the norm are evaluated as a single batch, so the
/// contraction graph is generated once and then reused from the context's
/// cache.
#[derive(Debug)]
pub struct RayleighQuotient {
    pub leaves: Leaves,
    pub context: Context,
    networks: Vec<Network>,
}

impl RayleighQuotient {
    /// Fails if any term is malformed.
    pub fn new(
        peps: &Peps,
        terms: &[LocalTerm],
        leaves: Leaves,
        context: Context,
    ) -> NetworkResult<Self>
    {
        let networks: Vec<Network> =
            [Ok(peps.norm_network())].into_iter()
            .chain(terms.iter().map(|t| peps.term_network(t)))
            .collect::<NetworkResult<_>>()?;
        Ok(Self { leaves, context, networks })
    }

    /// Return the norm network followed by one network per term.
    pub fn networks(&self) -> &[Network] { &self.networks }

    /// Evaluate the energy at the current leaf values.
    pub fn energy(&self) -> NetworkResult<f64> {
        let vals: Vec<f64> =
            self.context.evaluate(&self.networks, &self.leaves)?
            .iter()
            .map(|t| t.scalar())
            .collect::<Result<_, _>>()?;
        Ok(vals[1..].iter().sum::<f64>() / vals[0])
    }
}

// loss Σ_t x_t / x_0 and its partials
fn rayleigh(x: &[f64]) -> (f64, Vec<f64>) {
    let norm = x[0];
    let num: f64 = x[1..].iter().sum();
    let e = num / norm;
    let mut grad = vec![1.0 / norm; x.len()];
    grad[0] = -e / norm;
    (e, grad)
}

impl Objective for RayleighQuotient {
    fn loss_and_grad(&mut self, params: &Params) -> OptimResult<(f64, Params)> {
        params.write_into(&mut self.leaves)?;
        let (e, grads) =
            self.context.value_and_grad(&self.networks, &self.leaves, rayleigh)?;
        Ok((e, params.select(&grads)?))
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{
        context::ContractionConfig,
        optim::InnerProduct,
        tree::Split,
    };
    use super::*;

    // Z_1 Z_2 on two neighboring sites, then X on a single site
    const ZZ: [f64; 16] = [
        1.0,  0.0,  0.0, 0.0,
        0.0, -1.0,  0.0, 0.0,
        0.0,  0.0, -1.0, 0.0,
        0.0,  0.0,  0.0, 1.0,
    ];
    const X: [f64; 4] = [0.0, 1.0, 1.0, 0.0];

    fn setup(nrow: usize, ncol: usize, seed: u64) -> (Peps, Leaves) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut leaves = Leaves::new();
        let peps = Peps::random(&mut leaves, nrow, ncol, 2, 2, &mut rng).unwrap();
        (peps, leaves)
    }

    #[test]
    fn norm_is_positive_and_strategies_agree() {
        let (peps, leaves) = setup(2, 3, 70);
        let net = peps.norm_network();
        net.validate(&leaves).unwrap();
        assert!(net.free_indices(&leaves).unwrap().is_empty());
        let exact = Context::default();
        let tree = Context::new(ContractionConfig::default().with_tree(Split::Interleaved));
        let n_exact = exact.contract(&net, &leaves).unwrap().scalar().unwrap();
        let n_tree = tree.contract(&net, &leaves).unwrap().scalar().unwrap();
        assert!(n_exact > 0.0);
        assert_approx_eq!(f64, n_tree / n_exact, 1.0, epsilon = 1e-10);

        // ⟨ψ|ψ⟩ is the squared norm of the ket tensor
        let psi = peps.grid_network().contract_exact(&leaves).unwrap();
        assert_approx_eq!(f64, n_exact / psi.dot(&psi).unwrap(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn single_site_norm_is_valid() {
        let (peps, leaves) = setup(1, 1, 76);
        let net = peps.norm_network();
        net.validate(&leaves).unwrap();
        let n = net.contract_exact(&leaves).unwrap().scalar().unwrap();
        let t = leaves.get(peps.site(0, 0)).unwrap();
        assert_approx_eq!(f64, n, t.dot(t).unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn term_expectation_matches_dense_state() {
        let (peps, mut leaves) = setup(2, 2, 71);
        let term = peps.add_term(&mut leaves, &[(0, 0), (0, 1)], ZZ.to_vec())
            .unwrap();
        let ctx = Context::default();
        let num = ctx.contract(&peps.term_network(&term).unwrap(), &leaves)
            .unwrap().scalar().unwrap();

        // apply Z ⊗ Z to the dense state directly
        let psi = peps.grid_network().contract_exact(&leaves).unwrap();
        let (s0, s1) = (peps.phys(0, 0).clone(), peps.phys(0, 1).clone());
        let z = |s: &Index| Tensor::from_elems(
            [s.prime(), s.clone()], vec![1.0, 0.0, 0.0, -1.0]).unwrap();
        let hpsi = psi.contract(&z(&s0)).unwrap().contract(&z(&s1)).unwrap()
            .replace_indices(&[(s0.prime(), s0), (s1.prime(), s1)]).unwrap();
        assert_approx_eq!(f64, num, psi.dot(&hpsi).unwrap(), epsilon = 1e-10);
    }

    #[test]
    fn identity_projectors_keep_the_norm() {
        let (peps, mut leaves) = setup(3, 2, 72);
        let plain = peps.norm_network().contract_exact(&leaves).unwrap();
        let with = peps.norm_network_with(&IdentityProjectors, &mut leaves).unwrap();
        let Network::Group(rows) = &with else { panic!("expected rows") };
        assert_eq!(rows.len(), 3);
        // 2 sites x (ket + bra) + 2 columns x 2 projectors, bottom row none
        assert_eq!(with.count_leaves(), 3 * 4 + 2 * 4);
        let projected = with.contract_exact(&leaves).unwrap();
        assert_approx_eq!(
            f64,
            projected.scalar().unwrap() / plain.scalar().unwrap(),
            1.0,
            epsilon = 1e-10
        );
    }

    #[test]
    fn rayleigh_gradient_matches_finite_differences() {
        let (peps, mut leaves) = setup(2, 2, 73);
        let terms = vec![
            peps.add_term(&mut leaves, &[(0, 0), (1, 0)], ZZ.to_vec()).unwrap(),
            peps.add_term(&mut leaves, &[(1, 1)], X.to_vec()).unwrap(),
        ];
        let params = peps.params(&leaves).unwrap();
        let mut rq = RayleighQuotient::new(&peps, &terms, leaves, Context::default())
            .unwrap();
        let (e, g) = rq.loss_and_grad(&params).unwrap();
        assert_approx_eq!(f64, e, rq.energy().unwrap(), epsilon = 1e-12);

        // directional derivative along a fixed random direction
        let mut rng = StdRng::seed_from_u64(74);
        let mut lv = rq.leaves.clone();
        for id in params.ids() {
            let idx = lv.get(id).unwrap().indices().to_vec();
            lv.set(id, Tensor::random(idx, &mut rng).unwrap()).unwrap();
        }
        let dir = Params::from_leaves(&lv, params.ids()).unwrap();
        let h = 1e-6;
        let (ep, _) = rq.loss_and_grad(&(&params + &(&dir * h))).unwrap();
        let (em, _) = rq.loss_and_grad(&(&params + &(&dir * -h))).unwrap();
        let fd = (ep - em) / (2.0 * h);
        assert_approx_eq!(f64, g.dot(&dir), fd, epsilon = 1e-5);
        assert_eq!(rq.context.cache.misses(), 1);
    }

    #[test]
    fn bad_terms_are_rejected() {
        let (peps, mut leaves) = setup(1, 2, 75);
        assert!(peps.add_term(&mut leaves, &[(1, 0)], X.to_vec()).is_err());
        assert!(peps.add_term(&mut leaves, &[(0, 0)], ZZ.to_vec()).is_err());
        let mut rng = StdRng::seed_from_u64(76);
        assert!(Peps::random(&mut leaves, 0, 2, 2, 2, &mut rng).is_err());
    }
}

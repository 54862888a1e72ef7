//! Variational ground state search for the transverse-field Ising model on a
//! small open lattice,
//!   H = -J Σ_<ij> Z_i Z_j - h Σ_i X_i,
//! by L-BFGS over the PEPS site tensors.

use flexi_logger::Logger;
use log::{ info, LevelFilter };
use rand::{ SeedableRng, rngs::StdRng };
use peps_contract::{
    optim::{ Lbfgs, Optimizer },
    peps::{ LocalTerm, Peps, RayleighQuotient },
    *,
};

const NROW: usize = 2;
const NCOL: usize = 3;
const BOND: usize = 2;
const J: f64 = 1.0;
const H: f64 = 1.5;
const ITERS: usize = 50;
const SEED: u64 = 10546;
const MAX_DIM: &[usize] = &[1, 2, 4, 8, 16];

fn main() {
    let _logger = Logger::with(LevelFilter::Info).start().unwrap();

    let mut rng = StdRng::seed_from_u64(SEED);
    let mut leaves = Leaves::new();
    let peps = Peps::random(&mut leaves, NROW, NCOL, 2, BOND, &mut rng).unwrap();

    let zz: Vec<f64> = [1.0, -1.0, -1.0, 1.0].iter()
        .enumerate()
        .flat_map(|(k, d)| (0..4).map(move |j| if j == k { -J * d } else { 0.0 }))
        .collect();
    let x: Vec<f64> = vec![0.0, -H, -H, 0.0];
    let mut terms: Vec<LocalTerm> = Vec::new();
    for r in 0..NROW {
        for c in 0..NCOL {
            terms.push(peps.add_term(&mut leaves, &[(r, c)], x.clone()).unwrap());
            if c + 1 < NCOL {
                terms.push(
                    peps.add_term(&mut leaves, &[(r, c), (r, c + 1)], zz.clone())
                    .unwrap()
                );
            }
            if r + 1 < NROW {
                terms.push(
                    peps.add_term(&mut leaves, &[(r, c), (r + 1, c)], zz.clone())
                    .unwrap()
                );
            }
        }
    }
    info!("{}x{} lattice, {} local terms", NROW, NCOL, terms.len());

    let init = peps.params(&leaves).unwrap();
    let mut objective =
        RayleighQuotient::new(&peps, &terms, leaves, Context::default()).unwrap();
    let optimizer = Lbfgs { max_iters: ITERS, ..Lbfgs::default() };
    let res = optimizer.minimize(&mut objective, init).unwrap();
    info!(
        "energy per site: {:.8} -> {:.8}",
        res.losses[0] / (NROW * NCOL) as f64,
        res.loss() / (NROW * NCOL) as f64,
    );
    info!(
        "expression cache: {} hits, {} misses",
        objective.context.cache.hits(),
        objective.context.cache.misses(),
    );

    // accuracy of bounded-rank contraction of the optimized state
    let grid = peps.grid_network();
    let exact = grid.contract_exact(&objective.leaves).unwrap();
    for &max_dim in MAX_DIM.iter() {
        let config = ContractionConfig::default()
            .with_tree(Split::Interleaved)
            .with_max_dim(max_dim);
        let approx = Context::new(config).contract(&grid, &objective.leaves).unwrap();
        info!(
            "max_dim = {:2}: relative error {:.3e}",
            max_dim,
            approx.rel_error(&exact).unwrap(),
        );
    }
}

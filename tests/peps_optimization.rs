use rand::{ SeedableRng, rngs::StdRng };
use peps_contract::{
    optim::{
        ConjugateGradient,
        GradientDescent,
        Lbfgs,
        LineSearch,
        Optimizer,
        OptimizeResult,
        Params,
    },
    peps::{ LocalTerm, Peps, RayleighQuotient },
    *,
};

const NROW: usize = 2;
const NCOL: usize = 3;
const ITERS: usize = 8;

// transverse-field Ising terms, -Z Z on every bond and -X on every site
fn ising(peps: &Peps, leaves: &mut Leaves) -> Vec<LocalTerm> {
    let zz = vec![
        -1.0,  0.0,  0.0,  0.0,
         0.0,  1.0,  0.0,  0.0,
         0.0,  0.0,  1.0,  0.0,
         0.0,  0.0,  0.0, -1.0,
    ];
    let x = vec![0.0, -1.0, -1.0, 0.0];
    let mut terms = Vec::new();
    for r in 0..peps.nrow() {
        for c in 0..peps.ncol() {
            terms.push(peps.add_term(leaves, &[(r, c)], x.clone()).unwrap());
            if c + 1 < peps.ncol() {
                terms.push(
                    peps.add_term(leaves, &[(r, c), (r, c + 1)], zz.clone()).unwrap());
            }
            if r + 1 < peps.nrow() {
                terms.push(
                    peps.add_term(leaves, &[(r, c), (r + 1, c)], zz.clone()).unwrap());
            }
        }
    }
    terms
}

fn setup(seed: u64) -> (RayleighQuotient, Params) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut leaves = Leaves::new();
    let peps = Peps::random(&mut leaves, NROW, NCOL, 2, 2, &mut rng).unwrap();
    let terms = ising(&peps, &mut leaves);
    let init = peps.params(&leaves).unwrap();
    let rq = RayleighQuotient::new(&peps, &terms, leaves, Context::default())
        .unwrap();
    (rq, init)
}

fn check(name: &str, res: &OptimizeResult, rq: &RayleighQuotient) {
    assert!(res.losses.len() > 1, "{}: no step was accepted", name);
    for w in res.losses.windows(2) {
        assert!(w[1] <= w[0], "{}: loss increased {} -> {}", name, w[0], w[1]);
    }
    assert!(res.loss() < res.losses[0]);
    // the whole run reuses one contraction graph
    assert_eq!(rq.context.cache.len(), 1);
    assert_eq!(rq.context.cache.misses(), 1);
}

#[test]
fn gradient_descent_lowers_energy() {
    let (mut rq, init) = setup(1000);
    let gd = GradientDescent {
        line_search: LineSearch { initial_step: 0.1, ..LineSearch::default() },
        max_iters: ITERS,
        ..GradientDescent::default()
    };
    let res = gd.minimize(&mut rq, init).unwrap();
    check("gradient descent", &res, &rq);
}

#[test]
fn conjugate_gradient_lowers_energy() {
    let (mut rq, init) = setup(1001);
    let cg = ConjugateGradient { max_iters: ITERS, ..ConjugateGradient::default() };
    let res = cg.minimize(&mut rq, init).unwrap();
    check("conjugate gradient", &res, &rq);
}

#[test]
fn lbfgs_lowers_energy() {
    let (mut rq, init) = setup(1002);
    let lbfgs = Lbfgs { max_iters: ITERS, ..Lbfgs::default() };
    let res = lbfgs.minimize(&mut rq, init).unwrap();
    check("L-BFGS", &res, &rq);

    // the energy is a variational upper bound on the ground state energy of
    // the 6-site model, which lies above -(7 + 6) = -13
    assert!(res.loss() > -13.0);
    res.params.write_into(&mut rq.leaves).unwrap();
    let e = rq.energy().unwrap();
    assert!((e - res.loss()).abs() < 1e-8 * res.loss().abs().max(1.0));
}

#[test]
fn tree_strategy_agrees_on_optimized_norm() {
    let (mut rq, init) = setup(1003);
    let res = Lbfgs { max_iters: 3, ..Lbfgs::default() }
        .minimize(&mut rq, init)
        .unwrap();
    res.params.write_into(&mut rq.leaves).unwrap();
    let norm = &rq.networks()[0];
    let exact = Context::default().contract(norm, &rq.leaves).unwrap();
    let tree = Context::new(
        ContractionConfig::default()
            .with_tree(Split::Contiguous)
            .with_max_dim(1)
    );
    // closed network: no outer indices, so no truncation happens
    let approx = tree.contract(norm, &rq.leaves).unwrap();
    assert!(approx.rel_error(&exact).unwrap() < 1e-10);
}

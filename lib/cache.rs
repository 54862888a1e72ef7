//! Memoization of contraction graphs by network topology.
//!
//! Repeated evaluations of networks with the same structure (e.g. over the
//! iterations of an optimizer, where only the values of the leaf tensors
//! change) can reuse a single [`Expression`]. Structure is captured by a
//! [`TopologySignature`], which is independent of tensor values and of the
//! concrete handles and index identities involved.
//!
//! Entries are never evicted implicitly; the cache lives exactly as long as its
//! owner keeps it.

use std::sync::{
    Arc,
    RwLock,
    PoisonError,
    atomic::{ AtomicUsize, Ordering },
};
use log::debug;
use rustc_hash::{ FxHashMap as HashMap };
use crate::{
    graph::{ Binding, Expression },
    network::{ Leaves, Network, NetworkError, NetworkResult },
};

const GROUP_OPEN: u64 = u64::MAX;
const GROUP_CLOSE: u64 = u64::MAX - 1;
const LEAF: u64 = u64::MAX - 2;
const NEXT_NETWORK: u64 = u64::MAX - 3;

/// Canonical description of the structure of a batch of networks.
///
/// This is a token string recording, for each network, its group nesting and,
/// for each leaf occurrence, its slot number followed by the symbol number and
/// dimension of each of its indices (all numbered by first appearance).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopologySignature(Vec<u64>);

impl TopologySignature {
    /// Compute the signature of a batch.
    pub fn of(networks: &[Network], leaves: &Leaves) -> NetworkResult<Self> {
        let binding = Binding::of(networks, leaves)?;
        Self::with_binding(networks, leaves, &binding)
    }

    /// Compute the signature of a batch whose [`Binding`] is already known.
    pub fn with_binding(networks: &[Network], leaves: &Leaves, binding: &Binding)
        -> NetworkResult<Self>
    {
        fn go(
            net: &Network,
            leaves: &Leaves,
            binding: &Binding,
            acc: &mut Vec<u64>,
        ) -> NetworkResult<()>
        {
            match net {
                Network::Leaf(leaf) => {
                    let slot = binding.slot_of(leaf)
                        .ok_or_else(|| NetworkError::MalformedNetwork(
                            format!("leaf {} is not bound", leaf.id.0)))?;
                    let indices = leaves.indices_of(leaf)?;
                    acc.push(LEAF);
                    acc.push(slot as u64);
                    acc.push(indices.len() as u64);
                    for idx in indices.iter() {
                        let sym = binding.symbol_of(idx)
                            .ok_or_else(|| NetworkError::MalformedNetwork(
                                format!("index {} is not bound", idx.label())))?;
                        acc.push(sym.0 as u64);
                        acc.push(idx.dim() as u64);
                    }
                },
                Network::Group(children) => {
                    acc.push(GROUP_OPEN);
                    for c in children.iter() {
                        go(c, leaves, binding, acc)?;
                    }
                    acc.push(GROUP_CLOSE);
                },
            }
            Ok(())
        }

        let mut acc: Vec<u64> = Vec::new();
        for net in networks.iter() {
            go(net, leaves, binding, &mut acc)?;
            acc.push(NEXT_NETWORK);
        }
        Ok(Self(acc))
    }

    /// Return the token string.
    pub fn tokens(&self) -> &[u64] { &self.0 }
}

/// Thread-safe map from topology signatures to contraction graphs.
#[derive(Debug, Default)]
pub struct NetworkCache {
    map: RwLock<HashMap<TopologySignature, Arc<Expression>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl NetworkCache {
    /// Create a new, empty cache.
    pub fn new() -> Self { Self::default() }

    /// Return the expression stored for `sig`, or build, store and return it.
    ///
    /// `build` is called only on a miss; if it fails, nothing is stored.
    pub fn get_or_build<F>(&self, sig: &TopologySignature, build: F)
        -> NetworkResult<Arc<Expression>>
    where F: FnOnce() -> NetworkResult<Expression>
    {
        {
            let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(expr) = map.get(sig) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("expression cache hit ({} nodes)", expr.len());
                return Ok(Arc::clone(expr));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let expr = Arc::new(build()?);
        debug!("expression cache miss; stored {} nodes", expr.len());
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        // another thread may have finished first; keep the existing entry
        let stored = map.entry(sig.clone()).or_insert(expr);
        Ok(Arc::clone(stored))
    }

    /// Return the expression stored for `sig`, if any.
    pub fn get(&self, sig: &TopologySignature) -> Option<Arc<Expression>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
            .get(sig)
            .cloned()
    }

    /// Remove the entry for `sig`, returning `true` if one existed.
    pub fn invalidate(&self, sig: &TopologySignature) -> bool {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
            .remove(sig)
            .is_some()
    }

    /// Remove all entries. Hit/miss counters are kept.
    pub fn clear(&self) {
        self.map.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Return the number of stored expressions.
    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Return `true` if nothing is stored.
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Return the number of lookups answered from the cache.
    pub fn hits(&self) -> usize { self.hits.load(Ordering::Relaxed) }

    /// Return the number of lookups that required a build.
    pub fn misses(&self) -> usize { self.misses.load(Ordering::Relaxed) }
}

#[cfg(test)]
mod tests {
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{ graph, index::Index, tensor::Tensor };
    use super::*;

    // chain a - b - c with open ends, built from fresh indices each call
    fn chain(leaves: &mut Leaves, rng: &mut StdRng) -> Network {
        let (i, j, k, l) =
            (Index::new(2), Index::new(3), Index::new(3), Index::new(2));
        let a = leaves.insert(Tensor::random([i, j.clone()], rng).unwrap());
        let b = leaves.insert(Tensor::random([j, k.clone()], rng).unwrap());
        let c = leaves.insert(Tensor::random([k, l], rng).unwrap());
        Network::group([Network::from_leaves([a, b]), Network::from(c)])
    }

    #[test]
    fn signature_ignores_identities_and_values() {
        let mut rng = StdRng::seed_from_u64(50);
        let mut leaves = Leaves::new();
        let n1 = chain(&mut leaves, &mut rng);
        let n2 = chain(&mut leaves, &mut rng);
        let s1 = TopologySignature::of(&[n1.clone()], &leaves).unwrap();
        let s2 = TopologySignature::of(&[n2.clone()], &leaves).unwrap();
        assert_eq!(s1, s2);
        let s12 = TopologySignature::of(&[n1.clone(), n2], &leaves).unwrap();
        let s11 = TopologySignature::of(&[n1.clone(), n1], &leaves).unwrap();
        // the second batch shares every slot between its networks
        assert_ne!(s12, s11);
    }

    #[test]
    fn signature_sees_dims_and_nesting() {
        let mut leaves = Leaves::new();
        let i = Index::new(2);
        let j = Index::new(3);
        let a = leaves.insert(Tensor::new([i.clone()], |_| 1.0).unwrap());
        let b = leaves.insert(Tensor::new([i], |_| 1.0).unwrap());
        let c = leaves.insert(Tensor::new([j.clone()], |_| 1.0).unwrap());
        let d = leaves.insert(Tensor::new([j], |_| 1.0).unwrap());
        let flat = Network::from_leaves([a, b]);
        let nested = Network::group([Network::from_leaves([a, b])]);
        let wider = Network::from_leaves([c, d]);
        let sig = |n: &Network| TopologySignature::of(&[n.clone()], &leaves).unwrap();
        assert_ne!(sig(&flat), sig(&nested));
        assert_ne!(sig(&flat), sig(&wider));
    }

    #[test]
    fn cache_is_idempotent() {
        let mut rng = StdRng::seed_from_u64(51);
        let mut leaves = Leaves::new();
        let net = chain(&mut leaves, &mut rng);
        let nets = [net];
        let cache = NetworkCache::new();
        let sig = TopologySignature::of(&nets, &leaves).unwrap();
        let build = || graph::generate_expression(&nets, &leaves).map(|(e, _)| e);
        let e1 = cache.get_or_build(&sig, build).unwrap();
        let e2 = cache.get_or_build(&sig, || panic!("should not rebuild")).unwrap();
        assert!(Arc::ptr_eq(&e1, &e2));
        assert_eq!((cache.hits(), cache.misses(), cache.len()), (1, 1, 1));

        let binding = Binding::of(&nets, &leaves).unwrap();
        let v1 = graph::evaluate(&e1, &binding, &leaves).unwrap();
        let v2 = graph::evaluate(&e2, &binding, &leaves).unwrap();
        assert_eq!(v1, v2);

        assert!(cache.invalidate(&sig));
        assert!(!cache.invalidate(&sig));
        assert!(cache.is_empty());
        assert!(cache.get(&sig).is_none());
    }

    #[test]
    fn cached_expression_rebinds_to_new_leaves() {
        let mut rng = StdRng::seed_from_u64(52);
        let mut leaves = Leaves::new();
        let n1 = [chain(&mut leaves, &mut rng)];
        let n2 = [chain(&mut leaves, &mut rng)];
        let cache = NetworkCache::new();
        let sig = TopologySignature::of(&n1, &leaves).unwrap();
        let expr = cache.get_or_build(&sig, || {
            graph::generate_expression(&n1, &leaves).map(|(e, _)| e)
        }).unwrap();
        let sig2 = TopologySignature::of(&n2, &leaves).unwrap();
        let reused = cache.get_or_build(&sig2, || panic!("should hit")).unwrap();
        let binding = Binding::of(&n2, &leaves).unwrap();
        let got = graph::evaluate(&reused, &binding, &leaves).unwrap();
        let exact = n2[0].contract_exact(&leaves).unwrap();
        assert!(got[0].rel_error(&exact).unwrap() < 1e-12);
        assert!(Arc::ptr_eq(&expr, &reused));
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn failed_build_stores_nothing() {
        let leaves = Leaves::new();
        let cache = NetworkCache::new();
        let sig = TopologySignature::of(&[], &leaves).unwrap();
        let res = cache.get_or_build(&sig, || {
            Err(NetworkError::MalformedNetwork("nope".into()))
        });
        assert!(res.is_err());
        assert!(cache.is_empty());
    }
}

//! A dense N-dimensional array of real numbers with shape determined by a set
//! of labeled [`Index`]es.
//!
//! A [`Tensor`] is multi-linear algebraic object that can be seen as the
//! generalization of linear or bi-linear objects such as vectors and matrices.
//! Linear operations are generalized as well: the usual matrix-matrix,
//! matrix-vector, vector-matrix, and vector-vector "dot" products are
//! generalized to the tensor contraction over all indices shared by two
//! tensors, where the result is calculated by summing over the values of those
//! indices and leaving all others untouched.
//!
//! <blockquote>
//!   <p style="font-size:20px">
//!     <i>C</i><sub>
//!       <i>a</i><sub>1</sub>,...,<i>a</i><sub><i>N</i></sub>,
//!       <i>b</i><sub>1</sub>,...,<i>b</i><sub><i>M</i></sub>
//!     </sub>
//!       = Σ<sub><i>α</i><sub>1</sub>,...,<i>α</i><sub><i>D</i></sub></sub> [
//!         <i>A</i><sub>
//!           <i>a</i><sub>1</sub>,...,<i>a</i><sub><i>N</i></sub>,
//!           <i>α</i><sub>1</sub>,...,<i>α</i><sub><i>D</i></sub>
//!         </sub>
//!         × <i>B</i><sub>
//!           <i>b</i><sub>1</sub>,...,<i>b</i><sub><i>M</i></sub>,
//!           <i>α</i><sub>1</sub>,...,<i>α</i><sub><i>D</i></sub>
//!         </sub>
//!       ]
//!   </p>
//! </blockquote>
//!
//! Tensors with no common indices contract to their ordinary tensor product.
//!
//! ```
//! use peps_contract::{ index::Index, tensor::Tensor };
//!
//! let a_idx = Index::new(3);
//! let b_idx = Index::new(4);
//! let c_idx = Index::new(5);
//!
//! let a = Tensor::new([a_idx.clone(), b_idx.clone()], |_| 1.0).unwrap();
//! let b = Tensor::new([b_idx, c_idx.clone()], |_| 2.0).unwrap();
//!
//! let c = a.contract(&b).unwrap(); // C_{a,c} = A_{a,b} B_{b,c}
//! assert_eq!(c.indices(), &[a_idx, c_idx]);
//! assert!(c.data().iter().all(|x| *x == 8.0));
//! ```

use std::{ cmp::Ordering, fmt };
use nalgebra as na;
use ndarray::{ self as nd, Dimension };
use rand::Rng;
use thiserror::Error;
use crate::index::{ self, Index };

#[derive(Debug, Error)]
pub enum TensorError {
    /// Returned when attempting to create a new tensor with duplicate indices.
    #[error("error in tensor creation: duplicate indices")]
    DuplicateIndices,

    /// Returned when attempting to create a new tensor from a pre-existing
    /// collection of elements and the provided indices have non-matching total
    /// dimension.
    #[error("error in tensor creation: non-matching indices and number of elements")]
    IncompatibleNumElems,

    /// Returned when two tensors share an index but hold it with different
    /// dimensions.
    #[error("index mismatch: {0}")]
    IndexMismatch(String),

    /// Returned when an element-wise operation is attempted between two
    /// tensors with incompatible indices.
    #[error("error in tensor {0}: non-matching indices")]
    IncompatibleIndices(&'static str),

    /// Returned when a permutation names an index the tensor doesn't hold.
    #[error("error in tensor permutation: missing index {0}")]
    MissingIndex(String),

    /// Returned when a scalar is requested from a tensor of non-zero rank.
    #[error("error in scalar extraction: tensor has rank {0}")]
    NotScalar(usize),

    /// Returned when truncation parameters leave no valid rank.
    #[error("truncation infeasible: {0}")]
    TruncationInfeasible(String),

    /// Returned by internal array reshapes.
    #[error("array shape error: {0}")]
    Shape(#[from] nd::ShapeError),
}
use TensorError::*;
pub type TensorResult<T> = Result<T, TensorError>;

fn is_unique<'a, I>(elems: I) -> bool
where I: IntoIterator<Item = &'a Index> + Copy
{
    elems.into_iter().enumerate()
        .all(|(k, e0)| elems.into_iter().skip(k + 1).all(|e1| e0 != e1))
}

/// Parameters controlling a rank-truncated factorization.
///
/// Singular values are discarded from the smallest upward while the discarded
/// weight `Σ σ²_discarded / Σ σ²` stays at most `cutoff`, and the kept rank is
/// then capped at `max_dim`; whichever binds first determines the rank. At
/// least one singular value is always kept.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Truncation {
    pub cutoff: f64,
    pub max_dim: usize,
}

impl Default for Truncation {
    fn default() -> Self { Self { cutoff: 0.0, max_dim: usize::MAX } }
}

impl Truncation {
    /// Check that the parameters admit a positive rank.
    pub fn check(&self) -> TensorResult<()> {
        if self.max_dim == 0 {
            return Err(TruncationInfeasible("max_dim must be positive".into()));
        }
        if !self.cutoff.is_finite() || self.cutoff < 0.0 {
            return Err(TruncationInfeasible(
                format!("cutoff must be finite and non-negative, got {}", self.cutoff)
            ));
        }
        Ok(())
    }

    /// Return the number of values to keep from a spectrum sorted in
    /// descending order, along with the relative discarded weight.
    pub fn rank(&self, s: &[f64]) -> (usize, f64) {
        let total: f64 = s.iter().map(|sj| sj.powi(2)).sum();
        if s.is_empty() || total <= 0.0 { return (1.min(s.len()), 0.0); }
        let mut rank = s.len();
        let mut discarded = 0.0;
        for sj in s.iter().rev() {
            let w = discarded + sj.powi(2) / total;
            if rank <= 1 || w > self.cutoff { break; }
            discarded = w;
            rank -= 1;
        }
        if rank > self.max_dim {
            rank = self.max_dim;
            discarded = s[rank..].iter().map(|sj| sj.powi(2)).sum::<f64>() / total;
        }
        (rank, discarded)
    }
}

/// Output of [`Tensor::svd`].
///
/// `u` holds the row indices plus the new bond index and is an isometry over
/// the row indices; `q` holds the bond index plus the column indices and has
/// the singular values absorbed, so that `u * q` approximates the factored
/// tensor.
#[derive(Clone, Debug)]
pub struct Svd {
    pub u: Tensor,
    pub s: Vec<f64>,
    pub q: Tensor,
    pub bond: Index,
    pub rank: usize,
    pub discarded: f64,
}

/// Basic implementation of a dense real tensor.
///
/// A `Tensor` consists of an array of `f64`s and a series of *unique* indices
/// whose dimensions give the shape of the array. The order of indices is the
/// order of array axes.
///
/// Note that equality between `Tensor`s is defined with some attention
/// dependence on inner structure. For two `Tensor`s to be equal, their indices
/// must all be equal and *in the same order*, in addition to naive pairwise
/// equality between tensor elements.
///
/// `Tensor`s implement addition and subtraction between tensors with equal sets
/// of indices (index order does not matter here), and multiplication is
/// implemented to contract over all matching indices, resorting to an ordinary
/// tensor product when two tensors have no matching indices.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    indices: Vec<Index>,
    data: nd::ArrayD<f64>,
}

impl Tensor {
    /// Create a new tensor using a function over index values.
    pub fn new<I, F>(indices: I, mut elems: F) -> TensorResult<Self>
    where
        I: IntoIterator<Item = Index>,
        F: FnMut(&[usize]) -> f64,
    {
        let indices: Vec<Index> = indices.into_iter().collect();
        if !is_unique(&indices) { return Err(DuplicateIndices); }
        let shape: Vec<usize> = indices.iter().map(|idx| idx.dim()).collect();
        let data = nd::ArrayD::from_shape_fn(
            nd::IxDyn(&shape), |ix| elems(ix.slice()));
        Ok(Self { indices, data })
    }

    /// Create a new rank-0 (scalar) tensor.
    pub fn new_scalar(val: f64) -> Self {
        Self { indices: Vec::new(), data: nd::arr0(val).into_dyn() }
    }

    /// Create a new tensor from a pre-existing vector of elements in row-major
    /// order.
    ///
    /// Fails if duplicate indices are provided or the length of the vector does
    /// not match the total dimension of the indices.
    pub fn from_elems<I>(indices: I, elems: Vec<f64>) -> TensorResult<Self>
    where I: IntoIterator<Item = Index>
    {
        let indices: Vec<Index> = indices.into_iter().collect();
        if !is_unique(&indices) { return Err(DuplicateIndices); }
        if index::total_dim(&indices) != elems.len() {
            return Err(IncompatibleNumElems);
        }
        let shape: Vec<usize> = indices.iter().map(|idx| idx.dim()).collect();
        let data = nd::ArrayD::from_shape_vec(nd::IxDyn(&shape), elems)?;
        Ok(Self { indices, data })
    }

    /// Create a new tensor with elements drawn uniformly from `[-1, 1)`.
    pub fn random<I, R>(indices: I, rng: &mut R) -> TensorResult<Self>
    where
        I: IntoIterator<Item = Index>,
        R: Rng + ?Sized,
    {
        Self::new(indices, |_| rng.gen_range(-1.0..1.0))
    }

    /// Create a tensor of zeros with the same indices as `self`.
    pub fn zeros_like(&self) -> Self {
        Self {
            indices: self.indices.clone(),
            data: nd::ArrayD::zeros(self.data.raw_dim()),
        }
    }

    /// Return `true` if `self` has rank 0.
    pub fn is_scalar(&self) -> bool { self.indices.is_empty() }

    /// Return `true` if `self` has the given index.
    pub fn has_index(&self, index: &Index) -> bool {
        self.indices.contains(index)
    }

    /// Return the rank (i.e. the number of indices) of `self`.
    pub fn rank(&self) -> usize { self.indices.len() }

    /// Return the shape (dimensions of each index) of `self` in a vector.
    ///
    /// If `self` is a scalar, the returned vector is empty.
    pub fn shape(&self) -> Vec<usize> { self.data.shape().to_vec() }

    /// Return the total number of elements.
    pub fn len(&self) -> usize { self.data.len() }

    /// Return `true` if `self` holds no elements; never true for valid
    /// tensors.
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Return the indices of `self`, in axis order.
    pub fn indices(&self) -> &[Index] { &self.indices }

    /// Return a reference to the underlying array.
    pub fn data(&self) -> &nd::ArrayD<f64> { &self.data }

    /// Return all elements in row-major order.
    pub fn elems(&self) -> Vec<f64> { self.data.iter().copied().collect() }

    /// Return the value of a rank-0 tensor.
    pub fn scalar(&self) -> TensorResult<f64> {
        if self.is_scalar() {
            Ok(self.data.iter().next().copied().unwrap_or_default())
        } else {
            Err(NotScalar(self.rank()))
        }
    }

    /// Replace indices by the given `(old, new)` pairs, leaving the data
    /// untouched.
    ///
    /// Indices of `self` not named in `map` are kept; entries of `map` naming
    /// indices not in `self` are ignored. Fails if a replacement changes an
    /// index dimension or produces duplicate indices.
    pub fn replace_indices(&self, map: &[(Index, Index)]) -> TensorResult<Self> {
        let indices: Vec<Index> =
            self.indices.iter()
            .map(|idx| {
                match map.iter().find(|(old, _)| old == idx) {
                    Some((old, new)) if old.dim() != new.dim() => {
                        Err(IndexMismatch(format!(
                            "cannot replace {} with {}", old.label(), new.label())))
                    },
                    Some((_, new)) => Ok(new.clone()),
                    None => Ok(idx.clone()),
                }
            })
            .collect::<TensorResult<_>>()?;
        if !is_unique(&indices) { return Err(DuplicateIndices); }
        Ok(Self { indices, data: self.data.clone() })
    }

    // positions of `order` within `self.indices`
    fn axes_of(&self, order: &[Index]) -> TensorResult<Vec<usize>> {
        order.iter()
            .map(|idx| {
                self.indices.iter().position(|i| i == idx)
                    .ok_or_else(|| MissingIndex(idx.label()))
            })
            .collect()
    }

    // elements in row-major order after permuting axes to `order`
    fn elems_permuted(&self, order: &[Index]) -> TensorResult<Vec<f64>> {
        let axes = self.axes_of(order)?;
        Ok(self.data.view().permuted_axes(axes).iter().copied().collect())
    }

    /// Return a copy of `self` with indices rearranged into `order`.
    ///
    /// Fails if `order` is not a permutation of the indices of `self`.
    pub fn permuted(&self, order: &[Index]) -> TensorResult<Self> {
        if order.len() != self.rank() || !is_unique(order) {
            return Err(IncompatibleIndices("permutation"));
        }
        let elems = self.elems_permuted(order)?;
        Self::from_elems(order.iter().cloned(), elems)
    }

    fn check_shared(&self, other: &Self) -> TensorResult<Vec<Index>> {
        let mut common: Vec<Index> = Vec::new();
        for idx in self.indices.iter() {
            if let Some(jdx) = other.indices.iter().find(|j| *j == idx) {
                if idx.dim() != jdx.dim() {
                    return Err(IndexMismatch(format!(
                        "shared index {} has dimensions {} and {}",
                        idx.label(), idx.dim(), jdx.dim(),
                    )));
                }
                common.push(idx.clone());
            }
        }
        Ok(common)
    }

    /// Contract `self` with `other` over all common indices. If no common
    /// indices exist, this is equivalent to an ordinary tensor product.
    ///
    /// The result holds the non-common indices of `self` followed by those of
    /// `other`, each in their original order.
    ///
    /// Fails if a common index is held with different dimensions.
    pub fn contract(&self, other: &Self) -> TensorResult<Self> {
        let common = self.check_shared(other)?;
        let a_free: Vec<Index> =
            self.indices.iter()
            .filter(|idx| !common.contains(idx))
            .cloned()
            .collect();
        let b_free: Vec<Index> =
            other.indices.iter()
            .filter(|idx| !common.contains(idx))
            .cloned()
            .collect();
        let m = index::total_dim(&a_free);
        let k = index::total_dim(&common);
        let n = index::total_dim(&b_free);

        let a_order: Vec<Index> =
            a_free.iter().chain(common.iter()).cloned().collect();
        let b_order: Vec<Index> =
            common.iter().chain(b_free.iter()).cloned().collect();
        let a = nd::Array2::from_shape_vec((m, k), self.elems_permuted(&a_order)?)?;
        let b = nd::Array2::from_shape_vec((k, n), other.elems_permuted(&b_order)?)?;
        let c = a.dot(&b);

        let indices: Vec<Index> = a_free.into_iter().chain(b_free).collect();
        Self::from_elems(indices, c.iter().copied().collect())
    }

    fn zip_with<F>(&self, other: &Self, op: &'static str, f: F)
        -> TensorResult<Self>
    where F: Fn(f64, f64) -> f64
    {
        if self.rank() != other.rank()
            || self.indices.iter().any(|idx| !other.has_index(idx))
        {
            return Err(IncompatibleIndices(op));
        }
        self.check_shared(other)?;
        let rhs = other.elems_permuted(&self.indices)?;
        let elems: Vec<f64> =
            self.data.iter().zip(rhs)
            .map(|(l, r)| f(*l, r))
            .collect();
        Self::from_elems(self.indices.clone(), elems)
    }

    /// Compute the sum of `self` and `other`.
    ///
    /// Fails if either tensor holds an index not held by the other.
    ///
    /// This operation is used by the `+` operator.
    pub fn add_checked(&self, other: &Self) -> TensorResult<Self> {
        self.zip_with(other, "add", |l, r| l + r)
    }

    /// Compute the difference of `self` and `other`.
    ///
    /// Fails if either tensor holds an index not held by the other.
    ///
    /// This operation is used by the `-` operator.
    pub fn sub_checked(&self, other: &Self) -> TensorResult<Self> {
        self.zip_with(other, "sub", |l, r| l - r)
    }

    /// Add `other` into `self` in place.
    pub fn add_assign_checked(&mut self, other: &Self) -> TensorResult<()> {
        *self = self.add_checked(other)?;
        Ok(())
    }

    /// Return `self` with every element multiplied by `a`.
    pub fn scale(&self, a: f64) -> Self {
        Self { indices: self.indices.clone(), data: &self.data * a }
    }

    /// Compute the full inner product `Σ self * other` between two tensors with
    /// the same set of indices.
    pub fn dot(&self, other: &Self) -> TensorResult<f64> {
        if self.rank() != other.rank()
            || self.indices.iter().any(|idx| !other.has_index(idx))
        {
            return Err(IncompatibleIndices("inner product"));
        }
        self.contract(other)?.scalar()
    }

    /// Return the Frobenius norm.
    pub fn norm(&self) -> f64 {
        self.data.iter().map(|x| x.powi(2)).sum::<f64>().sqrt()
    }

    /// Return `‖self - reference‖ / ‖reference‖`, aligning index order first.
    pub fn rel_error(&self, reference: &Self) -> TensorResult<f64> {
        let diff = self.sub_checked(reference)?.norm();
        let norm = reference.norm();
        Ok(if norm > 0.0 { diff / norm } else { diff })
    }

    /// Compute a rank-truncated singular value decomposition, treating the
    /// indices in `row` as the row side of a matrix and all others as the
    /// column side.
    ///
    /// The new bond index is tagged `"Link"`. Fails if `row` names an index
    /// not in `self`, or if the truncation parameters are infeasible.
    pub fn svd(&self, row: &[Index], trunc: Truncation) -> TensorResult<Svd> {
        trunc.check()?;
        let col: Vec<Index> =
            self.indices.iter()
            .filter(|idx| !row.contains(idx))
            .cloned()
            .collect();
        let m = index::total_dim(row);
        let n = index::total_dim(&col);
        let order: Vec<Index> = row.iter().chain(col.iter()).cloned().collect();
        let elems = self.elems_permuted(&order)?;
        let mat = na::DMatrix::from_row_iterator(m, n, elems);
        let svd = mat.svd(true, true);
        let (Some(u), Some(vt)) = (svd.u, svd.v_t)
            else { unreachable!() };
        let mut perm: Vec<usize> = (0..svd.singular_values.len()).collect();
        perm.sort_by(|&a, &b| {
            svd.singular_values[b].partial_cmp(&svd.singular_values[a])
                .unwrap_or(Ordering::Equal)
        });
        let s: Vec<f64> =
            perm.iter().map(|&j| svd.singular_values[j]).collect();
        let (rank, discarded) = trunc.rank(&s);

        let bond = Index::with_tags(rank, "Link");
        let u_elems: Vec<f64> =
            (0..m).flat_map(|i| perm[..rank].iter().map(move |&j| (i, j)))
            .map(|(i, j)| u[(i, j)])
            .collect();
        let q_elems: Vec<f64> =
            perm[..rank].iter()
            .flat_map(|&j| (0..n).map(move |c| (j, c)))
            .map(|(j, c)| svd.singular_values[j] * vt[(j, c)])
            .collect();
        let u = Self::from_elems(
            row.iter().cloned().chain([bond.clone()]), u_elems)?;
        let q = Self::from_elems(
            [bond.clone()].into_iter().chain(col), q_elems)?;
        let s = s.into_iter().take(rank).collect();
        Ok(Svd { u, s, q, bond, rank, discarded })
    }
}

impl std::ops::Mul<&Tensor> for &Tensor {
    type Output = Tensor;

    fn mul(self, other: &Tensor) -> Self::Output {
        match self.contract(other) {
            Ok(res) => res,
            Err(err) => panic!("{}", err),
        }
    }
}

impl std::ops::Add<&Tensor> for &Tensor {
    type Output = Tensor;

    fn add(self, other: &Tensor) -> Self::Output {
        match self.add_checked(other) {
            Ok(res) => res,
            Err(err) => panic!("{}", err),
        }
    }
}

impl std::ops::Sub<&Tensor> for &Tensor {
    type Output = Tensor;

    fn sub(self, other: &Tensor) -> Self::Output {
        match self.sub_checked(other) {
            Ok(res) => res,
            Err(err) => panic!("{}", err),
        }
    }
}

impl std::ops::Mul<f64> for &Tensor {
    type Output = Tensor;

    fn mul(self, a: f64) -> Self::Output { self.scale(a) }
}

impl std::ops::Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Self::Output { self.scale(-1.0) }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{ ", self.data)?;
        let n = self.indices.len();
        for (k, idx) in self.indices.iter().enumerate() {
            write!(f, "{}", idx)?;
            if k < n - 1 { write!(f, ", ")?; }
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use super::*;

    #[test]
    fn contract_matrix_product() {
        let i = Index::new(2);
        let j = Index::new(3);
        let k = Index::new(2);
        let a = Tensor::from_elems(
            [i.clone(), j.clone()], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_elems(
            [k.clone(), j.clone()], vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0]).unwrap();
        let c = a.contract(&b).unwrap();
        assert_eq!(c.indices(), &[i, k]);
        assert_eq!(c.elems(), vec![4.0, 2.0, 10.0, 5.0]);
    }

    #[test]
    fn contract_scalar_and_outer() {
        let i = Index::new(2);
        let j = Index::new(2);
        let s = Tensor::new_scalar(3.0);
        let a = Tensor::from_elems([i.clone()], vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_elems([j.clone()], vec![1.0, -1.0]).unwrap();
        assert_eq!((&s * &a).elems(), vec![3.0, 6.0]);
        let ab = &a * &b;
        assert_eq!(ab.indices(), &[i, j]);
        assert_eq!(ab.elems(), vec![1.0, -1.0, 2.0, -2.0]);
        assert_approx_eq!(f64, a.dot(&a).unwrap(), 5.0);
    }

    #[test]
    fn contract_mismatched_dims() {
        let i = Index::new(2);
        let i_bad = Index::from_raw(i.id(), 3);
        let a = Tensor::new([i], |_| 1.0).unwrap();
        let b = Tensor::new([i_bad], |_| 1.0).unwrap();
        assert!(matches!(a.contract(&b), Err(IndexMismatch(_))));
    }

    #[test]
    fn add_aligns_index_order() {
        let i = Index::new(2);
        let j = Index::new(3);
        let mut rng = StdRng::seed_from_u64(10);
        let a = Tensor::random([i.clone(), j.clone()], &mut rng).unwrap();
        let at = a.permuted(&[j.clone(), i.clone()]).unwrap();
        let zero = a.sub_checked(&at).unwrap();
        assert_approx_eq!(f64, zero.norm(), 0.0);
        assert!(Tensor::new([i.clone(), i], |_| 0.0).is_err());
    }

    #[test]
    fn svd_exact_and_truncated() {
        let mut rng = StdRng::seed_from_u64(11);
        let i = Index::new(3);
        let j = Index::new(2);
        let k = Index::new(4);
        let t = Tensor::random([i.clone(), j.clone(), k.clone()], &mut rng)
            .unwrap();

        let svd = t.svd(&[i.clone(), j.clone()], Truncation::default()).unwrap();
        assert_eq!(svd.rank, 4);
        let rec = svd.u.contract(&svd.q).unwrap();
        assert!(rec.rel_error(&t).unwrap() < 1e-12);
        // u is an isometry over the row indices
        let uu = svd.u.contract(&svd.u.replace_indices(
            &[(svd.bond.clone(), svd.bond.prime())]).unwrap()).unwrap();
        for a in 0..4 {
            for b in 0..4 {
                let expected = if a == b { 1.0 } else { 0.0 };
                assert_approx_eq!(
                    f64, uu.data()[[a, b].as_slice()], expected, epsilon = 1e-12);
            }
        }

        let trunc = Truncation { cutoff: 0.0, max_dim: 2 };
        let svd2 = t.svd(&[i, j], trunc).unwrap();
        assert_eq!(svd2.rank, 2);
        assert!(svd2.discarded > 0.0);
        let err = svd2.u.contract(&svd2.q).unwrap().rel_error(&t).unwrap();
        assert_approx_eq!(f64, err.powi(2), svd2.discarded, epsilon = 1e-10);
    }

    #[test]
    fn truncation_rank_rules() {
        let s = [4.0, 2.0, 1.0, 0.0];
        assert_eq!(Truncation::default().rank(&s).0, 3);
        assert_eq!(Truncation { cutoff: 0.05, max_dim: 10 }.rank(&s).0, 2);
        assert_eq!(Truncation { cutoff: 0.0, max_dim: 1 }.rank(&s).0, 1);
        assert!(Truncation { cutoff: 0.0, max_dim: 0 }.check().is_err());
        assert!(Truncation { cutoff: -1.0, max_dim: 4 }.check().is_err());
    }
}

//! Parameter tensor with gradient storage

use crate::error::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Flat parameter buffer with a logical shape and an optional gradient.
///
/// Networks keep their weights as `Tensor`s so that optimizers, gradient
/// clipping, EMA updates and collectives can treat every parameter the same
/// way regardless of its rank.
#[derive(Clone)]
pub struct Tensor {
    data: Array1<f32>,
    shape: Vec<usize>,
    grad: Option<Array1<f32>>,
    requires_grad: bool,
}

impl Tensor {
    /// Create a new tensor from flat data and a logical shape
    pub fn new(data: Array1<f32>, shape: Vec<usize>, requires_grad: bool) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::ShapeMismatch {
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self {
            data,
            shape,
            grad: None,
            requires_grad,
        })
    }

    /// Create a 1-D tensor from a vector
    pub fn from_vec(data: Vec<f32>, requires_grad: bool) -> Self {
        let len = data.len();
        Self {
            data: Array1::from(data),
            shape: vec![len],
            grad: None,
            requires_grad,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: &[usize], requires_grad: bool) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            data: Array1::zeros(numel),
            shape: shape.to_vec(),
            grad: None,
            requires_grad,
        }
    }

    /// Truncated normal init (clipped at two standard deviations)
    pub fn trunc_normal<R: Rng + ?Sized>(shape: &[usize], std: f32, rng: &mut R) -> Result<Self> {
        let normal = Normal::new(0.0f32, std)
            .map_err(|e| Error::InvalidParameter(format!("init std {std}: {e}")))?;
        let numel: usize = shape.iter().product();
        let data = (0..numel)
            .map(|_| loop {
                let v = normal.sample(rng);
                if v.abs() <= 2.0 * std {
                    break v;
                }
            })
            .collect::<Array1<f32>>();
        Ok(Self {
            data,
            shape: shape.to_vec(),
            grad: None,
            requires_grad: true,
        })
    }

    /// Get reference to data
    pub fn data(&self) -> &Array1<f32> {
        &self.data
    }

    /// Get mutable reference to data
    pub fn data_mut(&mut self) -> &mut Array1<f32> {
        &mut self.data
    }

    /// Logical shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of logical dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// View a rank-2 parameter as a matrix
    pub fn matrix(&self) -> Result<ArrayView2<'_, f32>> {
        match self.shape.as_slice() {
            &[rows, cols] => Ok(self.data.view().into_shape((rows, cols))?),
            other => Err(Error::ShapeMismatch {
                expected: vec![0, 0],
                got: other.to_vec(),
            }),
        }
    }

    /// Get gradient (if computed)
    pub fn grad(&self) -> Option<&Array1<f32>> {
        self.grad.as_ref()
    }

    /// Mutable gradient access (clipping, unscaling, cancellation)
    pub fn grad_mut(&mut self) -> Option<&mut Array1<f32>> {
        self.grad.as_mut()
    }

    /// Set gradient
    pub fn set_grad(&mut self, grad: Array1<f32>) {
        self.grad = Some(grad);
    }

    /// Accumulate gradient (for when tensor is used multiple times)
    pub fn accumulate_grad(&mut self, grad: &Array1<f32>) {
        if !self.requires_grad {
            return;
        }
        match self.grad.as_mut() {
            Some(existing) => *existing += grad,
            None => self.grad = Some(grad.clone()),
        }
    }

    /// Accumulate a matrix-shaped gradient
    pub fn accumulate_grad_matrix(&mut self, grad: &Array2<f32>) {
        let flat = grad.iter().copied().collect::<Array1<f32>>();
        self.accumulate_grad(&flat);
    }

    /// Zero out gradient
    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    /// Check if requires gradient
    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Freeze or unfreeze the parameter
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if !requires_grad {
            self.grad = None;
        }
    }

    /// Get size
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("has_grad", &self.grad.is_some())
            .field("requires_grad", &self.requires_grad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zeros_flattens_shape() {
        let t = Tensor::zeros(&[2, 3, 4], false);
        assert_eq!(t.len(), 24);
        assert_eq!(t.shape(), &[2, 3, 4]);
        assert!(t.data().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_new_rejects_wrong_numel() {
        let err = Tensor::new(Array1::zeros(5), vec![2, 3], true);
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_matrix_view_is_row_major() {
        let t = Tensor::new(array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3], true).unwrap();
        let m = t.matrix().unwrap();
        assert_eq!(m[[1, 0]], 4.0);
        assert_eq!(m[[0, 2]], 3.0);
    }

    #[test]
    fn test_accumulate_grad_sums() {
        let mut t = Tensor::zeros(&[3], true);
        t.accumulate_grad(&array![1.0, 2.0, 3.0]);
        t.accumulate_grad(&array![1.0, 1.0, 1.0]);
        assert_eq!(t.grad().unwrap(), &array![2.0, 3.0, 4.0]);
        t.zero_grad();
        assert!(t.grad().is_none());
    }

    #[test]
    fn test_frozen_tensor_ignores_gradients() {
        let mut t = Tensor::zeros(&[2], false);
        t.accumulate_grad(&array![1.0, 1.0]);
        assert!(t.grad().is_none());
    }

    #[test]
    fn test_trunc_normal_within_two_std() {
        let mut rng = StdRng::seed_from_u64(7);
        let t = Tensor::trunc_normal(&[16, 8], 0.02, &mut rng).unwrap();
        assert_eq!(t.len(), 128);
        assert!(t.data().iter().all(|v| v.abs() <= 0.04));
    }
}

//! Small dense kernels shared by the backbone and the losses

use ndarray::{Array1, Array2, ArrayView1, ArrayViewMut1, Axis};

const GELU_K: f32 = 0.797_884_6; // sqrt(2 / pi)
const GELU_C: f32 = 0.044_715;

/// tanh approximation of GELU
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (GELU_K * (x + GELU_C * x * x * x)).tanh())
}

/// Derivative of [`gelu`]
pub fn gelu_grad(x: f32) -> f32 {
    let t = (GELU_K * (x + GELU_C * x * x * x)).tanh();
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * GELU_K * (1.0 + 3.0 * GELU_C * x * x)
}

/// In-place numerically stable softmax of one row
pub fn softmax_inplace(mut row: ArrayViewMut1<'_, f32>) {
    let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    row.mapv_inplace(|v| (v - max_val).exp());
    let sum: f32 = row.sum();
    row.mapv_inplace(|v| v / sum);
}

/// Compute softmax along last axis for 2D array
///
/// softmax(x)_i = exp(x_i) / Σ exp(x_j)
pub fn softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut result = x.clone();
    for row in result.axis_iter_mut(Axis(0)) {
        softmax_inplace(row);
    }
    result
}

/// log-softmax along last axis
pub fn log_softmax_rows(x: &Array2<f32>) -> Array2<f32> {
    let mut result = x.clone();
    for mut row in result.axis_iter_mut(Axis(0)) {
        let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum = row.iter().map(|&v| (v - max_val).exp()).sum::<f32>().ln() + max_val;
        row.mapv_inplace(|v| v - log_sum);
    }
    result
}

/// Outer product `a bᵀ`
pub fn outer(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> Array2<f32> {
    let a2 = a.insert_axis(Axis(1));
    let b2 = b.insert_axis(Axis(0));
    a2.dot(&b2)
}

/// Row-wise L2 normalisation, returns the normalised rows and the divisors used
pub fn l2_normalize_rows(x: &Array2<f32>, eps: f32) -> (Array2<f32>, Array1<f32>) {
    let norms = x
        .axis_iter(Axis(0))
        .map(|row| row.dot(&row).sqrt().max(eps))
        .collect::<Array1<f32>>();
    let mut out = x.clone();
    for (mut row, &n) in out.axis_iter_mut(Axis(0)).zip(norms.iter()) {
        row.mapv_inplace(|v| v / n);
    }
    (out, norms)
}

/// Backward of [`l2_normalize_rows`] given the normalised rows and divisors
pub fn l2_normalize_rows_backward(
    normalized: &Array2<f32>,
    norms: &Array1<f32>,
    grad_out: &Array2<f32>,
    eps: f32,
) -> Array2<f32> {
    let mut grad_in = grad_out.clone();
    for ((mut g, n), &r) in grad_in
        .axis_iter_mut(Axis(0))
        .zip(normalized.axis_iter(Axis(0)))
        .zip(norms.iter())
    {
        if r > eps {
            let proj = n.dot(&g);
            g.zip_mut_with(&n, |gi, &ni| *gi = (*gi - ni * proj) / r);
        } else {
            g.mapv_inplace(|v| v / r);
        }
    }
    grad_in
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_softmax_sums_to_one() {
        let x = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let probs = softmax_rows(&x);
        for row in probs.axis_iter(Axis(0)) {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_log_softmax_matches_log_of_softmax() {
        let x = array![[0.3, -1.2, 2.5, 0.0]];
        let a = log_softmax_rows(&x);
        let b = softmax_rows(&x).mapv(f32::ln);
        for (u, v) in a.iter().zip(b.iter()) {
            assert_relative_eq!(u, v, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_gelu_grad_matches_finite_difference() {
        for &x in &[-2.0f32, -0.5, 0.0, 0.7, 1.9] {
            let h = 1e-3;
            let fd = (gelu(x + h) - gelu(x - h)) / (2.0 * h);
            assert_relative_eq!(gelu_grad(x), fd, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_outer_shape() {
        let o = outer(array![1.0, 2.0].view(), array![3.0, 4.0, 5.0].view());
        assert_eq!(o.dim(), (2, 3));
        assert_eq!(o[[1, 2]], 10.0);
    }

    #[test]
    fn test_l2_normalize_backward_is_orthogonal() {
        let x = array![[3.0, 4.0]];
        let (n, norms) = l2_normalize_rows(&x, 1e-12);
        assert_relative_eq!(n[[0, 0]], 0.6, epsilon = 1e-6);
        // gradient along the normalised direction vanishes
        let g = l2_normalize_rows_backward(&n, &norms, &n, 1e-12);
        assert_relative_eq!(g[[0, 0]], 0.0, epsilon = 1e-6);
        assert_relative_eq!(g[[0, 1]], 0.0, epsilon = 1e-6);
    }
}

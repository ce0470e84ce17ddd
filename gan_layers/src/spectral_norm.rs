//! Spectral normalization of convolution kernels.
//!
//! The wrapped convolution's kernel is divided by a power-iteration estimate of
//! its largest singular value before every forward pass. The unnormalized
//! kernel (`kernel_orig`) is the trainable parameter; the normalized kernel is
//! recomputed on each call and handed to the convolution explicitly.

use crate::conv::Convolution;
use crate::cpu_utils::{dot, matvec, matvec_transposed};
use crate::error::{LayerError, LayerResult};
use crate::init::{layer_rng, random_normal};
use crate::param::{Parameter, Parameterized, scoped};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use tracing::{debug, trace};

pub const L2_EPSILON: f32 = 1e-12;
const U_INIT_STDDEV: f32 = 0.05;

/// `v / (||v||_2 + epsilon)`.
pub fn normalize_l2(v: &[f32], epsilon: f32) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter().map(|x| x / (norm + epsilon)).collect()
}

/// Power iteration on `w: [rows][cols]` starting from `u: [rows]`.
///
/// Each step computes `v = normalize(Wᵀu)`, `u = normalize(Wv)` and
/// `sigma = uᵀWv`; `u` carries over between steps. Returns the final sigma and
/// left singular vector estimate.
pub fn power_iteration(
    w: &[f32],
    rows: usize,
    cols: usize,
    u: &[f32],
    iterations: usize,
) -> LayerResult<(f32, Vec<f32>)> {
    if iterations == 0 {
        return Err(LayerError::config("power iteration needs at least one step"));
    }
    if w.len() != rows * cols || u.len() != rows {
        return Err(LayerError::shape_mismatch(&[rows, cols], &[u.len(), w.len()]));
    }
    let mut u = u.to_vec();
    let mut sigma = 0.0;
    for _ in 0..iterations {
        let v = normalize_l2(&matvec_transposed(w, rows, cols, &u), L2_EPSILON);
        let wv = matvec(w, rows, cols, &v);
        u = normalize_l2(&wv, L2_EPSILON);
        sigma = dot(&u, &wv);
    }
    Ok((sigma, u))
}

/// Lays a `[kh, kw, in, out]` kernel out as an `[out][kh * kw * in]` matrix,
/// one row per output channel.
pub fn kernel_matrix(kernel: &Tensor) -> LayerResult<(Vec<f32>, usize, usize)> {
    let (k_h, k_w, k_in, k_out) = kernel.dims4()?;
    let cols = k_h * k_w * k_in;
    let data = kernel.data();
    let mut mat = vec![0.0; k_out * cols];
    for (j, chunk) in data.chunks(k_out.max(1)).enumerate().take(cols) {
        for (o, value) in chunk.iter().enumerate() {
            mat[o * cols + j] = *value;
        }
    }
    Ok((mat, k_out, cols))
}

enum SpectralState {
    Uninitialized,
    Initialized {
        kernel_orig: Parameter,
        u: Parameter,
    },
}

/// Spectral normalization around a convolution `C`.
///
/// The first [`apply`](SpectralNorm::apply) builds the kernel from the input's
/// channel count; that transition happens once per instance.
pub struct SpectralNorm<C> {
    layer: C,
    power_iterations: usize,
    state: SpectralState,
    rng: StdRng,
}

impl<C: Convolution> SpectralNorm<C> {
    pub fn new(layer: C) -> Self {
        SpectralNorm {
            layer,
            power_iterations: 1,
            state: SpectralState::Uninitialized,
            rng: layer_rng(None, 0),
        }
    }

    pub fn with_power_iterations(mut self, iterations: usize) -> LayerResult<Self> {
        if iterations == 0 {
            return Err(LayerError::config(format!(
                "`{}` needs at least one power iteration",
                self.layer.name()
            )));
        }
        self.power_iterations = iterations;
        Ok(self)
    }

    pub fn with_seed(mut self, seed: Option<u64>, stream: u64) -> Self {
        self.rng = layer_rng(seed, stream);
        self
    }

    pub fn layer(&self) -> &C {
        &self.layer
    }

    pub fn power_iterations(&self) -> usize {
        self.power_iterations
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, SpectralState::Initialized { .. })
    }

    pub fn kernel_orig(&self) -> Option<&Parameter> {
        match &self.state {
            SpectralState::Initialized { kernel_orig, .. } => Some(kernel_orig),
            SpectralState::Uninitialized => None,
        }
    }

    pub fn singular_vector(&self) -> Option<&[f32]> {
        match &self.state {
            SpectralState::Initialized { u, .. } => Some(u.value().data()),
            SpectralState::Uninitialized => None,
        }
    }

    /// Convolves `x` with the spectrally normalized kernel.
    pub fn apply(&mut self, x: &Tensor, training: bool) -> LayerResult<Tensor> {
        if !self.is_initialized() {
            self.initialize(x)?;
        }
        let kernel = self.normalize_weights(training)?;
        self.layer.convolve(x, &kernel)
    }

    fn initialize(&mut self, x: &Tensor) -> LayerResult<()> {
        let (_, _, _, in_channels) = x.dims4()?;
        let kernel = self.layer.initial_kernel(in_channels)?;
        let filters = self.layer.filters();
        let u = random_normal(filters, U_INIT_STDDEV, &mut self.rng)?;
        let name = self.layer.name();
        debug!(
            layer = name,
            filters,
            in_channels,
            power_iterations = self.power_iterations,
            "spectral normalization initialised"
        );
        self.state = SpectralState::Initialized {
            kernel_orig: Parameter::trainable(scoped(name, "kernel_orig"), kernel),
            u: Parameter::frozen(scoped(name, "u"), Tensor::new(vec![filters], u)?),
        };
        Ok(())
    }

    /// Returns `kernel_orig / sigma`. The singular vector estimate is stored
    /// only when `training` is set.
    pub fn normalize_weights(&mut self, training: bool) -> LayerResult<Tensor> {
        let power_iterations = self.power_iterations;
        let SpectralState::Initialized { kernel_orig, u } = &mut self.state else {
            return Err(LayerError::NotInitialized(self.layer.name().to_string()));
        };
        let (w, rows, cols) = kernel_matrix(kernel_orig.value())?;
        let (sigma, u_new) = power_iteration(&w, rows, cols, u.value().data(), power_iterations)?;
        trace!(layer = kernel_orig.name(), sigma, training, "spectral norm estimate");
        if training {
            u.assign_data(u_new)?;
        }
        Ok(kernel_orig.value().scale(1.0 / sigma))
    }
}

impl<C: Convolution> Parameterized for SpectralNorm<C> {
    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = Vec::new();
        if let SpectralState::Initialized { kernel_orig, u } = &self.state {
            params.push(kernel_orig);
            params.push(u);
        }
        params.extend(self.layer.bias());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = Vec::new();
        if let SpectralState::Initialized { kernel_orig, u } = &mut self.state {
            params.push(kernel_orig);
            params.push(u);
        }
        params.extend(self.layer.bias_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conv::Conv2d;
    use crate::ops::Padding;
    use proptest::prelude::*;

    /// Largest singular value of a 2x2 matrix in closed form.
    fn sigma_max_2x2(m: &[f32; 4]) -> f32 {
        let frob = m.iter().map(|x| x * x).sum::<f32>();
        let det = m[0] * m[3] - m[1] * m[2];
        ((frob + (frob * frob - 4.0 * det * det).max(0.0).sqrt()) / 2.0).sqrt()
    }

    /// Eigenvalues of a symmetric `n x n` matrix by cyclic Jacobi rotations.
    fn symmetric_eigenvalues(mut a: Vec<f64>, n: usize) -> Vec<f64> {
        for _ in 0..64 {
            let off: f64 = (0..n)
                .flat_map(|p| (0..n).filter(move |q| *q != p).map(move |q| (p, q)))
                .map(|(p, q)| a[p * n + q].powi(2))
                .sum();
            if off < 1e-24 {
                break;
            }
            for p in 0..n {
                for q in p + 1..n {
                    let apq = a[p * n + q];
                    if apq.abs() < 1e-300 {
                        continue;
                    }
                    let theta = (a[q * n + q] - a[p * n + p]) / (2.0 * apq);
                    let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                    let c = 1.0 / (t * t + 1.0).sqrt();
                    let s = t * c;
                    for k in 0..n {
                        let (akp, akq) = (a[k * n + p], a[k * n + q]);
                        a[k * n + p] = c * akp - s * akq;
                        a[k * n + q] = s * akp + c * akq;
                    }
                    for k in 0..n {
                        let (apk, aqk) = (a[p * n + k], a[q * n + k]);
                        a[p * n + k] = c * apk - s * aqk;
                        a[q * n + k] = s * apk + c * aqk;
                    }
                }
            }
        }
        (0..n).map(|i| a[i * n + i]).collect()
    }

    /// Largest singular value of `w: [rows][cols]` from the eigenvalues of `WᵀW`.
    fn sigma_max(w: &[f32], rows: usize, cols: usize) -> f32 {
        let mut gram = vec![0.0f64; cols * cols];
        for i in 0..cols {
            for j in 0..cols {
                gram[i * cols + j] = (0..rows)
                    .map(|r| f64::from(w[r * cols + i]) * f64::from(w[r * cols + j]))
                    .sum();
            }
        }
        let largest = symmetric_eigenvalues(gram, cols)
            .into_iter()
            .fold(0.0f64, f64::max);
        largest.sqrt() as f32
    }

    fn sn_conv(filters: usize, kernel: (usize, usize), seed: u64) -> SpectralNorm<Conv2d> {
        let conv = Conv2d::new("sn", filters, kernel)
            .with_padding(Padding::Same)
            .with_seed(Some(seed), 0);
        SpectralNorm::new(conv).with_seed(Some(seed), 1)
    }

    fn sample_input(shape: &[usize]) -> LayerResult<Tensor> {
        let len = shape.iter().product::<usize>();
        let data = (0..len).map(|i| ((i * 37 % 19) as f32 - 9.0) / 7.0).collect();
        Tensor::new(shape.to_vec(), data)
    }

    #[test]
    fn power_iteration_converges_to_largest_singular_value() -> LayerResult<()> {
        let matrices = [[2.0, 1.0, 1.0, 3.0], [4.0, 0.0, 3.0, -2.0], [0.5, -1.5, 2.5, 1.0]];
        let mut rng = layer_rng(Some(42), 0);
        for m in matrices.iter() {
            let u0 = random_normal(2, 1.0, &mut rng)?;
            let (sigma, u) = power_iteration(m, 2, 2, &u0, 30)?;
            let expected = sigma_max_2x2(m);
            assert!(
                (sigma - expected).abs() < 1e-3,
                "sigma {sigma} vs expected {expected}"
            );
            let norm = u.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn power_iteration_converges_on_non_square_matrices() -> LayerResult<()> {
        let wide: Vec<f32> = vec![
            3.0, 1.0, 0.0, 2.0, -1.0, //
            1.0, -2.0, 1.0, 0.0, 0.5, //
            0.0, 1.0, 4.0, -1.0, 2.0,
        ];
        let tall: Vec<f32> = (0..5 * 3)
            .map(|i| ((i * 7 % 11) as f32 - 5.0) / 3.0)
            .collect();
        let mut rng = layer_rng(Some(17), 0);
        for (w, rows, cols) in [(&wide, 3, 5), (&tall, 5, 3)] {
            let expected = sigma_max(w, rows, cols);
            let u0 = random_normal(rows, 1.0, &mut rng)?;
            let (sigma, u) = power_iteration(w, rows, cols, &u0, 100)?;
            assert!(
                (sigma - expected).abs() < 1e-3,
                "{rows}x{cols}: sigma {sigma} vs expected {expected}"
            );
            assert_eq!(u.len(), rows);
        }
        Ok(())
    }

    #[test]
    fn kernel_sigma_matches_eigenvalue_reference() -> LayerResult<()> {
        // [1, 1, 5, 3] lays out as a 3x5 matrix
        let data = (0..15).map(|i| ((i * 5 % 13) as f32 - 6.0) / 4.0).collect();
        let kernel = Tensor::new(vec![1, 1, 5, 3], data)?;
        let (w, rows, cols) = kernel_matrix(&kernel)?;
        assert_eq!((rows, cols), (3, 5));
        let (sigma, _) = power_iteration(&w, rows, cols, &[1.0, 0.5, -0.25], 100)?;
        let expected = sigma_max(&w, rows, cols);
        assert!((sigma - expected).abs() < 1e-3, "sigma {sigma} vs expected {expected}");
        Ok(())
    }

    #[test]
    fn rank_one_matrix_converges_in_one_step() -> LayerResult<()> {
        // a bᵀ with |a| = 3, |b| = 2
        let a = [1.0, 2.0, 2.0];
        let b = [0.0, 2.0];
        let w: Vec<f32> = a.iter().flat_map(|ai| b.iter().map(move |bj| ai * bj)).collect();
        let (sigma, _) = power_iteration(&w, 3, 2, &[1.0, 0.0, 0.0], 1)?;
        assert!((sigma - 6.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn zero_iterations_are_rejected() {
        assert!(power_iteration(&[1.0], 1, 1, &[1.0], 0).is_err());
        let conv = Conv2d::new("sn", 2, (1, 1));
        assert!(SpectralNorm::new(conv).with_power_iterations(0).is_err());
        assert_eq!(SpectralNorm::new(Conv2d::new("sn", 2, (1, 1))).power_iterations(), 1);
    }

    #[test]
    fn zero_vector_normalizes_to_zero() {
        assert_eq!(normalize_l2(&[0.0; 4], L2_EPSILON), vec![0.0; 4]);
    }

    proptest! {
        #[test]
        fn normalize_l2_yields_unit_norm(v in prop::collection::vec(-100.0f32..100.0, 1..32)) {
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            prop_assume!(norm > 1e-3);
            let n = normalize_l2(&v, L2_EPSILON);
            let out_norm = n.iter().map(|x| x * x).sum::<f32>().sqrt();
            prop_assert!((out_norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn kernel_matrix_puts_output_channels_on_rows() -> LayerResult<()> {
        // [1, 1, 2, 3]: in-channel 0 -> [1, 2, 3], in-channel 1 -> [4, 5, 6]
        let kernel = Tensor::new(vec![1, 1, 2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        let (mat, rows, cols) = kernel_matrix(&kernel)?;
        assert_eq!((rows, cols), (3, 2));
        assert_eq!(mat, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        Ok(())
    }

    #[test]
    fn normalize_weights_requires_initialization() {
        let mut sn = sn_conv(4, (3, 3), 0);
        assert!(matches!(
            sn.normalize_weights(true),
            Err(LayerError::NotInitialized(_))
        ));
        assert!(sn.parameters().is_empty());
    }

    #[test]
    fn first_apply_initializes_once() -> LayerResult<()> {
        let mut sn = sn_conv(4, (3, 3), 5);
        let x = sample_input(&[2, 4, 4, 3])?;
        let out = sn.apply(&x, true)?;
        assert_eq!(out.shape(), &[2, 4, 4, 4]);
        assert!(sn.is_initialized());
        let orig = sn.kernel_orig().map(|p| p.value().clone());
        assert_eq!(orig.as_ref().map(|k| k.shape().to_vec()), Some(vec![3, 3, 3, 4]));

        sn.apply(&x, true)?;
        // the raw kernel is only changed by the caller, never by a forward pass
        assert_eq!(sn.kernel_orig().map(|p| p.value().clone()), orig);
        let names: Vec<&str> = sn.parameters().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["sn/kernel_orig", "sn/u"]);
        assert_eq!(sn.trainable_parameters().len(), 1);
        Ok(())
    }

    #[test]
    fn inference_is_bit_identical_and_leaves_u_alone() -> LayerResult<()> {
        let mut sn = sn_conv(3, (3, 3), 9);
        let x = sample_input(&[1, 6, 6, 2])?;
        sn.apply(&x, true)?;
        let u_before = sn.singular_vector().map(|u| u.to_vec());
        let first = sn.apply(&x, false)?;
        let second = sn.apply(&x, false)?;
        assert_eq!(first, second);
        assert_eq!(sn.singular_vector().map(|u| u.to_vec()), u_before);
        Ok(())
    }

    #[test]
    fn training_updates_u() -> LayerResult<()> {
        let mut sn = sn_conv(3, (1, 1), 4);
        let x = sample_input(&[1, 2, 2, 5])?;
        sn.apply(&x, false)?;
        let u_before = sn.singular_vector().map(|u| u.to_vec());
        sn.apply(&x, true)?;
        assert_ne!(sn.singular_vector().map(|u| u.to_vec()), u_before);
        Ok(())
    }

    #[test]
    fn normalized_kernel_has_unit_spectral_norm() -> LayerResult<()> {
        let mut sn = sn_conv(8, (3, 3), 13).with_power_iterations(1)?;
        let x = sample_input(&[1, 4, 4, 4])?;
        // warm up the stored singular vector
        for _ in 0..30 {
            sn.apply(&x, true)?;
        }
        let kernel = sn.normalize_weights(false)?;
        let (w, rows, cols) = kernel_matrix(&kernel)?;
        let start = vec![1.0; rows];
        let (sigma, _) = power_iteration(&w, rows, cols, &start, 200)?;
        assert!(sigma <= 1.0 + 1e-3, "sigma {sigma}");
        assert!(sigma > 0.99, "sigma {sigma}");
        Ok(())
    }

    #[test]
    fn bias_is_untouched_by_normalization() -> LayerResult<()> {
        let conv = Conv2d::new("sn", 2, (1, 1)).with_bias().with_seed(Some(2), 0);
        let mut sn = SpectralNorm::new(conv).with_seed(Some(2), 1);
        if let Some(bias) = sn.parameters_mut().into_iter().find(|p| p.name() == "sn/bias") {
            bias.assign(Tensor::new(vec![2], vec![0.25, -0.5])?)?;
        }
        sn.apply(&Tensor::zeros(&[1, 2, 2, 3]), true)?;
        let bias = sn.layer().bias().map(|b| b.value().data().to_vec());
        assert_eq!(bias, Some(vec![0.25, -0.5]));
        assert_eq!(sn.parameters().len(), 3);
        Ok(())
    }
}

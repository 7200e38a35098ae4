//! Teacher-student self-distillation
//!
//! The student sees every crop of a clip, the teacher only the global ones.
//! Teacher outputs are centered and sharpened before serving as soft targets,
//! which keeps the pair from collapsing onto a single prototype.
//!
//! ## Features
//!
//! - **Multi-crop cross-entropy**: every global teacher crop supervises every other student crop
//! - **Two-token pairing**: fixed stream-to-crop assignment for networks with two output tokens
//! - **Distributed centering**: the running center is updated from the all-reduced batch mean
//!
//! ## Example
//!
//! ```
//! use destilar::distill::{DinoLoss, DinoLossConfig};
//! use ndarray::Array2;
//!
//! let loss_fn = DinoLoss::new(DinoLossConfig {
//!     out_dim: 8,
//!     n_crops: 2,
//!     epochs: 1,
//!     ..DinoLossConfig::default()
//! })
//! .unwrap();
//! let student = Array2::<f32>::zeros((4, 8));
//! let teacher = Array2::<f32>::zeros((4, 8));
//! let out = loss_fn.compute(&[student], &[teacher], 0).unwrap();
//! assert!((out.loss - 8f32.ln()).abs() < 1e-5);
//! ```

mod loss;


pub use loss::{DinoLoss, DinoLossConfig, DinoLossState, LossOutput, LossVariant};

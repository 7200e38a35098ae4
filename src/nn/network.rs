//! Backbone contract consumed by the training loop

use super::state::{apply_state, collect_state, LoadReport, StateDict};
use super::Tensor;
use crate::error::Result;
use ndarray::{Array2, Array3, Array4, Array5};

/// Whether a forward pass keeps activations for a later backward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradMode {
    Record,
    Inference,
}

/// Handle to a recorded forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapeId(pub usize);

/// Per-token visibility for one view, `(batch * frames, grid_h, grid_w)`, `true` = hidden
pub type TokenMask = Array3<bool>;

/// Logits of every output stream for a list of views
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// One `(views * batch, out_dim)` matrix per stream, view-major rows
    pub streams: Vec<Array2<f32>>,
    pub tape: Option<TapeId>,
}

/// Teacher-style forward with attention capture
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    pub streams: Vec<Array2<f32>>,
    /// One `(batch * frames, heads, tokens + 1, tokens + 1)` map per view
    pub attentions: Vec<Array4<f32>>,
}

/// Masked-modeling reconstruction result
#[derive(Debug, Clone)]
pub struct MaskedOutput {
    pub loss: f32,
    pub hidden_tokens: usize,
    pub tape: Option<TapeId>,
}

/// Upstream gradient for a recorded forward
#[derive(Debug, Clone)]
pub enum Seed {
    /// d(loss)/d(logits), one matrix per stream
    Logits { tape: TapeId, grads: Vec<Array2<f32>> },
    /// d(loss)/d(masked-modeling loss)
    Scalar { tape: TapeId, grad: f32 },
}

/// A trainable video backbone with a projection head.
///
/// Implementations record the activations of `GradMode::Record` passes on an
/// internal tape; `backward` consumes every seeded record and accumulates
/// parameter gradients, so several forwards can contribute to one step.
pub trait Network: Send {
    /// Registered architecture name
    fn arch(&self) -> &str;

    /// Number of output streams (two for dual-token backbones)
    fn num_streams(&self) -> usize;

    fn patch_size(&self) -> usize;

    fn out_dim(&self) -> usize;

    /// Networks with batch statistics need them synchronized across workers
    fn has_batch_norm(&self) -> bool {
        false
    }

    /// Parameter names in iteration order
    fn parameter_names(&self) -> &[String];

    fn parameters(&self) -> &[Tensor];

    fn parameters_mut(&mut self) -> &mut [Tensor];

    fn forward(&mut self, views: &[Array5<f32>], mode: GradMode) -> Result<ForwardOutput>;

    /// Inference forward that also returns the last attention maps
    fn forward_with_attention(&self, views: &[Array5<f32>]) -> Result<AttentionOutput>;

    /// Reconstruct hidden patches of each view; the loss averages over hidden tokens
    fn masked_modeling(
        &mut self,
        views: &[Array5<f32>],
        masks: &[TokenMask],
        mode: GradMode,
    ) -> Result<MaskedOutput>;

    /// Accumulate parameter gradients for the seeded records and drop them
    fn backward(&mut self, seeds: &[Seed]) -> Result<()>;

    /// Discard recorded activations without a backward
    fn clear_tape(&mut self);

    fn zero_grad(&mut self) {
        for p in self.parameters_mut() {
            p.zero_grad();
        }
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(Tensor::len).sum()
    }

    fn state_dict(&self) -> StateDict {
        collect_state(self.parameter_names(), self.parameters())
    }

    fn load_state_dict(&mut self, dict: &StateDict, strict: bool) -> Result<LoadReport> {
        let names = self.parameter_names().to_vec();
        apply_state(&names, self.parameters_mut(), dict, strict)
    }
}

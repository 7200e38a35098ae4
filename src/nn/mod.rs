//! Networks: parameter tensors, the backbone contract and the reference ViT

mod network;
pub mod ops;
mod registry;
mod state;
mod tensor;
mod vit;

pub use network::{
    AttentionOutput, ForwardOutput, GradMode, MaskedOutput, Network, Seed, TapeId, TokenMask,
};
pub use registry::{verify_pairing, ArchRegistry, BuildOptions, Factory};
pub use state::{apply_state, collect_state, strip_prefix, LoadReport, StateDict, TensorRecord};
pub use tensor::Tensor;
pub use vit::{sincos_position, VisionTransformer, VitConfig};

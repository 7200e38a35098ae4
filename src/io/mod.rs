//! Weight I/O
//!
//! Parameters are exchanged as safetensors files: the trained teacher is
//! exported at the end of a run, and pretrained weights are imported from
//! safetensors or from a previous run's checkpoint.

mod load;
mod save;

#[cfg(test)]
mod tests;

pub use load::{load_pretrained, load_safetensors};
pub use save::{export_network, save_safetensors, WeightsMetadata};

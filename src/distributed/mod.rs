//! Multi-worker coordination
//!
//! Workers exchange data through a [`Collective`]. The helpers here give
//! data-parallel semantics on top of it: parameters broadcast from rank 0 at
//! start, gradients averaged after every backward pass.

mod collective;

pub use collective::{Collective, SingleProcess, ThreadGroup};

use crate::error::Result;
use crate::nn::Tensor;
use ndarray::Array1;

/// Overwrite every parameter with the copy held by `root`
pub fn broadcast_parameters(collective: &dyn Collective, params: &mut [Tensor], root: usize) -> Result<()> {
    if collective.world_size() == 1 {
        return Ok(());
    }
    let mut flat: Vec<f32> = params.iter().flat_map(|p| p.data().iter().copied()).collect();
    collective.broadcast(&mut flat, root)?;
    let mut offset = 0;
    for p in params.iter_mut() {
        let n = p.len();
        p.data_mut()
            .iter_mut()
            .zip(&flat[offset..offset + n])
            .for_each(|(d, s)| *d = *s);
        offset += n;
    }
    Ok(())
}

/// Average gradients over workers.
///
/// Trainable parameters without a gradient contribute zeros so that every
/// worker sends a buffer of the same length.
pub fn sync_gradients(collective: &dyn Collective, params: &mut [Tensor]) -> Result<()> {
    let world = collective.world_size();
    if world == 1 {
        return Ok(());
    }
    let mut flat = Vec::new();
    for p in params.iter().filter(|p| p.requires_grad()) {
        match p.grad() {
            Some(g) => flat.extend(g.iter().copied()),
            None => flat.extend(std::iter::repeat(0.0).take(p.len())),
        }
    }
    collective.all_reduce_sum(&mut flat)?;
    let scale = 1.0 / world as f32;
    let mut offset = 0;
    for p in params.iter_mut().filter(|p| p.requires_grad()) {
        let n = p.len();
        let g = flat[offset..offset + n].iter().map(|v| v * scale).collect::<Array1<f32>>();
        p.set_grad(g);
        offset += n;
    }
    Ok(())
}

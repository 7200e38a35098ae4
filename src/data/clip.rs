//! Views, samples and collated batches

use crate::error::{Error, Result};
use ndarray::{stack, Array2, Array3, Array4, Array5, ArrayView4, Axis};

/// One video clip or view, `(channels, frames, height, width)`
pub type Clip = Array4<f32>;

/// Everything the dataset yields for one index
#[derive(Debug, Clone)]
pub struct Sample {
    /// Global crops first, then local crops
    pub views: Vec<Clip>,
    /// Tube mask per view, `(frames, tokens)`, `true` = hidden
    pub masks: Vec<Array2<bool>>,
    /// Optical flow, `(flow_frames, 2, height, width)`
    pub flow: Option<Array4<f32>>,
    pub index: usize,
}

/// A collated mini-batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// One `(batch, channels, frames, height, width)` array per view
    pub views: Vec<Array5<f32>>,
    /// One `(batch, frames, tokens)` tube mask per view
    pub masks: Vec<Array3<bool>>,
    /// `(batch, flow_frames, 2, height, width)`
    pub flow: Option<Array5<f32>>,
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_flow_frames(&self) -> usize {
        self.flow.as_ref().map_or(0, |f| f.len_of(Axis(1)))
    }

    /// Single-frame view `(batch, 2, 1, height, width)` of flow frame `frame`
    pub fn flow_view(&self, frame: usize) -> Result<Array5<f32>> {
        let flow = self
            .flow
            .as_ref()
            .ok_or_else(|| Error::Data("batch carries no optical flow".to_string()))?;
        if frame >= flow.len_of(Axis(1)) {
            return Err(Error::Data(format!(
                "flow frame {frame} out of range ({} frames)",
                flow.len_of(Axis(1))
            )));
        }
        Ok(flow.index_axis(Axis(1), frame).insert_axis(Axis(2)).to_owned())
    }
}

fn stack_views<'a>(what: &str, views: Vec<ArrayView4<'a, f32>>) -> Result<Array5<f32>> {
    stack(Axis(0), &views).map_err(|e| Error::Data(format!("cannot stack {what}: {e}")))
}

/// Stack samples along a new leading batch axis
pub fn collate(samples: Vec<Sample>) -> Result<Batch> {
    let first = samples
        .first()
        .ok_or_else(|| Error::Data("cannot collate an empty batch".to_string()))?;
    let n_views = first.views.len();
    let has_flow = first.flow.is_some();
    if samples
        .iter()
        .any(|s| s.views.len() != n_views || s.masks.len() != n_views || s.flow.is_some() != has_flow)
    {
        return Err(Error::Data("samples disagree on view layout".to_string()));
    }

    let mut views = Vec::with_capacity(n_views);
    let mut masks = Vec::with_capacity(n_views);
    for v in 0..n_views {
        views.push(stack_views(
            "views",
            samples.iter().map(|s| s.views[v].view()).collect(),
        )?);
        let m: Vec<_> = samples.iter().map(|s| s.masks[v].view()).collect();
        masks.push(stack(Axis(0), &m).map_err(|e| Error::Data(format!("cannot stack masks: {e}")))?);
    }
    let flow = if has_flow {
        Some(stack_views(
            "flow",
            samples.iter().filter_map(|s| s.flow.as_ref().map(|f| f.view())).collect(),
        )?)
    } else {
        None
    };
    Ok(Batch {
        views,
        masks,
        flow,
        indices: samples.iter().map(|s| s.index).collect(),
    })
}

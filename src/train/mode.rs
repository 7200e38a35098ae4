//! Per-iteration computations of the training modes

use crate::data::Batch;
use crate::distill::DinoLoss;
use crate::distributed::Collective;
use crate::error::{Error, Result};
use crate::masking::{cls_attention, frame_mean, local_masks, AttentionGuidedMasker};
use crate::nn::{GradMode, Network, Seed, TapeId};
use crate::optim::Optimizer;
use ndarray::Array5;
use rand::rngs::StdRng;
use rand::seq::index::sample;

/// Optical-flow student/teacher pair of two-stream training
pub struct MotionStreams {
    pub student: Box<dyn Network>,
    pub teacher: Box<dyn Network>,
    pub optimizer: Box<dyn Optimizer>,
    /// Flow student against flow teacher
    pub motion_loss: DinoLoss,
    /// Second RGB stream against flow teacher
    pub cross_loss: DinoLoss,
}

/// Which losses an iteration computes, chosen once per session
pub enum TrainingMode {
    /// Distillation over all crops plus masked modeling on attention-guided
    /// global masks and tube-masked local views
    AttentionGuided {
        masker: AttentionGuidedMasker,
        global_crops: usize,
    },
    /// Dual-token student on local crops, teacher on global crops
    TwoToken { global_crops: usize },
    /// RGB distillation, flow distillation and RGB-to-flow cross distillation
    TwoStream(Box<MotionStreams>),
}

/// Borrowed session state for one iteration
pub struct IterationContext<'a> {
    pub student: &'a mut dyn Network,
    pub teacher: &'a mut dyn Network,
    pub dino_loss: &'a mut DinoLoss,
    pub collective: &'a dyn Collective,
    pub rng: &'a mut StdRng,
    pub epoch: usize,
}

/// Losses of one iteration and the gradients that seed the backward passes
#[derive(Debug)]
pub struct IterationOutput {
    /// Sum of every loss term
    pub loss: f32,
    /// Named loss terms for the metric logger
    pub components: Vec<(&'static str, f32)>,
    pub student_seeds: Vec<Seed>,
    /// Seeds of the flow student (two-stream only)
    pub motion_seeds: Vec<Seed>,
}

fn recorded(tape: Option<TapeId>) -> Result<TapeId> {
    tape.ok_or_else(|| Error::InvalidParameter("forward pass was not recorded".to_string()))
}

fn split_views(batch: &Batch, global_crops: usize) -> Result<(&[Array5<f32>], &[Array5<f32>])> {
    if batch.views.len() < global_crops {
        return Err(Error::Data(format!(
            "batch has {} views, {global_crops} global crops expected",
            batch.views.len()
        )));
    }
    Ok(batch.views.split_at(global_crops))
}

impl TrainingMode {
    pub fn name(&self) -> &'static str {
        match self {
            TrainingMode::AttentionGuided { .. } => "attention_guided",
            TrainingMode::TwoToken { .. } => "two_token",
            TrainingMode::TwoStream(_) => "two_stream",
        }
    }

    pub fn motion(&self) -> Option<&MotionStreams> {
        match self {
            TrainingMode::TwoStream(m) => Some(m),
            _ => None,
        }
    }

    pub fn motion_mut(&mut self) -> Option<&mut MotionStreams> {
        match self {
            TrainingMode::TwoStream(m) => Some(m),
            _ => None,
        }
    }

    /// Forward the networks on `batch` and evaluate the mode's losses.
    ///
    /// Loss centers are updated here; parameters are not touched.
    pub fn compute_iteration(&mut self, batch: &Batch, ctx: IterationContext<'_>) -> Result<IterationOutput> {
        match self {
            TrainingMode::AttentionGuided {
                masker,
                global_crops,
            } => attention_guided(masker, *global_crops, batch, ctx),
            TrainingMode::TwoToken { global_crops } => two_token(*global_crops, batch, ctx),
            TrainingMode::TwoStream(motion) => two_stream(motion, batch, ctx),
        }
    }
}

fn attention_guided(
    masker: &AttentionGuidedMasker,
    global_crops: usize,
    batch: &Batch,
    ctx: IterationContext<'_>,
) -> Result<IterationOutput> {
    let (global, local) = split_views(batch, global_crops)?;
    let teacher_out = ctx.teacher.forward_with_attention(global)?;
    let patch = ctx.student.patch_size();

    let mut global_masks = Vec::with_capacity(global.len());
    for (view, attention) in global.iter().zip(&teacher_out.attentions) {
        let (_, _, _, h, w) = view.dim();
        let cls = cls_attention(attention, batch.len())?;
        let scores = frame_mean(&cls)?;
        let guided = masker.compute_global_mask(
            &scores,
            cls.dim().1,
            (h / patch, w / patch),
            &mut *ctx.rng,
        )?;
        global_masks.push(guided.mask);
    }
    let mim_global = ctx
        .student
        .masked_modeling(global, &global_masks, GradMode::Record)?;

    let mut student_seeds = vec![Seed::Scalar {
        tape: recorded(mim_global.tape)?,
        grad: 1.0,
    }];
    let mut mim_local_loss = 0.0;
    if let Some(first) = local.first() {
        let (_, _, _, h, w) = first.dim();
        let masks = local_masks(&batch.masks[global_crops..], (h / patch, w / patch))?;
        let mim_local = ctx.student.masked_modeling(local, &masks, GradMode::Record)?;
        mim_local_loss = mim_local.loss;
        student_seeds.push(Seed::Scalar {
            tape: recorded(mim_local.tape)?,
            grad: 1.0,
        });
    }

    let student_out = ctx.student.forward(&batch.views, GradMode::Record)?;
    let dino = ctx
        .dino_loss
        .forward(&student_out.streams, &teacher_out.streams, ctx.epoch, ctx.collective)?;
    student_seeds.push(Seed::Logits {
        tape: recorded(student_out.tape)?,
        grads: dino.student_grads,
    });

    Ok(IterationOutput {
        loss: dino.loss + mim_global.loss + mim_local_loss,
        components: vec![
            ("loss_dino", dino.loss),
            ("loss_MIM_global", mim_global.loss),
            ("loss_MIM_local", mim_local_loss),
        ],
        student_seeds,
        motion_seeds: Vec::new(),
    })
}

fn two_token(global_crops: usize, batch: &Batch, ctx: IterationContext<'_>) -> Result<IterationOutput> {
    let (global, local) = split_views(batch, global_crops)?;
    if local.is_empty() {
        return Err(Error::Data("two-token training needs local crops".to_string()));
    }
    let teacher_out = ctx.teacher.forward(global, GradMode::Inference)?;
    let student_out = ctx.student.forward(local, GradMode::Record)?;
    let dino = ctx
        .dino_loss
        .forward(&student_out.streams, &teacher_out.streams, ctx.epoch, ctx.collective)?;
    Ok(IterationOutput {
        loss: dino.loss,
        components: vec![("loss_dino", dino.loss)],
        student_seeds: vec![Seed::Logits {
            tape: recorded(student_out.tape)?,
            grads: dino.student_grads,
        }],
        motion_seeds: Vec::new(),
    })
}

fn two_stream(motion: &mut MotionStreams, batch: &Batch, ctx: IterationContext<'_>) -> Result<IterationOutput> {
    let (global, _) = split_views(batch, 2)?;
    let frames = batch.num_flow_frames();
    if frames < 2 {
        return Err(Error::Data(format!(
            "two-stream training needs 2 flow frames, batch has {frames}"
        )));
    }
    let flow_views = sample(&mut *ctx.rng, frames, 2)
        .into_iter()
        .map(|f| batch.flow_view(f))
        .collect::<Result<Vec<_>>>()?;

    let student_out = ctx.student.forward(&batch.views, GradMode::Record)?;
    if student_out.streams.len() < 2 {
        return Err(Error::ArchitectureMismatch(
            "two-stream training needs a student with 2 output streams".to_string(),
        ));
    }
    let teacher_out = ctx.teacher.forward(global, GradMode::Inference)?;
    let teacher_flow = motion.teacher.forward(&flow_views, GradMode::Inference)?;
    let student_flow = motion.student.forward(&flow_views, GradMode::Record)?;

    let dino = ctx.dino_loss.forward(
        &student_out.streams[..1],
        &teacher_out.streams[..1],
        ctx.epoch,
        ctx.collective,
    )?;
    let motion_out = motion.motion_loss.forward(
        &student_flow.streams,
        &teacher_flow.streams,
        ctx.epoch,
        ctx.collective,
    )?;
    let cross = motion.cross_loss.forward(
        &student_out.streams[1..2],
        &teacher_flow.streams,
        ctx.epoch,
        ctx.collective,
    )?;

    let mut rgb_grads = dino.student_grads;
    rgb_grads.extend(cross.student_grads);
    Ok(IterationOutput {
        loss: dino.loss + motion_out.loss + cross.loss,
        components: vec![
            ("loss_dino", dino.loss),
            ("loss_motion", motion_out.loss),
            ("loss_cross", cross.loss),
        ],
        student_seeds: vec![Seed::Logits {
            tape: recorded(student_out.tape)?,
            grads: rgb_grads,
        }],
        motion_seeds: vec![Seed::Logits {
            tape: recorded(student_flow.tape)?,
            grads: motion_out.student_grads,
        }],
    })
}

/// Multiply the upstream gradients of `seeds` by the loss scale
pub fn scale_seeds(seeds: Vec<Seed>, factor: f32) -> Vec<Seed> {
    seeds
        .into_iter()
        .map(|seed| match seed {
            Seed::Logits { tape, grads } => Seed::Logits {
                tape,
                grads: grads.into_iter().map(|g| g * factor).collect(),
            },
            Seed::Scalar { tape, grad } => Seed::Scalar {
                tape,
                grad: grad * factor,
            },
        })
        .collect()
}

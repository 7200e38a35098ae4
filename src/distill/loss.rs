//! Center-based multi-crop distillation loss

use crate::distributed::Collective;
use crate::error::{Error, Result};
use crate::nn::ops::{log_softmax_rows, softmax_rows};
use crate::optim::TemperatureSchedule;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// How student crops are paired with teacher crops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossVariant {
    /// Every teacher global crop supervises every other student crop
    Standard,
    /// Two output streams with fixed pairing: stream 0 of the first teacher
    /// crop supervises the first `global_crops` student crops, stream 1 of
    /// the second teacher crop supervises the rest
    TwoToken,
}

/// Construction parameters of [`DinoLoss`]
#[derive(Debug, Clone, PartialEq)]
pub struct DinoLossConfig {
    pub out_dim: usize,
    /// Number of student crops in one forward
    pub n_crops: usize,
    pub global_crops: usize,
    pub warmup_teacher_temp: f64,
    pub teacher_temp: f64,
    pub warmup_teacher_temp_epochs: usize,
    pub epochs: usize,
    pub student_temp: f32,
    pub center_momentum: f32,
    pub variant: LossVariant,
}

impl Default for DinoLossConfig {
    fn default() -> Self {
        Self {
            out_dim: 65536,
            n_crops: 10,
            global_crops: 2,
            warmup_teacher_temp: 0.04,
            teacher_temp: 0.04,
            warmup_teacher_temp_epochs: 0,
            epochs: 101,
            student_temp: 0.1,
            center_momentum: 0.9,
            variant: LossVariant::Standard,
        }
    }
}

/// Result of one loss evaluation
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: f32,
    /// d(loss)/d(student logits), one matrix per student stream
    pub student_grads: Vec<Array2<f32>>,
    /// Number of (teacher crop, student crop) pairs averaged
    pub n_terms: usize,
}

/// Checkpointed state of [`DinoLoss`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DinoLossState {
    pub center: Vec<Vec<f32>>,
    pub center_momentum: f32,
    pub student_temp: f32,
    pub variant: LossVariant,
    pub teacher_temp_schedule: TemperatureSchedule,
}

/// Self-distillation loss with teacher centering and sharpening
///
/// The teacher's logits are centered by a running mean and sharpened by a
/// low temperature; the student is trained to match them with a
/// cross-entropy over every (teacher crop, student crop) pair except a crop
/// with itself.
///
/// # Formula
///
/// ```text
/// q_i  = softmax((t_i - c) / τ_t(epoch))
/// L    = 1/|P| Σ_{(i,v)∈P} mean_b Σ_k -q_i log softmax(s_v / τ_s)
/// c   ← m c + (1 - m) mean(t)          (mean over the global batch)
/// ```
///
/// # Example
///
/// ```
/// use destilar::distill::{DinoLoss, DinoLossConfig};
/// use destilar::distributed::SingleProcess;
/// use ndarray::Array2;
///
/// let mut loss_fn = DinoLoss::new(DinoLossConfig {
///     out_dim: 4,
///     n_crops: 3,
///     epochs: 10,
///     ..DinoLossConfig::default()
/// })
/// .unwrap();
/// let student = Array2::from_shape_fn((6, 4), |(i, j)| (i + j) as f32 * 0.1);
/// let teacher = Array2::from_shape_fn((4, 4), |(i, j)| (i * j) as f32 * 0.1);
///
/// let out = loss_fn.forward(&[student], &[teacher], 0, &SingleProcess).unwrap();
/// assert!(out.loss > 0.0);
/// assert_eq!(out.n_terms, 4);
/// ```
#[derive(Debug, Clone)]
pub struct DinoLoss {
    student_temp: f32,
    center_momentum: f32,
    n_crops: usize,
    global_crops: usize,
    variant: LossVariant,
    center: Array2<f32>,
    teacher_temp_schedule: TemperatureSchedule,
}

fn chunk(x: &Array2<f32>, parts: usize) -> Result<Vec<ArrayView2<'_, f32>>> {
    if parts == 0 || x.nrows() % parts != 0 {
        return Err(Error::ShapeMismatch {
            expected: vec![parts.max(1) * (x.nrows() / parts.max(1)).max(1), x.ncols()],
            got: x.shape().to_vec(),
        });
    }
    let rows = x.nrows() / parts;
    Ok((0..parts)
        .map(|i| x.slice(s![i * rows..(i + 1) * rows, ..]))
        .collect())
}

/// Batch-mean cross-entropy `mean_b Σ_k -q log p`
fn cross_entropy(q: &ArrayView2<'_, f32>, log_p: &ArrayView2<'_, f32>) -> f32 {
    let batch = q.nrows().max(1) as f32;
    (q * log_p).sum() * -1.0 / batch
}

impl DinoLoss {
    pub fn new(config: DinoLossConfig) -> Result<Self> {
        if config.student_temp <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "student_temp must be positive, got {}",
                config.student_temp
            )));
        }
        if !(0.0..1.0).contains(&config.center_momentum) {
            return Err(Error::InvalidParameter(format!(
                "center_momentum must be in [0, 1), got {}",
                config.center_momentum
            )));
        }
        if config.warmup_teacher_temp_epochs > config.epochs {
            return Err(Error::InvalidParameter(format!(
                "warmup_teacher_temp_epochs ({}) exceeds epochs ({})",
                config.warmup_teacher_temp_epochs, config.epochs
            )));
        }
        let (n_crops, global_crops, streams) = match config.variant {
            LossVariant::Standard => (config.n_crops, config.global_crops, 1),
            LossVariant::TwoToken => {
                if config.global_crops != 2 {
                    return Err(Error::InvalidParameter(format!(
                        "two-token loss needs exactly 2 teacher crops, got {}",
                        config.global_crops
                    )));
                }
                (config.n_crops, 2, 2)
            }
        };
        if n_crops == 0 || global_crops == 0 {
            return Err(Error::InvalidParameter("crop counts must be positive".to_string()));
        }
        Ok(Self {
            student_temp: config.student_temp,
            center_momentum: config.center_momentum,
            n_crops,
            global_crops,
            variant: config.variant,
            center: Array2::zeros((streams, config.out_dim)),
            teacher_temp_schedule: TemperatureSchedule::new(
                config.warmup_teacher_temp,
                config.teacher_temp,
                config.warmup_teacher_temp_epochs,
                config.epochs,
            ),
        })
    }

    pub fn center(&self) -> &Array2<f32> {
        &self.center
    }

    pub fn variant(&self) -> LossVariant {
        self.variant
    }

    /// Teacher temperature in effect at `epoch`
    pub fn teacher_temp(&self, epoch: usize) -> f32 {
        self.teacher_temp_schedule.at(epoch) as f32
    }

    /// Centered, sharpened teacher distribution of one stream
    fn teacher_probs(&self, teacher: &Array2<f32>, stream: usize, epoch: usize) -> Result<Array2<f32>> {
        if teacher.ncols() != self.center.ncols() {
            return Err(Error::ShapeMismatch {
                expected: vec![teacher.nrows(), self.center.ncols()],
                got: teacher.shape().to_vec(),
            });
        }
        let temp = self.teacher_temp(epoch);
        let centered = teacher - &self.center.row(stream);
        Ok(softmax_rows(&centered.mapv(|v| v / temp)))
    }

    fn check_student_width(&self, student: &Array2<f32>) -> Result<()> {
        if student.ncols() != self.center.ncols() {
            return Err(Error::ShapeMismatch {
                expected: vec![student.nrows(), self.center.ncols()],
                got: student.shape().to_vec(),
            });
        }
        Ok(())
    }

    /// Loss and student gradients; does not touch the center
    pub fn compute(
        &self,
        student: &[Array2<f32>],
        teacher: &[Array2<f32>],
        epoch: usize,
    ) -> Result<LossOutput> {
        match self.variant {
            LossVariant::Standard => self.compute_standard(student, teacher, epoch),
            LossVariant::TwoToken => self.compute_two_token(student, teacher, epoch),
        }
    }

    fn compute_standard(
        &self,
        student: &[Array2<f32>],
        teacher: &[Array2<f32>],
        epoch: usize,
    ) -> Result<LossOutput> {
        let (Some(student), Some(teacher)) = (student.first(), teacher.first()) else {
            return Err(Error::InvalidParameter("loss needs one student and one teacher stream".to_string()));
        };
        self.check_student_width(student)?;
        let scaled = student.mapv(|v| v / self.student_temp);
        let log_p = log_softmax_rows(&scaled);
        let p = log_p.mapv(f32::exp);
        let student_chunks = chunk(&log_p, self.n_crops)?;
        let q_all = self.teacher_probs(teacher, 0, epoch)?;
        let teacher_chunks = chunk(&q_all, self.global_crops)?;
        let batch = student_chunks[0].nrows();
        if teacher_chunks[0].nrows() != batch {
            return Err(Error::ShapeMismatch {
                expected: vec![self.global_crops * batch, student.ncols()],
                got: teacher.shape().to_vec(),
            });
        }

        let mut total = 0.0f32;
        let mut n_terms = 0usize;
        // Σ_{iq ≠ v} (p_v - q_iq), scaled after the count is known
        let mut grad = Array2::<f32>::zeros(student.raw_dim());
        for (iq, q) in teacher_chunks.iter().enumerate() {
            for (v, log_pv) in student_chunks.iter().enumerate() {
                if v == iq {
                    // a crop never supervises itself
                    continue;
                }
                total += cross_entropy(q, log_pv);
                n_terms += 1;
                let span = v * batch..(v + 1) * batch;
                let mut g = grad.slice_mut(s![span.clone(), ..]);
                g += &p.slice(s![span, ..]);
                g -= q;
            }
        }
        if n_terms == 0 {
            return Err(Error::InvalidParameter(
                "no (teacher, student) crop pairs to compare".to_string(),
            ));
        }
        let scale = 1.0 / (self.student_temp * batch as f32 * n_terms as f32);
        grad.mapv_inplace(|g| g * scale);
        Ok(LossOutput {
            loss: total / n_terms as f32,
            student_grads: vec![grad],
            n_terms,
        })
    }

    fn compute_two_token(
        &self,
        student: &[Array2<f32>],
        teacher: &[Array2<f32>],
        epoch: usize,
    ) -> Result<LossOutput> {
        if student.len() != 2 || teacher.len() != 2 {
            return Err(Error::InvalidParameter(format!(
                "two-token loss needs 2 student and 2 teacher streams, got {} and {}",
                student.len(),
                teacher.len()
            )));
        }
        for s in student {
            self.check_student_width(s)?;
        }
        let log_p: Vec<Array2<f32>> = student
            .iter()
            .map(|s| log_softmax_rows(&s.mapv(|v| v / self.student_temp)))
            .collect();
        let q: Vec<Array2<f32>> = teacher
            .iter()
            .enumerate()
            .map(|(i, t)| self.teacher_probs(t, i, epoch))
            .collect::<Result<_>>()?;
        let q0 = chunk(&q[0], self.global_crops)?;
        let q1 = chunk(&q[1], self.global_crops)?;
        let s0 = chunk(&log_p[0], self.n_crops)?;
        let s1 = chunk(&log_p[1], self.n_crops)?;
        let batch = s0[0].nrows();

        let mut grads = vec![
            Array2::<f32>::zeros(student[0].raw_dim()),
            Array2::<f32>::zeros(student[1].raw_dim()),
        ];
        let mut total = 0.0f32;
        for iv in 0..self.n_crops {
            let (stream, target, log_pv) = if iv < self.global_crops {
                (0, &q0[0], &s0[iv])
            } else {
                (1, &q1[1], &s1[iv])
            };
            if target.nrows() != batch {
                return Err(Error::ShapeMismatch {
                    expected: vec![self.global_crops * batch, target.ncols()],
                    got: teacher[stream].shape().to_vec(),
                });
            }
            total += cross_entropy(target, log_pv);
            let span = iv * batch..(iv + 1) * batch;
            let probs = log_p[stream].slice(s![span.clone(), ..]).mapv(f32::exp);
            let mut g = grads[stream].slice_mut(s![span, ..]);
            g += &probs;
            g -= target;
        }
        let n_terms = self.n_crops;
        let scale = 1.0 / (self.student_temp * batch as f32 * n_terms as f32);
        for g in grads.iter_mut() {
            g.mapv_inplace(|v| v * scale);
        }
        Ok(LossOutput {
            loss: total / n_terms as f32,
            student_grads: grads,
            n_terms,
        })
    }

    /// EMA update of the center from the raw teacher logits.
    ///
    /// Row sums are all-reduced first and divided by the global row count,
    /// so every worker applies the identical update.
    pub fn update_center(&mut self, teacher: &[Array2<f32>], collective: &dyn Collective) -> Result<()> {
        let streams = self.center.nrows();
        if teacher.len() < streams {
            return Err(Error::InvalidParameter(format!(
                "center has {streams} streams but {} teacher outputs were given",
                teacher.len()
            )));
        }
        let rows = teacher[0].nrows();
        let mut sums: Vec<f32> = Vec::with_capacity(streams * self.center.ncols());
        for t in &teacher[..streams] {
            sums.extend(t.sum_axis(Axis(0)).iter().copied());
        }
        collective.all_reduce_sum(&mut sums)?;
        let denom = (rows * collective.world_size()) as f32;
        let batch_center = Array2::from_shape_vec((streams, self.center.ncols()), sums)?
            .mapv(|v| v / denom);
        let m = self.center_momentum;
        self.center.zip_mut_with(&batch_center, |c, b| *c = *c * m + *b * (1.0 - m));
        Ok(())
    }

    /// Loss for this step followed by the center update
    pub fn forward(
        &mut self,
        student: &[Array2<f32>],
        teacher: &[Array2<f32>],
        epoch: usize,
        collective: &dyn Collective,
    ) -> Result<LossOutput> {
        let out = self.compute(student, teacher, epoch)?;
        self.update_center(teacher, collective)?;
        Ok(out)
    }

    pub fn state(&self) -> DinoLossState {
        DinoLossState {
            center: self.center.rows().into_iter().map(|r| r.to_vec()).collect(),
            center_momentum: self.center_momentum,
            student_temp: self.student_temp,
            variant: self.variant,
            teacher_temp_schedule: self.teacher_temp_schedule.clone(),
        }
    }

    pub fn load_state(&mut self, state: &DinoLossState) -> Result<()> {
        let rows = state.center.len();
        let cols = state.center.first().map_or(0, Vec::len);
        if (rows, cols) != self.center.dim() {
            return Err(Error::Checkpoint(format!(
                "center shape {:?} does not match {:?}",
                (rows, cols),
                self.center.dim()
            )));
        }
        let flat: Array1<f32> = state.center.iter().flatten().copied().collect();
        self.center = flat.into_shape((rows, cols))?;
        self.center_momentum = state.center_momentum;
        self.student_temp = state.student_temp;
        self.teacher_temp_schedule = state.teacher_temp_schedule.clone();
        Ok(())
    }
}

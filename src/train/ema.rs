//! Exponential-moving-average teacher update

use crate::error::{Error, Result};
use crate::nn::{Network, Tensor};

/// `teacher = m * teacher + (1 - m) * student`, parameter by parameter
pub fn ema_update_params(teacher: &mut [Tensor], student: &[Tensor], momentum: f32) -> Result<()> {
    if teacher.len() != student.len() {
        return Err(Error::ArchitectureMismatch(format!(
            "EMA over {} teacher and {} student parameters",
            teacher.len(),
            student.len()
        )));
    }
    for (t, s) in teacher.iter_mut().zip(student) {
        if t.len() != s.len() {
            return Err(Error::ShapeMismatch {
                expected: t.shape().to_vec(),
                got: s.shape().to_vec(),
            });
        }
        t.data_mut()
            .zip_mut_with(s.data(), |tv, &sv| *tv = *tv * momentum + (1.0 - momentum) * sv);
    }
    Ok(())
}

/// EMA update of a whole network
pub fn ema_update(teacher: &mut dyn Network, student: &dyn Network, momentum: f64) -> Result<()> {
    ema_update_params(teacher.parameters_mut(), student.parameters(), momentum as f32)
}

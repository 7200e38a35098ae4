//! Random tube masks

use crate::error::{Error, Result};
use ndarray::Array2;
use rand::seq::index::sample;
use rand::Rng;

/// Random spatial mask repeated over every frame of a clip
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TubeMaskGenerator {
    ratio: f64,
}

impl TubeMaskGenerator {
    pub fn new(ratio: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&ratio) {
            return Err(Error::InvalidParameter(format!(
                "tube mask ratio must be in [0, 1), got {ratio}"
            )));
        }
        Ok(Self { ratio })
    }

    /// Number of hidden tokens per frame
    pub fn hidden_count(&self, tokens: usize) -> usize {
        (self.ratio * tokens as f64).round() as usize
    }

    /// `(frames, tokens)` mask, `true` = hidden
    pub fn generate<R: Rng + ?Sized>(&self, frames: usize, tokens: usize, rng: &mut R) -> Array2<bool> {
        let mut pattern = vec![false; tokens];
        for i in sample(rng, tokens, self.hidden_count(tokens).min(tokens)) {
            pattern[i] = true;
        }
        Array2::from_shape_fn((frames, tokens), |(_, n)| pattern[n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_tube_mask_is_constant_over_frames() {
        let gen = TubeMaskGenerator::new(0.75).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let m = gen.generate(4, 36, &mut rng);
        assert_eq!(m.dim(), (4, 36));
        for row in m.outer_iter() {
            assert_eq!(row, m.row(0));
            assert_eq!(row.iter().filter(|h| **h).count(), 27);
        }
    }

    #[test]
    fn test_zero_ratio_hides_nothing() {
        let gen = TubeMaskGenerator::new(0.0).unwrap();
        let m = gen.generate(2, 9, &mut StdRng::seed_from_u64(0));
        assert!(m.iter().all(|h| !h));
        assert!(TubeMaskGenerator::new(1.0).is_err());
    }
}

//! Multi-crop augmentation
//!
//! Every view draws its own crop box and photometric parameters once and
//! applies them identically to all frames, so motion inside a view stays
//! consistent. Pixel values are expected in `[0, 1]` before normalisation.

use super::Clip;
use crate::error::{Error, Result};
use ndarray::{s, Array4, Axis, Zip};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Colour jitter strengths
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorJitter {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
}

impl Default for ColorJitter {
    fn default() -> Self {
        Self {
            brightness: 0.4,
            contrast: 0.4,
            saturation: 0.2,
            hue: 0.1,
        }
    }
}

/// Transform of one view: random resized crop, flip, colour, blur, solarize, normalise
#[derive(Debug, Clone, PartialEq)]
pub struct ViewTransform {
    pub size: usize,
    pub scale: (f64, f64),
    pub flip_p: f64,
    pub jitter: ColorJitter,
    pub jitter_p: f64,
    pub grayscale_p: f64,
    pub blur_p: f64,
    pub solarize_p: f64,
}

impl ViewTransform {
    fn base(size: usize, scale: (f64, f64), blur_p: f64) -> Self {
        Self {
            size,
            scale,
            flip_p: 0.5,
            jitter: ColorJitter::default(),
            jitter_p: 0.8,
            grayscale_p: 0.2,
            blur_p,
            solarize_p: 0.0,
        }
    }

    /// Applies the transform; channels other than three skip the colour operations
    pub fn apply<R: Rng + ?Sized>(&self, clip: &Clip, rng: &mut R) -> Result<Clip> {
        let mut view = random_resized_crop(clip, self.size, self.scale, rng)?;
        if rng.gen_bool(self.flip_p) {
            view.invert_axis(Axis(3));
        }
        let rgb = view.len_of(Axis(0)) == 3;
        if rgb && rng.gen_bool(self.jitter_p) {
            color_jitter(&mut view, &self.jitter, rng);
        }
        if rgb && rng.gen_bool(self.grayscale_p) {
            grayscale(&mut view);
        }
        if rng.gen_bool(self.blur_p) {
            let sigma = rng.gen_range(0.1..2.0);
            gaussian_blur(&mut view, sigma);
        }
        if rng.gen_bool(self.solarize_p) {
            solarize(&mut view, 0.5);
        }
        if rgb {
            normalize(&mut view, &IMAGENET_MEAN, &IMAGENET_STD);
        }
        Ok(view)
    }
}

/// Two global crops and any number of local crops per clip
#[derive(Debug, Clone, PartialEq)]
pub struct MultiCropAugmentation {
    pub global: [ViewTransform; 2],
    pub local: ViewTransform,
    pub local_crops: usize,
}

impl MultiCropAugmentation {
    pub fn new(
        global_size: usize,
        global_scale: (f64, f64),
        local_size: usize,
        local_scale: (f64, f64),
        local_crops: usize,
    ) -> Result<Self> {
        for (name, (lo, hi)) in [("global", global_scale), ("local", local_scale)] {
            if !(lo > 0.0 && lo <= hi && hi <= 1.0) {
                return Err(Error::InvalidParameter(format!(
                    "{name} crop scale ({lo}, {hi}) must be ordered within (0, 1]"
                )));
            }
        }
        let first = ViewTransform::base(global_size, global_scale, 1.0);
        let second = ViewTransform {
            solarize_p: 0.2,
            ..ViewTransform::base(global_size, global_scale, 0.1)
        };
        Ok(Self {
            global: [first, second],
            local: ViewTransform::base(local_size, local_scale, 0.5),
            local_crops,
        })
    }

    pub fn num_views(&self) -> usize {
        self.global.len() + self.local_crops
    }

    /// Global views first, then local views
    pub fn apply<R: Rng + ?Sized>(&self, clip: &Clip, rng: &mut R) -> Result<Vec<Clip>> {
        let mut views = Vec::with_capacity(self.num_views());
        for t in &self.global {
            views.push(t.apply(clip, rng)?);
        }
        for _ in 0..self.local_crops {
            views.push(self.local.apply(clip, rng)?);
        }
        Ok(views)
    }
}

/// Crop a random region of relative area `scale` and aspect ratio in
/// `[3/4, 4/3]`, then resize it to `size x size`.
pub fn random_resized_crop<R: Rng + ?Sized>(
    clip: &Clip,
    size: usize,
    scale: (f64, f64),
    rng: &mut R,
) -> Result<Clip> {
    let (_, _, h, w) = clip.dim();
    if h == 0 || w == 0 || size == 0 {
        return Err(Error::Data(format!("cannot crop {h}x{w} clip to {size}")));
    }
    let area = (h * w) as f64;
    let (log_lo, log_hi) = ((3.0f64 / 4.0).ln(), (4.0f64 / 3.0).ln());
    for _ in 0..10 {
        let target = area * rng.gen_range(scale.0..=scale.1);
        let ratio = rng.gen_range(log_lo..=log_hi).exp();
        let cw = (target * ratio).sqrt().round() as usize;
        let ch = (target / ratio).sqrt().round() as usize;
        if cw > 0 && ch > 0 && cw <= w && ch <= h {
            let top = rng.gen_range(0..=h - ch);
            let left = rng.gen_range(0..=w - cw);
            return Ok(resize(clip, (top, left, ch, cw), size));
        }
    }
    // central crop fallback
    let side = h.min(w);
    Ok(resize(clip, ((h - side) / 2, (w - side) / 2, side, side), size))
}

/// Bilinear resize of the region `(top, left, height, width)` to `size x size`
fn resize(clip: &Clip, region: (usize, usize, usize, usize), size: usize) -> Clip {
    let (c, t, _, _) = clip.dim();
    let (top, left, rh, rw) = region;
    let src = clip.slice(s![.., .., top..top + rh, left..left + rw]);
    let sy = rh as f32 / size as f32;
    let sx = rw as f32 / size as f32;
    let coord = |dst: usize, scale: f32, len: usize| {
        let p = ((dst as f32 + 0.5) * scale - 0.5).clamp(0.0, (len - 1) as f32);
        let lo = p.floor() as usize;
        (lo, (lo + 1).min(len - 1), p - lo as f32)
    };
    let ys: Vec<_> = (0..size).map(|y| coord(y, sy, rh)).collect();
    let xs: Vec<_> = (0..size).map(|x| coord(x, sx, rw)).collect();
    Array4::from_shape_fn((c, t, size, size), |(ci, ti, y, x)| {
        let (y0, y1, fy) = ys[y];
        let (x0, x1, fx) = xs[x];
        let top_row = src[[ci, ti, y0, x0]] * (1.0 - fx) + src[[ci, ti, y0, x1]] * fx;
        let bottom_row = src[[ci, ti, y1, x0]] * (1.0 - fx) + src[[ci, ti, y1, x1]] * fx;
        top_row * (1.0 - fy) + bottom_row * fy
    })
}

fn luma(view: &Clip) -> Array4<f32> {
    let l = &view.index_axis(Axis(0), 0) * 0.299
        + &view.index_axis(Axis(0), 1) * 0.587
        + &view.index_axis(Axis(0), 2) * 0.114;
    l.insert_axis(Axis(0))
}

fn blend(view: &mut Clip, other: &Array4<f32>, factor: f32) {
    Zip::from(view.view_mut())
        .and_broadcast(other)
        .for_each(|v, o| *v = (*v * factor + *o * (1.0 - factor)).clamp(0.0, 1.0));
}

/// Brightness, contrast, saturation and hue adjustments in random order
pub fn color_jitter<R: Rng + ?Sized>(view: &mut Clip, jitter: &ColorJitter, rng: &mut R) {
    let mut order = [0usize, 1, 2, 3];
    order.shuffle(rng);
    for op in order {
        match op {
            0 if jitter.brightness > 0.0 => {
                let f = rng.gen_range(1.0 - jitter.brightness..=1.0 + jitter.brightness);
                view.mapv_inplace(|v| (v * f).clamp(0.0, 1.0));
            }
            1 if jitter.contrast > 0.0 => {
                let f = rng.gen_range(1.0 - jitter.contrast..=1.0 + jitter.contrast);
                let mean = luma(view).mean().unwrap_or(0.0);
                let target = Array4::from_elem((1, 1, 1, 1), mean);
                blend(view, &target, f);
            }
            2 if jitter.saturation > 0.0 => {
                let f = rng.gen_range(1.0 - jitter.saturation..=1.0 + jitter.saturation);
                let gray = luma(view);
                blend(view, &gray, f);
            }
            3 if jitter.hue > 0.0 => {
                let shift = rng.gen_range(-jitter.hue..=jitter.hue);
                rotate_hue(view, shift);
            }
            _ => {}
        }
    }
}

/// Rotate chroma in YIQ space by `shift` turns
fn rotate_hue(view: &mut Clip, shift: f32) {
    let (sin, cos) = (shift * std::f32::consts::TAU).sin_cos();
    let (_, t, h, w) = view.dim();
    for ti in 0..t {
        for y in 0..h {
            for x in 0..w {
                let (r, g, b) = (view[[0, ti, y, x]], view[[1, ti, y, x]], view[[2, ti, y, x]]);
                let yy = 0.299 * r + 0.587 * g + 0.114 * b;
                let i = 0.596 * r - 0.274 * g - 0.322 * b;
                let q = 0.211 * r - 0.523 * g + 0.312 * b;
                let (i, q) = (i * cos - q * sin, i * sin + q * cos);
                view[[0, ti, y, x]] = (yy + 0.956 * i + 0.621 * q).clamp(0.0, 1.0);
                view[[1, ti, y, x]] = (yy - 0.272 * i - 0.647 * q).clamp(0.0, 1.0);
                view[[2, ti, y, x]] = (yy - 1.106 * i + 1.703 * q).clamp(0.0, 1.0);
            }
        }
    }
}

pub fn grayscale(view: &mut Clip) {
    let gray = luma(view);
    Zip::from(view.view_mut())
        .and_broadcast(&gray)
        .for_each(|v, g| *v = *g);
}

/// Separable gaussian blur over the spatial axes with clamped borders
pub fn gaussian_blur(view: &mut Clip, sigma: f32) {
    let radius = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f32 = kernel.iter().sum();
    let kernel: Vec<f32> = kernel.iter().map(|k| k / total).collect();

    for axis in [2usize, 3] {
        let src = view.clone();
        let len = src.len_of(Axis(axis)) as isize;
        for ((c, t, y, x), v) in view.indexed_iter_mut() {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let offset = k as isize - radius;
                let (yy, xx) = if axis == 2 {
                    ((y as isize + offset).clamp(0, len - 1) as usize, x)
                } else {
                    (y, (x as isize + offset).clamp(0, len - 1) as usize)
                };
                acc += weight * src[[c, t, yy, xx]];
            }
            *v = acc;
        }
    }
}

/// Invert every value at or above `threshold`
pub fn solarize(view: &mut Clip, threshold: f32) {
    view.mapv_inplace(|v| if v >= threshold { 1.0 - v } else { v });
}

pub fn normalize(view: &mut Clip, mean: &[f32; 3], std: &[f32; 3]) {
    for (c, mut channel) in view.axis_iter_mut(Axis(0)).enumerate() {
        let (m, s) = (mean[c % 3], std[c % 3]);
        channel.mapv_inplace(|v| (v - m) / s);
    }
}

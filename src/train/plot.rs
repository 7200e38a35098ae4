//! Loss-curve rendering

use crate::error::{Error, Result};
use plotters::prelude::*;
use std::path::{Path, PathBuf};

const SIZE: (u32, u32) = (640, 480);

pub fn plot_path(output_dir: &Path, epoch: usize) -> PathBuf {
    output_dir.join("plots").join(format!("loss_plot_epoch_{epoch}.png"))
}

fn plot_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Plot(e.to_string())
}

/// Draw the training loss per epoch as a line with markers.
///
/// The build carries no font backend, so the chart has axes but no text.
/// An existing file is left untouched; returns whether a file was written.
pub fn plot_loss(path: &Path, history: &[(usize, f64)]) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let finite: Vec<(f64, f64)> = history
        .iter()
        .filter(|(_, l)| l.is_finite())
        .map(|&(e, l)| (e as f64, l))
        .collect();

    let x_max = finite.iter().map(|p| p.0).fold(1.0, f64::max);
    let (y_min, y_max) = finite
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p.1), hi.max(p.1)));
    let (y_min, y_max) = if y_min.is_finite() && y_max > y_min {
        let pad = (y_max - y_min) * 0.05;
        (y_min - pad, y_max + pad)
    } else if y_min.is_finite() {
        (y_min - 1.0, y_min + 1.0)
    } else {
        (0.0, 1.0)
    };

    let root = BitMapBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    {
        let mut chart = ChartBuilder::on(&root)
            .margin(20)
            .build_cartesian_2d(0.0..x_max, y_min..y_max)
            .map_err(plot_err)?;

        chart
            .draw_series(std::iter::once(Rectangle::new(
                [(0.0, y_min), (x_max, y_max)],
                BLACK.stroke_width(1),
            )))
            .map_err(plot_err)?;
        chart
            .draw_series(LineSeries::new(finite.iter().copied(), BLUE.stroke_width(2)))
            .map_err(plot_err)?;
        chart
            .draw_series(PointSeries::of_element(
                finite.iter().copied(),
                4,
                BLUE.filled(),
                &|coord, size, style| EmptyElement::at(coord) + Circle::new((0, 0), size, style),
            ))
            .map_err(plot_err)?;
    }
    root.present().map_err(plot_err)?;
    Ok(true)
}

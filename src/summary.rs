//! Training summaries: loss curves and grids of generated samples

use std::{error::Error, path::Path};

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use plotters::{
    chart::ChartBuilder,
    prelude::{BitMapBackend, IntoDrawingArea, PathElement},
    series::LineSeries,
    style::{BLACK, BLUE, Color, GREEN, RED, WHITE},
};

use crate::{dataset::ImageShape, loss::GanLosses};

/// Losses recorded at each logged step
#[derive(Debug, Default, Clone)]
pub struct LossHistory {
    steps: Vec<usize>,
    losses: Vec<GanLosses>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: usize, losses: GanLosses) {
        self.steps.push(step);
        self.losses.push(losses);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<(usize, GanLosses)> {
        self.steps.iter().copied().zip(self.losses.iter().copied()).last()
    }

    fn series(&self, f: impl Fn(&GanLosses) -> f32) -> Vec<(f32, f32)> {
        self.steps
            .iter()
            .zip(self.losses.iter())
            .map(|(s, l)| (*s as f32, f(l)))
            .collect()
    }
}

/// Plots the discriminator and generator losses against the training step
pub fn plot_losses(history: &LossHistory, file_name: &Path) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(file_name, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let d_loss = history.series(|l| l.d_loss);
    let d_real = history.series(|l| l.d_real_loss);
    let d_fake = history.series(|l| l.d_fake_loss);
    let g_loss = history.series(|l| l.g_loss);

    let x_max = d_loss.iter().map(|(x, _)| *x).fold(1.0f32, f32::max);
    let y_max = [&d_loss, &d_real, &d_fake, &g_loss]
        .iter()
        .flat_map(|s| s.iter().map(|(_, y)| *y))
        .filter(|y| y.is_finite())
        .fold(0.1f32, f32::max);

    let mut chart = ChartBuilder::on(&root_area)
        .caption("LSGAN losses", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(0.0f32..x_max, 0.0f32..y_max * 1.1)?;

    chart.configure_mesh().x_desc("step").draw()?;

    for (name, series, color) in [
        ("d_loss", d_loss, BLACK),
        ("d_real_loss", d_real, BLUE),
        ("d_fake_loss", d_fake, GREEN),
        ("g_loss", g_loss, RED),
    ] {
        chart
            .draw_series(LineSeries::new(series, color.stroke_width(2)))?
            .label(name)
            .legend(move |(x, y)| {
                PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
            });
    }
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;

    root_area.present()?;
    log::info!("Loss plot has been saved to '{}'.", file_name.display());
    Ok(())
}

/// Tiles flattened HWC images in `[0, 1]` into a grid of `columns` and writes it as a PNG
pub fn save_image_grid(
    images: &[f32],
    shape: ImageShape,
    columns: usize,
    file_name: &Path,
) -> Result<(), Box<dyn Error>> {
    let n = images.len() / shape.row_len().max(1);
    let columns = columns.clamp(1, n.max(1));
    let rows = n.div_ceil(columns);
    let (grid_w, grid_h) = (columns * shape.width, rows * shape.height);

    let mut buffer = vec![0u8; grid_w * grid_h * shape.channels];
    for (i, image) in images.chunks_exact(shape.row_len()).enumerate() {
        let (gy, gx) = (i / columns, i % columns);
        for y in 0..shape.height {
            let src = &image[y * shape.width * shape.channels..(y + 1) * shape.width * shape.channels];
            let dst_start = ((gy * shape.height + y) * grid_w + gx * shape.width) * shape.channels;
            for (dst, v) in buffer[dst_start..dst_start + src.len()].iter_mut().zip(src) {
                *dst = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        }
    }

    let (w, h) = (grid_w as u32, grid_h as u32);
    let grid = match shape.channels {
        1 => GrayImage::from_raw(w, h, buffer).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, buffer).map(DynamicImage::ImageRgb8),
        4 => RgbaImage::from_raw(w, h, buffer).map(DynamicImage::ImageRgba8),
        c => return Err(format!("cannot write images with {c} channels").into()),
    }
    .ok_or("image buffer does not match the grid size")?;
    grid.save(file_name)?;
    log::info!("Samples have been saved to '{}'.", file_name.display());
    Ok(())
}

use std::path::Path;

use anyhow::Context;
use image::{ImageBuffer, Rgb, RgbImage};

/// Layout of a batch of CHW images in `[-1, 1]` tiled into a grid.
#[derive(Debug, Clone, Copy)]
pub struct GridShape {
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

pub fn save_sample_grid(save_path: &Path, images: &[f32], shape: GridShape) -> anyhow::Result<()> {
    let montage = build_sample_grid(images, shape)?;
    if let Some(parent) = save_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create sample dir: {}", parent.display()))?;
    }
    montage
        .save(save_path)
        .with_context(|| format!("Failed to write sample grid: {}", save_path.display()))?;
    Ok(())
}

pub fn build_sample_grid(images: &[f32], shape: GridShape) -> anyhow::Result<RgbImage> {
    let GridShape {
        rows,
        cols,
        channels,
        height: h,
        width: w,
    } = shape;
    if channels != 1 && channels != 3 {
        anyhow::bail!("Sample grid supports 1 or 3 channels, got {channels}");
    }
    let image_len = channels * h * w;
    let count = images.len() / image_len;
    if images.len() % image_len != 0 || count > rows * cols {
        anyhow::bail!(
            "Cannot tile {} values as {rows}x{cols} images of {channels}x{h}x{w}",
            images.len()
        );
    }

    let mut montage: RgbImage = ImageBuffer::new((w * cols) as u32, (h * rows) as u32);
    for (index, chw) in images.chunks_exact(image_len).enumerate() {
        let tile = chw_to_rgb(chw, channels, h, w);
        blit(&mut montage, &tile, (index % cols) * w, (index / cols) * h);
    }
    Ok(montage)
}

fn to_byte(value: f32) -> u8 {
    ((value + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8
}

fn chw_to_rgb(chw: &[f32], channels: usize, h: usize, w: usize) -> RgbImage {
    let pixels = h * w;
    let mut image: RgbImage = ImageBuffer::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let rgb = if channels == 3 {
                [
                    to_byte(chw[idx]),
                    to_byte(chw[pixels + idx]),
                    to_byte(chw[2 * pixels + idx]),
                ]
            } else {
                [to_byte(chw[idx]); 3]
            };
            image.put_pixel(x as u32, y as u32, Rgb(rgb));
        }
    }
    image
}

fn blit(dst: &mut RgbImage, src: &RgbImage, x_offset: usize, y_offset: usize) {
    for (x, y, pixel) in src.enumerate_pixels() {
        dst.put_pixel(x + x_offset as u32, y + y_offset as u32, *pixel);
    }
}

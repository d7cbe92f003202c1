//! CPU implementations of the WGSL kernels, texel for texel.
//!
//! Textures hold 8-bit normalized channels. Each kernel reads its inputs as
//! `[f32; 4]` texels (an `R8` texel reads as `[r, 0, 0, 1]`) and writes one
//! texel per output position.

use super::TextureFormat;
use crate::error::{Error, Result};

/// Read-only view of a texture's pixels.
pub(super) struct Plane<'a> {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: &'a [u8],
}

impl Plane<'_> {
    fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width as i32 && y < self.height as i32
    }

    /// Texel at `(x, y)`, clamped to the edge.
    fn texel(&self, x: i32, y: i32) -> [f32; 4] {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        let bpp = self.format.bytes_per_pixel();
        let offset = (y * self.width as usize + x) * bpp;
        let norm = |v: u8| v as f32 / 255.0;
        match self.format {
            TextureFormat::Rgba8 => [
                norm(self.data[offset]),
                norm(self.data[offset + 1]),
                norm(self.data[offset + 2]),
                norm(self.data[offset + 3]),
            ],
            TextureFormat::R8 => [norm(self.data[offset]), 0.0, 0.0, 1.0],
        }
    }
}

/// Output texture being written by a kernel.
pub(super) struct Target {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
}

impl Target {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; width as usize * height as usize * format.bytes_per_pixel()],
        }
    }

    fn set(&mut self, x: u32, y: u32, texel: [f32; 4]) {
        let bpp = self.format.bytes_per_pixel();
        let offset = (y as usize * self.width as usize + x as usize) * bpp;
        for (channel, value) in texel.iter().take(bpp).enumerate() {
            self.data[offset + channel] = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
    }

    fn fill(&mut self, mut shade: impl FnMut(i32, i32) -> [f32; 4]) {
        for y in 0..self.height {
            for x in 0..self.width {
                let texel = shade(x as i32, y as i32);
                self.set(x, y, texel);
            }
        }
    }
}

/// Arguments of one dispatch, looked up by declared name.
pub(super) struct KernelArgs<'a> {
    pub textures: Vec<(&'a str, Plane<'a>)>,
    pub scalars: Vec<(&'a str, f32)>,
}

impl KernelArgs<'_> {
    fn texture(&self, name: &str) -> Result<&Plane<'_>> {
        self.textures
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, plane)| plane)
            .ok_or_else(|| Error::IllegalArgument(format!("kernel expects texture '{name}'")))
    }

    fn scalar(&self, name: &str) -> Result<f32> {
        self.scalars
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, value)| *value)
            .ok_or_else(|| Error::IllegalArgument(format!("kernel expects scalar '{name}'")))
    }
}

pub(super) type Kernel = fn(&KernelArgs<'_>, &mut Target) -> Result<()>;

pub(super) fn lookup(name: &str) -> Option<Kernel> {
    let kernel: Kernel = match name {
        "utils/rgb2grey" => rgb2grey,
        "keypoints/fast9" => fast9,
        "keypoints/fast7" => fast7,
        "keypoints/fast5" => fast5,
        "keypoints/fast-score16" => fast_score16,
        "keypoints/fast-score12" => fast_score12,
        "keypoints/fast-score8" => fast_score8,
        "keypoints/nonmax-suppression" => nonmax_suppression,
        "keypoints/multiscale-sobel" => multiscale_sobel,
        "keypoints/multiscale-harris" => multiscale_harris,
        "keypoints/harris-row-max" => harris_row_max,
        "keypoints/harris-cutoff" => harris_cutoff,
        "keypoints/orientation-via-centroid" => orientation_via_centroid,
        _ => return None,
    };
    Some(kernel)
}

const RING16: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

const RING12: [(i32, i32); 12] = [
    (0, -2),
    (1, -2),
    (2, -1),
    (2, 0),
    (2, 1),
    (1, 2),
    (0, 2),
    (-1, 2),
    (-2, 1),
    (-2, 0),
    (-2, -1),
    (-1, -2),
];

const RING8: [(i32, i32); 8] = [(0, -1), (1, -1), (1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0), (-1, -1)];

fn rgb2grey(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    let image = args.texture("image")?;
    out.fill(|x, y| {
        let [r, g, b, _] = image.texel(x, y);
        [0.299 * r + 0.587 * g + 0.114 * b, 0.0, 0.0, 1.0]
    });
    Ok(())
}

/// Segment test: `arc` contiguous ring pixels all brighter than `c + t` or
/// all darker than `c - t`, with wraparound.
fn segment_test(args: &KernelArgs<'_>, out: &mut Target, ring: &[(i32, i32)], arc: usize) -> Result<()> {
    let image = args.texture("image")?;
    let threshold = args.scalar("threshold")?;
    let border = ring.iter().map(|&(dx, _)| dx.abs()).max().unwrap_or(0);
    let (w, h) = (image.width as i32, image.height as i32);

    out.fill(|x, y| {
        let c = image.texel(x, y)[0];
        if x < border || y < border || x >= w - border || y >= h - border {
            return [c, 0.0, 0.0, 1.0];
        }
        let (mut bright, mut dark) = (0, 0);
        let mut corner = false;
        for i in 0..ring.len() + arc - 1 {
            let (dx, dy) = ring[i % ring.len()];
            let q = image.texel(x + dx, y + dy)[0];
            bright = if q > c + threshold { bright + 1 } else { 0 };
            dark = if q < c - threshold { dark + 1 } else { 0 };
            corner = corner || bright >= arc || dark >= arc;
        }
        [c, if corner { 1.0 } else { 0.0 }, 0.0, 1.0]
    });
    Ok(())
}

fn fast9(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    segment_test(args, out, &RING16, 9)
}

fn fast7(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    segment_test(args, out, &RING12, 7)
}

fn fast5(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    segment_test(args, out, &RING8, 5)
}

fn fast_score(args: &KernelArgs<'_>, out: &mut Target, ring: &[(i32, i32)]) -> Result<()> {
    let image = args.texture("image")?;
    let threshold = args.scalar("threshold")?;

    out.fill(|x, y| {
        let [c, candidate, _, _] = image.texel(x, y);
        if candidate == 0.0 {
            return [c, 0.0, 0.0, 1.0];
        }
        let (mut bright, mut dark) = (0.0f32, 0.0f32);
        for &(dx, dy) in ring {
            let q = image.texel(x + dx, y + dy)[0];
            if q > c + threshold {
                bright += q - c - threshold;
            } else if q < c - threshold {
                dark += c - q - threshold;
            }
        }
        let score = (bright.max(dark) / ring.len() as f32).clamp(1.0 / 255.0, 1.0);
        [c, score, 0.0, 1.0]
    });
    Ok(())
}

fn fast_score16(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    fast_score(args, out, &RING16)
}

fn fast_score12(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    fast_score(args, out, &RING12)
}

fn fast_score8(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    fast_score(args, out, &RING8)
}

fn nonmax_suppression(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    let image = args.texture("image")?;

    out.fill(|x, y| {
        let [c, score, _, _] = image.texel(x, y);
        if score == 0.0 {
            return [c, 0.0, 0.0, 1.0];
        }
        let mut suppressed = false;
        for dy in -1..=1 {
            for dx in -1..=1 {
                if (dx == 0 && dy == 0) || !image.contains(x + dx, y + dy) {
                    continue;
                }
                let g = image.texel(x + dx, y + dy)[1];
                let earlier = dy < 0 || (dy == 0 && dx < 0);
                suppressed = suppressed || g > score || (g == score && earlier);
            }
        }
        [c, if suppressed { 0.0 } else { score }, 0.0, 1.0]
    });
    Ok(())
}

fn multiscale_sobel(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    let pyramid = args.texture("pyramid")?;

    out.fill(|x, y| {
        let i = |dx: i32, dy: i32| pyramid.texel(x + dx, y + dy)[0];
        let dx = (i(1, -1) + 2.0 * i(1, 0) + i(1, 1)) - (i(-1, -1) + 2.0 * i(-1, 0) + i(-1, 1));
        let dy = (i(-1, 1) + 2.0 * i(0, 1) + i(1, 1)) - (i(-1, -1) + 2.0 * i(0, -1) + i(1, -1));
        [dx / 8.0 + 0.5, dy / 8.0 + 0.5, 0.0, 1.0]
    });
    Ok(())
}

fn multiscale_harris(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    let image = args.texture("image")?;
    let derivatives = args.texture("derivatives")?;
    let radius = args.scalar("windowRadius")? as i32;
    let area = ((2 * radius + 1) * (2 * radius + 1)) as f32;

    out.fill(|x, y| {
        let (mut sxx, mut syy, mut sxy) = (0.0f32, 0.0f32, 0.0f32);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let d = derivatives.texel(x + dx, y + dy);
                let ix = (d[0] - 0.5) * 8.0;
                let iy = (d[1] - 0.5) * 8.0;
                sxx += ix * ix;
                syy += iy * iy;
                sxy += ix * iy;
            }
        }
        let (sxx, syy, sxy) = (sxx / area, syy / area, sxy / area);
        let half_diff = (sxx - syy) * 0.5;
        let lambda = (sxx + syy) * 0.5 - (half_diff * half_diff + sxy * sxy).sqrt();
        [image.texel(x, y)[0], (lambda / 4.0).clamp(0.0, 1.0), 0.0, 1.0]
    });
    Ok(())
}

fn harris_row_max(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    let corners = args.texture("corners")?;
    let width = corners.width as i32;

    out.fill(|x, y| {
        let best = (0..width).map(|cx| corners.texel(cx, y)[1]).fold(0.0f32, f32::max);
        [corners.texel(x, y)[0], best, 0.0, 1.0]
    });
    Ok(())
}

fn harris_cutoff(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    let row_max = args.texture("rowMax")?;
    let corners = args.texture("corners")?;
    let quality = args.scalar("quality")?;
    let best = (0..row_max.height as i32)
        .map(|y| row_max.texel(0, y)[1])
        .fold(0.0f32, f32::max);

    out.fill(|x, y| {
        let [c, score, _, _] = corners.texel(x, y);
        let keep = score > 0.0 && score >= quality * best;
        [c, if keep { score } else { 0.0 }, 0.0, 1.0]
    });
    Ok(())
}

fn orientation_via_centroid(args: &KernelArgs<'_>, out: &mut Target) -> Result<()> {
    let corners = args.texture("corners")?;
    let radius = args.scalar("patchRadius")? as i32;

    out.fill(|x, y| {
        let here = corners.texel(x, y);
        if here[1] == 0.0 {
            return here;
        }
        let (mut m10, mut m01) = (0.0f32, 0.0f32);
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy > radius * radius || !corners.contains(x + dx, y + dy) {
                    continue;
                }
                let intensity = corners.texel(x + dx, y + dy)[0];
                m10 += dx as f32 * intensity;
                m01 += dy as f32 * intensity;
            }
        }
        let angle = m01.atan2(m10);
        let [r, g, b, _] = here;
        [r, g, b, (angle + std::f32::consts::PI) / std::f32::consts::TAU]
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grey(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        data
    }

    fn run(kernel: Kernel, textures: Vec<(&str, Plane<'_>)>, scalars: Vec<(&str, f32)>, format: TextureFormat) -> Target {
        let (w, h) = (textures[0].1.width, textures[0].1.height);
        let args = KernelArgs { textures, scalars };
        let mut out = Target::new(w, h, format);
        kernel(&args, &mut out).unwrap();
        out
    }

    fn plane(data: &[u8], width: u32, height: u32, format: TextureFormat) -> Plane<'_> {
        Plane {
            width,
            height,
            format,
            data,
        }
    }

    #[test]
    fn grey_conversion_uses_luma_weights() {
        let rgba = [255, 0, 0, 255, 0, 255, 0, 255, 0, 0, 255, 255, 255, 255, 255, 255];
        let out = run(
            rgb2grey,
            vec![("image", plane(&rgba, 4, 1, TextureFormat::Rgba8))],
            vec![],
            TextureFormat::R8,
        );
        assert_eq!(out.data, [76, 150, 29, 255]);
    }

    #[test]
    fn fast9_flags_square_corner_only() {
        let data = grey(16, 16, |x, y| if x >= 8 && y >= 8 { 255 } else { 0 });
        let out = run(
            fast9,
            vec![("image", plane(&data, 16, 16, TextureFormat::R8))],
            vec![("threshold", 0.1)],
            TextureFormat::Rgba8,
        );
        let flagged = |x: usize, y: usize| out.data[(y * 16 + x) * 4 + 1] > 0;
        assert!(flagged(8, 8));
        assert!(!flagged(7, 7));
        assert!(!flagged(4, 4));
        // Intensity is carried in red.
        assert_eq!(out.data[(8 * 16 + 8) * 4], 255);
    }

    #[test]
    fn fast_kernels_ignore_flat_images() {
        let data = vec![128u8; 20 * 20];
        for kernel in [fast9 as Kernel, fast7, fast5] {
            let out = run(
                kernel,
                vec![("image", plane(&data, 20, 20, TextureFormat::R8))],
                vec![("threshold", 0.05)],
                TextureFormat::Rgba8,
            );
            assert!(out.data.chunks(4).all(|t| t[1] == 0));
        }
    }

    #[test]
    fn candidates_always_get_a_nonzero_score() {
        // A candidate whose ring differs from the center by barely more than the threshold.
        let mut data = vec![0u8; 7 * 7 * 4];
        for texel in data.chunks_mut(4) {
            texel.copy_from_slice(&[30, 0, 0, 255]);
        }
        let center = (3 * 7 + 3) * 4;
        data[center..center + 4].copy_from_slice(&[0, 255, 0, 255]);
        let out = run(
            fast_score16,
            vec![("image", plane(&data, 7, 7, TextureFormat::Rgba8))],
            vec![("threshold", 0.1)],
            TextureFormat::Rgba8,
        );
        assert!(out.data[center + 1] >= 1);
        assert_eq!(out.data[1], 0);
    }

    #[test]
    fn nonmax_keeps_first_of_equal_neighbours() {
        let mut data = vec![0u8; 4 * 4 * 4];
        let mut set = |x: usize, y: usize, g: u8| data[(y * 4 + x) * 4 + 1] = g;
        set(1, 1, 100);
        set(2, 1, 100);
        set(1, 2, 50);
        let out = run(
            nonmax_suppression,
            vec![("image", plane(&data, 4, 4, TextureFormat::Rgba8))],
            vec![],
            TextureFormat::Rgba8,
        );
        let g = |x: usize, y: usize| out.data[(y * 4 + x) * 4 + 1];
        assert_eq!(g(1, 1), 100);
        assert_eq!(g(2, 1), 0);
        assert_eq!(g(1, 2), 0);
    }

    #[test]
    fn sobel_of_vertical_edge_is_horizontal() {
        let data = grey(8, 8, |x, _| if x >= 4 { 255 } else { 0 });
        let out = run(
            multiscale_sobel,
            vec![("pyramid", plane(&data, 8, 8, TextureFormat::R8))],
            vec![],
            TextureFormat::Rgba8,
        );
        let texel = |x: usize, y: usize| &out.data[(y * 8 + x) * 4..(y * 8 + x) * 4 + 2];
        assert_eq!(texel(4, 4), [255, 128]);
        assert_eq!(texel(1, 4), [128, 128]);
    }

    #[test]
    fn harris_cutoff_keeps_strong_corners() {
        let mut corners = vec![0u8; 16];
        corners[1] = 200;
        corners[5] = 40;
        corners[9] = 120;
        let row_max = run(
            harris_row_max,
            vec![("corners", plane(&corners, 4, 1, TextureFormat::Rgba8))],
            vec![],
            TextureFormat::Rgba8,
        );
        assert!(row_max.data.chunks(4).all(|t| t[1] == 200));

        let out = run(
            harris_cutoff,
            vec![
                ("rowMax", plane(&row_max.data, 4, 1, TextureFormat::Rgba8)),
                ("corners", plane(&corners, 4, 1, TextureFormat::Rgba8)),
            ],
            vec![("quality", 0.5)],
            TextureFormat::Rgba8,
        );
        let scores: Vec<u8> = out.data.chunks(4).map(|t| t[1]).collect();
        assert_eq!(scores, [200, 0, 120, 0]);
    }

    #[test]
    fn orientation_points_at_the_intensity_centroid() {
        // Corner at (3, 3); the right half of the patch is bright.
        let mut data = vec![0u8; 7 * 7 * 4];
        for y in 0..7 {
            for x in 0..7 {
                let offset = (y * 7 + x) * 4;
                data[offset] = if x > 3 { 255 } else { 0 };
                data[offset + 3] = 255;
            }
        }
        let corner = (3 * 7 + 3) * 4;
        data[corner + 1] = 90;

        let out = run(
            orientation_via_centroid,
            vec![("corners", plane(&data, 7, 7, TextureFormat::Rgba8))],
            vec![("patchRadius", 3.0)],
            TextureFormat::Rgba8,
        );
        // Angle 0 encodes to one half.
        assert_eq!(&out.data[corner..corner + 4], [0, 90, 0, 128]);
        // Non-corners pass through.
        assert_eq!(&out.data[0..4], [0, 0, 0, 255]);

        // Bright lower half: the centroid lies straight down, at pi / 2.
        for y in 0..7 {
            for x in 0..7 {
                data[(y * 7 + x) * 4] = if y > 3 { 255 } else { 0 };
            }
        }
        let out = run(
            orientation_via_centroid,
            vec![("corners", plane(&data, 7, 7, TextureFormat::Rgba8))],
            vec![("patchRadius", 3.0)],
            TextureFormat::Rgba8,
        );
        assert_eq!(out.data[corner + 3], 191);
    }
}

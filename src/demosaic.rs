//! Bilinear demosaicing for GBRG Bayer mosaics.
//!
//! Layout of each 2x2 cell:
//!
//! ```text
//! G B
//! R G
//! ```

/// Color channel of a Bayer site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Site {
    Red,
    Green,
    Blue,
}

const fn gbrg_site(row: usize, col: usize) -> Site {
    match (row % 2, col % 2) {
        (0, 1) => Site::Blue,
        (1, 0) => Site::Red,
        _ => Site::Green,
    }
}

const GREEN_KERNEL: [[f32; 3]; 3] = [[0.0, 1.0, 0.0], [1.0, 4.0, 1.0], [0.0, 1.0, 0.0]];
const RED_BLUE_KERNEL: [[f32; 3]; 3] = [[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]];

/// Demosaic a normalized GBRG mosaic into interleaved RGB.
///
/// Each missing sample is the kernel-weighted mean of the same-colored sites
/// in its 3x3 neighbourhood, so borders need no padding. Returns an empty
/// buffer if `mosaic.len() != height * width`.
#[must_use]
pub fn bilinear_gbrg(mosaic: &[f32], height: usize, width: usize) -> Vec<f32> {
    if mosaic.len() != height * width {
        return Vec::new();
    }

    let mut rgb = vec![0.0_f32; height * width * 3];
    for row in 0..height {
        for col in 0..width {
            let base = (row * width + col) * 3;
            for (offset, site) in [Site::Red, Site::Green, Site::Blue].into_iter().enumerate() {
                let kernel = if site == Site::Green {
                    &GREEN_KERNEL
                } else {
                    &RED_BLUE_KERNEL
                };
                if let Some(slot) = rgb.get_mut(base + offset) {
                    *slot = interpolate(mosaic, height, width, row, col, site, kernel);
                }
            }
        }
    }
    rgb
}

fn interpolate(
    mosaic: &[f32],
    height: usize,
    width: usize,
    row: usize,
    col: usize,
    site: Site,
    kernel: &[[f32; 3]; 3],
) -> f32 {
    let mut sum = 0.0;
    let mut weight = 0.0;
    for (dy, kernel_row) in kernel.iter().enumerate() {
        let Some(y) = (row + dy).checked_sub(1).filter(|&y| y < height) else {
            continue;
        };
        for (dx, &w) in kernel_row.iter().enumerate() {
            let Some(x) = (col + dx).checked_sub(1).filter(|&x| x < width) else {
                continue;
            };
            if w == 0.0 || gbrg_site(y, x) != site {
                continue;
            }
            if let Some(&value) = mosaic.get(y * width + x) {
                sum += w * value;
                weight += w;
            }
        }
    }
    if weight > 0.0 {
        sum / weight
    } else {
        0.0
    }
}

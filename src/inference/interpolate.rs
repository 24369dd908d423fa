//! Bicubic resampling of square position-embedding grids.
//!
//! Matches the cubic-convolution kernel (`A = -0.75`, half-pixel centers,
//! clamped borders) used when vision transformers are run at a resolution
//! other than the one they were pretrained on.

const CUBIC_A: f32 = -0.75;

/// Resample a `side_in x side_in` grid of `dim`-wide vectors (row-major,
/// vectors contiguous) to `side_out x side_out`.
pub fn bicubic_resize_grid(data: &[f32], dim: usize, side_in: usize, side_out: usize) -> Vec<f32> {
    debug_assert_eq!(data.len(), side_in * side_in * dim);
    if side_in == side_out {
        return data.to_vec();
    }

    let taps = taps_for(side_in, side_out);
    let mut out = vec![0f32; side_out * side_out * dim];

    for (oy, (ys, wys)) in taps.iter().enumerate() {
        for (ox, (xs, wxs)) in taps.iter().enumerate() {
            let dst = &mut out[(oy * side_out + ox) * dim..(oy * side_out + ox + 1) * dim];
            for (&iy, &wy) in ys.iter().zip(wys.iter()) {
                for (&ix, &wx) in xs.iter().zip(wxs.iter()) {
                    let w = wy * wx;
                    if w == 0.0 {
                        continue;
                    }
                    let src = &data[(iy * side_in + ix) * dim..(iy * side_in + ix + 1) * dim];
                    for (d, s) in dst.iter_mut().zip(src.iter()) {
                        *d += w * s;
                    }
                }
            }
        }
    }
    out
}

fn taps_for(side_in: usize, side_out: usize) -> Vec<([usize; 4], [f32; 4])> {
    let scale = side_in as f32 / side_out as f32;
    let last = side_in as isize - 1;
    (0..side_out)
        .map(|o| {
            let src = (o as f32 + 0.5) * scale - 0.5;
            let base = src.floor();
            let t = src - base;
            let base = base as isize;
            let idx = [-1isize, 0, 1, 2].map(|k| (base + k).clamp(0, last) as usize);
            (idx, cubic_weights(t))
        })
        .collect()
}

fn cubic_weights(t: f32) -> [f32; 4] {
    let a = CUBIC_A;
    let outer = |x: f32| ((a * x - 5.0 * a) * x + 8.0 * a) * x - 4.0 * a;
    let inner = |x: f32| ((a + 2.0) * x - (a + 3.0)) * x * x + 1.0;
    [outer(t + 1.0), inner(t), inner(1.0 - t), outer(2.0 - t)]
}

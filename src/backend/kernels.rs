//! Per-sample kernels shared by the backends

use ndarray::{ArrayView1, ArrayView3, ArrayViewMut1};

// Source coordinates within this distance of the volume edge are snapped to it
const EDGE_TOLERANCE: f64 = 1e-6;

/// Lower neighbour and weight of the upper one, `None` outside of `[0, n-1]`
#[inline]
fn neighbours(coordinate: f64, n: usize) -> Option<(usize, usize, f64)> {
    let last = n.checked_sub(1)? as f64;
    if !(coordinate >= -EDGE_TOLERANCE && coordinate <= last + EDGE_TOLERANCE) {
        return None;
    }
    let c = coordinate.clamp(0f64, last);
    let lower = (c.floor() as usize).min(n - 1);
    let upper = (lower + 1).min(n - 1);
    Some((lower, upper, c - lower as f64))
}

/// Trilinear sample of `input` at the index coordinate `src`
#[inline]
pub fn trilinear(input: &ArrayView3<f32>, src: [f64; 3], fill_value: f32) -> f32 {
    let (n0, n1, n2) = input.dim();
    let (Some((i0, i1, w0)), Some((j0, j1, w1)), Some((k0, k1, w2))) = (
        neighbours(src[0], n0),
        neighbours(src[1], n1),
        neighbours(src[2], n2),
    ) else {
        return fill_value;
    };
    let v = |i: usize, j: usize, k: usize| input[[i, j, k]] as f64;
    let c00 = v(i0, j0, k0) * (1f64 - w2) + v(i0, j0, k1) * w2;
    let c01 = v(i0, j1, k0) * (1f64 - w2) + v(i0, j1, k1) * w2;
    let c10 = v(i1, j0, k0) * (1f64 - w2) + v(i1, j0, k1) * w2;
    let c11 = v(i1, j1, k0) * (1f64 - w2) + v(i1, j1, k1) * w2;
    let c0 = c00 * (1f64 - w1) + c01 * w1;
    let c1 = c10 * (1f64 - w1) + c11 * w1;
    (c0 * (1f64 - w0) + c1 * w0) as f32
}

/// Sliding maximum of half-width `radius` along one lane
pub fn lane_maximum(input: ArrayView1<f32>, mut output: ArrayViewMut1<f32>, radius: usize) {
    let n = input.len();
    for i in 0..n {
        let lo = i.saturating_sub(radius);
        let hi = (i + radius).min(n - 1);
        output[i] = (lo..=hi)
            .map(|k| input[k])
            .fold(f32::NEG_INFINITY, f32::max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array1, Array3};

    #[test]
    fn edges() {
        let input = Array3::from_shape_fn((2, 2, 2), |(i, j, k)| (i + j + k) as f32);
        let view = input.view();
        assert_eq!(trilinear(&view, [1f64, 1f64, 1f64], -1f32), 3f32);
        assert_eq!(trilinear(&view, [1f64 + 1e-9, 0f64, 0f64], -1f32), 1f32);
        assert_eq!(trilinear(&view, [1.01, 0f64, 0f64], -1f32), -1f32);
        assert_eq!(trilinear(&view, [0.5, 0.5, 0.5], -1f32), 1.5);
        let empty = Array3::<f32>::zeros((2, 0, 2));
        assert_eq!(trilinear(&empty.view(), [0f64; 3], -1f32), -1f32);
    }

    #[test]
    fn sliding_maximum() {
        let input = arr1(&[0f32, 3f32, 1f32, 0f32, 0f32, 2f32]);
        let mut output = Array1::zeros(6);
        lane_maximum(input.view(), output.view_mut(), 1);
        assert_eq!(output, arr1(&[3f32, 3f32, 3f32, 1f32, 2f32, 2f32]));
    }
}

use ndarray::{Array2, Array4, ArrayView2, ArrayView4, Axis, Zip, parallel::prelude::*, s};

/// The geometry of a sliding window over the spatial axes of an NHWC tensor with `SAME` padding.
///
/// The output extent along an axis is `ceil(input / stride)` and the padding needed to reach it
/// is split evenly, with the odd element going to the bottom/right side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub kh: usize,
    pub kw: usize,
    pub stride: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pad_top: usize,
    pad_left: usize,
}

/// Returns the output extent and leading padding of one spatial axis.
fn same_axis(input: usize, k: usize, stride: usize) -> (usize, usize) {
    let out = input.div_ceil(stride);
    let total = (out.saturating_sub(1) * stride + k).saturating_sub(input);
    (out, total / 2)
}

impl Window {
    /// Creates a new `Window`.
    ///
    /// # Arguments
    /// * `in_h` - The input height.
    /// * `in_w` - The input width.
    /// * `kh` - The window height.
    /// * `kw` - The window width.
    /// * `stride` - The step between two consecutive windows, in both axes.
    pub fn same(in_h: usize, in_w: usize, kh: usize, kw: usize, stride: usize) -> Self {
        let (out_h, pad_top) = same_axis(in_h, kh, stride);
        let (out_w, pad_left) = same_axis(in_w, kw, stride);

        Self {
            kh,
            kw,
            stride,
            in_h,
            in_w,
            out_h,
            out_w,
            pad_top,
            pad_left,
        }
    }

    /// The input row read by output row `oh` at kernel row `ki`, `None` if it lands on padding.
    pub fn row(&self, oh: usize, ki: usize) -> Option<usize> {
        let pos = (oh * self.stride + ki).checked_sub(self.pad_top)?;
        (pos < self.in_h).then_some(pos)
    }

    /// The input column read by output column `ow` at kernel column `kj`, `None` if it lands on
    /// padding.
    pub fn col(&self, ow: usize, kj: usize) -> Option<usize> {
        let pos = (ow * self.stride + kj).checked_sub(self.pad_left)?;
        (pos < self.in_w).then_some(pos)
    }

    /// Iterates the input positions covered by the window of output `(oh, ow)`.
    fn taps(&self, oh: usize, ow: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.kh)
            .filter_map(move |ki| self.row(oh, ki))
            .flat_map(move |ih| (0..self.kw).filter_map(move |kj| self.col(ow, kj).map(|iw| (ih, iw))))
    }
}

/// Unfolds every window of `x` into a row of a matrix.
///
/// # Returns
/// A matrix of shape `[n * out_h * out_w, kh * kw * c]`, positions landing on padding are zero.
pub fn im2col(x: ArrayView4<f32>, win: &Window) -> Array2<f32> {
    let (n, _, _, c) = x.dim();
    let mut cols = Array2::zeros((n * win.out_h * win.out_w, win.kh * win.kw * c));

    cols.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(r, mut row)| {
            let b = r / (win.out_h * win.out_w);
            let oh = (r / win.out_w) % win.out_h;
            let ow = r % win.out_w;

            for ki in 0..win.kh {
                let Some(ih) = win.row(oh, ki) else {
                    continue;
                };

                for kj in 0..win.kw {
                    let Some(iw) = win.col(ow, kj) else {
                        continue;
                    };

                    let start = (ki * win.kw + kj) * c;
                    row.slice_mut(s![start..start + c])
                        .assign(&x.slice(s![b, ih, iw, ..]));
                }
            }
        });

    cols
}

/// Folds the rows produced by `im2col` back into an image, summing overlapping windows.
pub fn col2im(cols: ArrayView2<f32>, win: &Window, n: usize, c: usize) -> Array4<f32> {
    let mut x = Array4::zeros((n, win.in_h, win.in_w, c));
    let per_image = win.out_h * win.out_w;

    x.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(b, mut image)| {
            for oh in 0..win.out_h {
                for ow in 0..win.out_w {
                    let row = cols.row(b * per_image + oh * win.out_w + ow);

                    for ki in 0..win.kh {
                        let Some(ih) = win.row(oh, ki) else {
                            continue;
                        };

                        for kj in 0..win.kw {
                            let Some(iw) = win.col(ow, kj) else {
                                continue;
                            };

                            let start = (ki * win.kw + kj) * c;
                            let mut pixel = image.slice_mut(s![ih, iw, ..]);
                            pixel += &row.slice(s![start..start + c]);
                        }
                    }
                }
            }
        });

    x
}

/// Max pooling, padding never wins the maximum.
///
/// # Returns
/// The pooled tensor and, for every output element, the flat spatial index `ih * in_w + iw` of
/// the input element that produced it.
pub fn max_pool(x: ArrayView4<f32>, win: &Window) -> (Array4<f32>, Array4<usize>) {
    let (n, _, _, c) = x.dim();
    let shape = (n, win.out_h, win.out_w, c);
    let mut out = Array4::zeros(shape);
    let mut argmax = Array4::zeros(shape);

    Zip::indexed(&mut out)
        .and(&mut argmax)
        .par_for_each(|(b, oh, ow, ch), o, a| {
            let mut best: Option<(f32, usize)> = None;

            for (ih, iw) in win.taps(oh, ow) {
                let v = x[(b, ih, iw, ch)];
                if best.is_none_or(|(max, _)| v > max) {
                    best = Some((v, ih * win.in_w + iw));
                }
            }

            (*o, *a) = best.unwrap_or_default();
        });

    (out, argmax)
}

/// Routes the output gradient of a max pooling to the elements that won each window.
pub fn max_pool_backward(d: ArrayView4<f32>, argmax: &Array4<usize>, win: &Window) -> Array4<f32> {
    let (n, _, _, c) = d.dim();
    let mut dx = Array4::zeros((n, win.in_h, win.in_w, c));

    dx.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(b, mut image)| {
            for ((_, oh, ow, ch), &at) in argmax.slice(s![b..b + 1, .., .., ..]).indexed_iter() {
                image[(at / win.in_w, at % win.in_w, ch)] += d[(b, oh, ow, ch)];
            }
        });

    dx
}

/// Average pooling, each window is averaged over the input elements it covers, not its padding.
pub fn avg_pool(x: ArrayView4<f32>, win: &Window) -> Array4<f32> {
    let (n, _, _, c) = x.dim();
    let mut out = Array4::zeros((n, win.out_h, win.out_w, c));

    Zip::indexed(&mut out).par_for_each(|(b, oh, ow, ch), o| {
        let (sum, count) = win
            .taps(oh, ow)
            .fold((0.0, 0), |(sum, count), (ih, iw)| (sum + x[(b, ih, iw, ch)], count + 1));

        *o = if count > 0 { sum / count as f32 } else { 0.0 };
    });

    out
}

/// Spreads the output gradient of an average pooling evenly over each window.
pub fn avg_pool_backward(d: ArrayView4<f32>, win: &Window) -> Array4<f32> {
    let (n, _, _, c) = d.dim();
    let mut dx = Array4::zeros((n, win.in_h, win.in_w, c));

    dx.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(b, mut image)| {
            for oh in 0..win.out_h {
                for ow in 0..win.out_w {
                    let count = win.taps(oh, ow).count();
                    if count == 0 {
                        continue;
                    }

                    let share = d.slice(s![b, oh, ow, ..]).mapv(|g| g / count as f32);
                    for (ih, iw) in win.taps(oh, ow) {
                        let mut pixel = image.slice_mut(s![ih, iw, ..]);
                        pixel += &share;
                    }
                }
            }
        });

    dx
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    #[test]
    fn same_padding_halves_with_ceil() {
        let win = Window::same(5, 4, 2, 2, 2);
        assert_eq!((win.out_h, win.out_w), (3, 2));

        let win = Window::same(128, 128, 3, 3, 2);
        assert_eq!((win.out_h, win.out_w), (64, 64));

        let win = Window::same(7, 7, 3, 3, 1);
        assert_eq!((win.out_h, win.out_w), (7, 7));
        assert_eq!(win.row(0, 0), None);
        assert_eq!(win.row(0, 1), Some(0));
        assert_eq!(win.row(6, 2), None);
    }

    #[test]
    fn max_pool_picks_window_maxima() {
        let x = Array::from_shape_vec(
            (1, 2, 4, 1),
            vec![1.0, 5.0, -2.0, -3.0, 3.0, 4.0, -1.0, -4.0],
        )
        .unwrap();

        let win = Window::same(2, 4, 2, 2, 2);
        let (out, argmax) = max_pool(x.view(), &win);

        assert_eq!(out.into_raw_vec_and_offset().0, [5.0, -1.0]);
        assert_eq!(argmax.into_raw_vec_and_offset().0, [1, 6]);
    }

    #[test]
    fn max_pool_ignores_padding_on_negative_inputs() {
        let x = Array::from_elem((1, 3, 3, 1), -7.0);
        let win = Window::same(3, 3, 2, 2, 2);
        let (out, _) = max_pool(x.view(), &win);

        assert_eq!(out.dim(), (1, 2, 2, 1));
        assert!(out.iter().all(|&v| v == -7.0));
    }

    #[test]
    fn avg_pool_divides_by_covered_elements() {
        let x = Array::from_elem((1, 3, 3, 2), 2.0);
        let win = Window::same(3, 3, 2, 2, 2);
        let out = avg_pool(x.view(), &win);

        assert!(out.iter().all(|&v| (v - 2.0).abs() < 1e-6));

        let dx = avg_pool_backward(Array::ones(out.dim()).view(), &win);
        assert_eq!(dx[(0, 2, 2, 0)], 1.0);
        assert_eq!(dx[(0, 0, 0, 0)], 0.25);
    }

    #[test]
    fn im2col_and_col2im_are_adjoint() {
        let x = Array::from_shape_fn((2, 3, 3, 2), |(b, h, w, c)| (b + h * 3 + w + c) as f32);
        let win = Window::same(3, 3, 3, 3, 1);
        let cols = im2col(x.view(), &win);
        assert_eq!(cols.dim(), (18, 18));

        let ones = Array2::ones(cols.dim());
        let folded = col2im(ones.view(), &win, 2, 2);

        // Every pixel is read once per window that covers it.
        assert_eq!(folded[(0, 1, 1, 0)], 9.0);
        assert_eq!(folded[(0, 0, 0, 0)], 4.0);
        assert_eq!(folded[(1, 0, 1, 1)], 6.0);
    }
}

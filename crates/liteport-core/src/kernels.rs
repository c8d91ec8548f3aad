//! Reference NHWC f32 kernels.
//!
//! The layer-graph interpreter and the flat-format interpreter both execute
//! through these functions, so a converted model reproduces the original's
//! arithmetic in the same order.

use anyhow::{ensure, Context, Result};

use crate::{Activation, Hwc, Padding, Shape, Tensor};

#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMap {
    pub batch: usize,
    pub hwc: Hwc,
    pub data: Vec<f32>,
}

/// Element count of `batch` maps of `hwc`, or `None` on overflow.
fn feature_len(batch: usize, hwc: Hwc) -> Option<usize> {
    [hwc.height, hwc.width, hwc.channels]
        .iter()
        .try_fold(batch, |acc, dim| acc.checked_mul(*dim))
}

/// Empty buffer with room for a whole output map. Sizes that overflow or
/// cannot be allocated are errors, not aborts.
fn output_buffer(batch: usize, hwc: Hwc) -> Result<Vec<f32>> {
    let len = feature_len(batch, hwc)
        .with_context(|| format!("feature map of batch {batch} and {hwc:?} is too large"))?;
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .with_context(|| format!("cannot allocate {len} values for batch {batch} of {hwc:?}"))?;
    Ok(data)
}

impl FeatureMap {
    pub fn new(batch: usize, hwc: Hwc, data: Vec<f32>) -> Result<Self> {
        let expected = feature_len(batch, hwc);
        ensure!(
            expected == Some(data.len()),
            "feature map holds {} values, expected {:?} for batch {} of {:?}",
            data.len(),
            expected,
            batch,
            hwc
        );
        Ok(Self { batch, hwc, data })
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let dims = tensor.shape.dims();
        ensure!(dims.len() == 4, "expected NHWC tensor, got shape {dims:?}");
        Self::new(
            dims[0],
            Hwc::new(dims[1], dims[2], dims[3]),
            tensor.to_f32()?,
        )
    }

    pub fn to_tensor(&self) -> Result<Tensor> {
        Tensor::from_f32(
            Shape::from_slice(&[
                self.batch,
                self.hwc.height,
                self.hwc.width,
                self.hwc.channels,
            ]),
            &self.data,
        )
    }

    #[inline]
    fn index(&self, n: usize, y: usize, x: usize, c: usize) -> usize {
        ((n * self.hwc.height + y) * self.hwc.width + x) * self.hwc.channels + c
    }

    #[inline]
    pub fn at(&self, n: usize, y: usize, x: usize, c: usize) -> f32 {
        self.data[self.index(n, y, x, c)]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub padding: Padding,
}

impl Window {
    fn output(&self, input: Hwc, channels: usize) -> Result<(Hwc, [usize; 2])> {
        ensure!(
            !self.strides.contains(&0) && !self.kernel.contains(&0),
            "kernel size and strides must be non-zero"
        );
        let out_h = self
            .padding
            .output_len(input.height, self.kernel[0], self.strides[0]);
        let out_w = self
            .padding
            .output_len(input.width, self.kernel[1], self.strides[1]);
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            anyhow::bail!("window {:?} does not fit input {:?}", self.kernel, input);
        };
        let pad = [
            self.padding
                .pad_before(input.height, self.kernel[0], self.strides[0]),
            self.padding
                .pad_before(input.width, self.kernel[1], self.strides[1]),
        ];
        Ok((Hwc::new(out_h, out_w, channels), pad))
    }

    /// Input coordinate for an output position and kernel offset, or `None`
    /// when it lands in padding.
    #[inline]
    fn source(out: usize, k: usize, stride: usize, pad: usize, len: usize) -> Option<usize> {
        (out * stride + k).checked_sub(pad).filter(|i| *i < len)
    }
}

/// Transpose a `[kh, kw, in, out]` kernel into `[out, kh, kw, in]`.
pub fn hwio_to_ohwi(kernel: &[f32], dims: [usize; 4]) -> Result<Vec<f32>> {
    let [kh, kw, cin, cout] = dims;
    ensure!(
        kernel.len() == kh * kw * cin * cout,
        "kernel has {} values, expected {:?}",
        kernel.len(),
        dims
    );
    let mut out = vec![0.0; kernel.len()];
    for y in 0..kh {
        for x in 0..kw {
            for i in 0..cin {
                for o in 0..cout {
                    out[((o * kh + y) * kw + x) * cin + i] = kernel[((y * kw + x) * cin + i) * cout + o];
                }
            }
        }
    }
    Ok(out)
}

/// 2-D convolution with an `[out, kh, kw, in]` filter.
pub fn conv2d(
    input: &FeatureMap,
    filter: &[f32],
    out_channels: usize,
    bias: Option<&[f32]>,
    window: Window,
    activation: Activation,
) -> Result<FeatureMap> {
    let cin = input.hwc.channels;
    let [kh, kw] = window.kernel;
    ensure!(
        filter.len() == out_channels * kh * kw * cin,
        "conv filter has {} values, expected {}x{}x{}x{}",
        filter.len(),
        out_channels,
        kh,
        kw,
        cin
    );
    if let Some(bias) = bias {
        ensure!(bias.len() == out_channels, "conv bias length mismatch");
    }

    let (out_hwc, pad) = window.output(input.hwc, out_channels)?;
    let mut data = output_buffer(input.batch, out_hwc)?;
    for n in 0..input.batch {
        for oy in 0..out_hwc.height {
            for ox in 0..out_hwc.width {
                for oc in 0..out_channels {
                    let mut acc = 0.0f32;
                    for ky in 0..kh {
                        let Some(iy) = Window::source(oy, ky, window.strides[0], pad[0], input.hwc.height) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(ix) = Window::source(ox, kx, window.strides[1], pad[1], input.hwc.width) else {
                                continue;
                            };
                            let w = &filter[((oc * kh + ky) * kw + kx) * cin..][..cin];
                            let base = input.index(n, iy, ix, 0);
                            for (ic, wv) in w.iter().enumerate() {
                                acc += input.data[base + ic] * wv;
                            }
                        }
                    }
                    if let Some(bias) = bias {
                        acc += bias[oc];
                    }
                    data.push(activation.apply(acc));
                }
            }
        }
    }
    FeatureMap::new(input.batch, out_hwc, data)
}

/// Depthwise convolution (multiplier 1) with a `[kh, kw, channels]` filter.
pub fn depthwise_conv2d(
    input: &FeatureMap,
    filter: &[f32],
    bias: Option<&[f32]>,
    window: Window,
    activation: Activation,
) -> Result<FeatureMap> {
    let channels = input.hwc.channels;
    let [kh, kw] = window.kernel;
    ensure!(
        filter.len() == kh * kw * channels,
        "depthwise filter has {} values, expected {}x{}x{}",
        filter.len(),
        kh,
        kw,
        channels
    );
    if let Some(bias) = bias {
        ensure!(bias.len() == channels, "depthwise bias length mismatch");
    }

    let (out_hwc, pad) = window.output(input.hwc, channels)?;
    let mut data = output_buffer(input.batch, out_hwc)?;
    for n in 0..input.batch {
        for oy in 0..out_hwc.height {
            for ox in 0..out_hwc.width {
                for c in 0..channels {
                    let mut acc = 0.0f32;
                    for ky in 0..kh {
                        let Some(iy) = Window::source(oy, ky, window.strides[0], pad[0], input.hwc.height) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(ix) = Window::source(ox, kx, window.strides[1], pad[1], input.hwc.width) else {
                                continue;
                            };
                            acc += input.at(n, iy, ix, c) * filter[(ky * kw + kx) * channels + c];
                        }
                    }
                    if let Some(bias) = bias {
                        acc += bias[c];
                    }
                    data.push(activation.apply(acc));
                }
            }
        }
    }
    FeatureMap::new(input.batch, out_hwc, data)
}

pub fn batch_norm(
    input: &FeatureMap,
    gamma: &[f32],
    beta: &[f32],
    mean: &[f32],
    variance: &[f32],
    epsilon: f32,
) -> Result<FeatureMap> {
    let channels = input.hwc.channels;
    for (name, v) in [("gamma", gamma), ("beta", beta), ("mean", mean), ("variance", variance)] {
        ensure!(v.len() == channels, "batch norm {name} has {} values, expected {channels}", v.len());
    }
    let scale = (0..channels)
        .map(|c| gamma[c] / (variance[c] + epsilon).sqrt())
        .collect::<Vec<_>>();
    let data = input
        .data
        .iter()
        .enumerate()
        .map(|(i, x)| {
            let c = i % channels;
            (x - mean[c]) * scale[c] + beta[c]
        })
        .collect();
    FeatureMap::new(input.batch, input.hwc, data)
}

pub fn activate(input: &FeatureMap, activation: Activation) -> FeatureMap {
    FeatureMap {
        batch: input.batch,
        hwc: input.hwc,
        data: input.data.iter().map(|x| activation.apply(*x)).collect(),
    }
}

pub fn add(lhs: &FeatureMap, rhs: &FeatureMap, activation: Activation) -> Result<FeatureMap> {
    ensure!(
        lhs.batch == rhs.batch && lhs.hwc == rhs.hwc,
        "add operands differ: {:?} vs {:?}",
        lhs.hwc,
        rhs.hwc
    );
    let data = lhs
        .data
        .iter()
        .zip(&rhs.data)
        .map(|(a, b)| activation.apply(a + b))
        .collect();
    FeatureMap::new(lhs.batch, lhs.hwc, data)
}

/// Concatenate along the channel axis.
pub fn concat_channels(inputs: &[&FeatureMap]) -> Result<FeatureMap> {
    let first = inputs.first().ok_or_else(|| anyhow::anyhow!("nothing to concatenate"))?;
    for fm in inputs {
        ensure!(
            fm.batch == first.batch
                && fm.hwc.height == first.hwc.height
                && fm.hwc.width == first.hwc.width,
            "concatenated inputs differ spatially"
        );
    }
    let channels = inputs.iter().map(|fm| fm.hwc.channels).sum();
    let hwc = Hwc::new(first.hwc.height, first.hwc.width, channels);
    let pixels = first.batch * first.hwc.height * first.hwc.width;
    let mut data = output_buffer(first.batch, hwc)?;
    for p in 0..pixels {
        for fm in inputs {
            let c = fm.hwc.channels;
            data.extend_from_slice(&fm.data[p * c..(p + 1) * c]);
        }
    }
    FeatureMap::new(first.batch, hwc, data)
}

pub fn max_pool2d(input: &FeatureMap, window: Window) -> Result<FeatureMap> {
    let channels = input.hwc.channels;
    let (out_hwc, pad) = window.output(input.hwc, channels)?;
    let [kh, kw] = window.kernel;
    let mut data = output_buffer(input.batch, out_hwc)?;
    for n in 0..input.batch {
        for oy in 0..out_hwc.height {
            for ox in 0..out_hwc.width {
                for c in 0..channels {
                    let mut best = f32::NEG_INFINITY;
                    for ky in 0..kh {
                        let Some(iy) = Window::source(oy, ky, window.strides[0], pad[0], input.hwc.height) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(ix) = Window::source(ox, kx, window.strides[1], pad[1], input.hwc.width) else {
                                continue;
                            };
                            best = best.max(input.at(n, iy, ix, c));
                        }
                    }
                    data.push(best);
                }
            }
        }
    }
    FeatureMap::new(input.batch, out_hwc, data)
}

#[derive(Clone, Copy, Debug)]
struct Taps {
    lower: usize,
    upper: usize,
    lerp: f32,
}

fn resize_taps(out_len: usize, in_len: usize, align_corners: bool, half_pixel_centers: bool) -> Vec<Taps> {
    (0..out_len)
        .map(|dst| {
            let src = if align_corners {
                if out_len > 1 {
                    // exact at both ends: dst = out_len - 1 maps to in_len - 1
                    (dst * (in_len - 1)) as f32 / (out_len - 1) as f32
                } else {
                    0.0
                }
            } else {
                let scale = in_len as f32 / out_len as f32;
                if half_pixel_centers {
                    (dst as f32 + 0.5) * scale - 0.5
                } else {
                    dst as f32 * scale
                }
            };
            let floor = src.floor();
            let lower = (floor.max(0.0) as usize).min(in_len - 1);
            let upper = (src.ceil().max(0.0) as usize).min(in_len - 1);
            Taps {
                lower,
                upper,
                lerp: src - floor,
            }
        })
        .collect()
}

/// Bilinear resize to `size = [height, width]`.
///
/// With `align_corners` the corner pixels of input and output coincide and
/// the interior is sampled at `dst * (in - 1) / (out - 1)`.
pub fn resize_bilinear(
    input: &FeatureMap,
    size: [usize; 2],
    align_corners: bool,
    half_pixel_centers: bool,
) -> Result<FeatureMap> {
    ensure!(size[0] > 0 && size[1] > 0, "resize target must be non-empty");
    ensure!(
        !(align_corners && half_pixel_centers),
        "align_corners and half_pixel_centers are mutually exclusive"
    );
    let channels = input.hwc.channels;
    let out_hwc = Hwc::new(size[0], size[1], channels);
    let mut data = output_buffer(input.batch, out_hwc)?;
    let ys = resize_taps(size[0], input.hwc.height, align_corners, half_pixel_centers);
    let xs = resize_taps(size[1], input.hwc.width, align_corners, half_pixel_centers);

    for n in 0..input.batch {
        for y in &ys {
            for x in &xs {
                for c in 0..channels {
                    let top_left = input.at(n, y.lower, x.lower, c);
                    let top_right = input.at(n, y.lower, x.upper, c);
                    let bottom_left = input.at(n, y.upper, x.lower, c);
                    let bottom_right = input.at(n, y.upper, x.upper, c);
                    let top = top_left + (top_right - top_left) * x.lerp;
                    let bottom = bottom_left + (bottom_right - bottom_left) * x.lerp;
                    data.push(top + (bottom - top) * y.lerp);
                }
            }
        }
    }
    FeatureMap::new(input.batch, out_hwc, data)
}

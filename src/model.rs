use crate::autograd::{ArcTensor1, ArcTensor4, Variable4};
use anyhow::{ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView3, ArrayView4, Ix4};
use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display},
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
    str::FromStr,
};

/// A trait for the forward pass.
///
/// Operations on [`Variable4`](crate::autograd::Variable)s with a node apply
/// backward ops via [`VariableBuilder`](crate::autograd::builder::VariableBuilder),
/// so that gradients flow back to the input image. Layer weights are plain
/// tensors without nodes and never accumulate gradients.
pub trait Forward {
    /// Computes the forward pass.
    ///
    /// **Errors**
    ///
    /// Returns an error if the input shape is incompatible with the layer.
    fn forward(&self, input: Variable4) -> Result<Variable4>;
}

/// The kind of a layer, used by layer selectors.
///
/// Rendered with the conventional model-zoo names (`"Conv2d"`, `"ReLU"`,
/// `"MaxPool2d"`, `"AvgPool2d"`) so that existing configurations port over.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// 2d convolution.
    Conv2,
    /// Rectified linear unit.
    Relu,
    /// 2d max pooling.
    MaxPool2,
    /// 2d mean pooling.
    AvgPool2,
}

impl Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Conv2 => "Conv2d",
            Self::Relu => "ReLU",
            Self::MaxPool2 => "MaxPool2d",
            Self::AvgPool2 => "AvgPool2d",
        };
        f.write_str(name)
    }
}

/// Unknown layer kind identifier.
#[derive(Debug, thiserror::Error)]
#[error("unknown layer kind {0:?}, expected one of \"Conv2d\", \"ReLU\", \"MaxPool2d\", \"AvgPool2d\"")]
pub struct UnknownLayerKind(pub String);

impl FromStr for LayerKind {
    type Err = UnknownLayerKind;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Conv2d" => Ok(Self::Conv2),
            "ReLU" => Ok(Self::Relu),
            "MaxPool2d" => Ok(Self::MaxPool2),
            "AvgPool2d" => Ok(Self::AvgPool2),
            _ => Err(UnknownLayerKind(s.to_string())),
        }
    }
}

/// Convolutional layer.
///
/// The kernel is initialized with a uniform distribution of (-a, a)
/// where a = sqrt(6 / (inputs * outputs)); pretrained weights are installed
/// with [`Network::load_weights`].
#[derive(Clone, Debug)]
pub struct Conv2 {
    kernel: ArcTensor4,
    bias: ArcTensor1,
    stride: [usize; 2],
    padding: [usize; 2],
}

impl Conv2 {
    /// Creates a new [`Conv2`] for `inputs`, `outputs`, and `kernel` size.
    ///
    /// Defaults:
    /// - strides: 1
    /// - padding: 0
    pub fn new(inputs: usize, outputs: usize, kernel: [usize; 2]) -> Self {
        let [kh, kw] = kernel;
        let a = (6. / (inputs as f32 * outputs as f32)).sqrt();
        let data = Uniform::new(-a, a)
            .sample_iter(&mut rand::thread_rng())
            .take(outputs * inputs * kh * kw)
            .collect::<Vec<_>>();
        let kernel = Array4::from_shape_vec((outputs, inputs, kh, kw), data)
            .unwrap()
            .into_shared();
        let bias = Array1::zeros(outputs).into_shared();
        Self {
            kernel,
            bias,
            stride: [1, 1],
            padding: [0, 0],
        }
    }
    /// Adds `stride`.
    pub fn with_stride(self, stride: [usize; 2]) -> Self {
        Self { stride, ..self }
    }
    /// Adds `padding`.
    pub fn with_padding(self, padding: [usize; 2]) -> Self {
        Self { padding, ..self }
    }
    /// The kernel dim (outputs, inputs, kh, kw).
    pub fn kernel_dim(&self) -> (usize, usize, usize, usize) {
        self.kernel.dim()
    }
}

impl Forward for Conv2 {
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (_, ic, ih, iw) = input.dim();
        let (_, kc, kh, kw) = self.kernel.dim();
        ensure!(
            ic == kc,
            "Conv2d expected {kc} input channels, got {ic} (input {:?}, kernel {:?})",
            input.shape(),
            self.kernel.shape()
        );
        let [ph, pw] = self.padding;
        ensure!(
            ih + 2 * ph >= kh && iw + 2 * pw >= kw,
            "Conv2d kernel {:?} larger than padded input {:?}",
            self.kernel.shape(),
            input.shape()
        );
        let value = conv2_host(
            input.value().view(),
            self.kernel.view(),
            self.bias.view(),
            self.stride,
            self.padding,
        );
        let mut builder = Variable4::builder();
        if let Some(node) = input.node() {
            let kernel = self.kernel.clone();
            let input_dim = input.raw_dim();
            let stride = self.stride;
            let padding = self.padding;
            builder.edge(node, move |output_grad| {
                Ok(
                    conv2_backward_input_host(
                        output_grad.view(),
                        kernel.view(),
                        input_dim,
                        stride,
                        padding,
                    )
                    .into_shared(),
                )
            });
        }
        Ok(builder.build(value.into_shared()))
    }
}

/// Rectified linear unit.
#[derive(Default, Clone, Copy, Debug)]
pub struct Relu;

impl Forward for Relu {
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let value = input.value().mapv(|x| x.max(0.)).into_shared();
        let mut builder = Variable4::builder();
        if let Some(node) = input.node() {
            let output = value.clone();
            builder.edge(node, move |output_grad| {
                let mut grad = output_grad.into_owned();
                grad.zip_mut_with(&output, |dx, y| {
                    if *y <= 0. {
                        *dx = 0.;
                    }
                });
                Ok(grad.into_shared())
            });
        }
        Ok(builder.build(value))
    }
}

/// Max pooling layer.
#[derive(Clone, Copy, Debug)]
pub struct MaxPool2 {
    kernel: [usize; 2],
    stride: [usize; 2],
}

impl MaxPool2 {
    /// Creates a new [`MaxPool2`] with `kernel` size and `stride`.
    pub fn new(kernel: [usize; 2], stride: [usize; 2]) -> Self {
        Self { kernel, stride }
    }
    /// The kernel size.
    pub fn kernel(&self) -> [usize; 2] {
        self.kernel
    }
    /// The stride.
    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }
}

impl Forward for MaxPool2 {
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (_, _, ih, iw) = input.dim();
        let [kh, kw] = self.kernel;
        ensure!(
            ih >= kh && iw >= kw,
            "MaxPool2d kernel {:?} larger than input {:?}",
            self.kernel,
            input.shape()
        );
        let (value, argmax) = max_pool2_host(input.value().view(), self.kernel, self.stride);
        let mut builder = Variable4::builder();
        if let Some(node) = input.node() {
            let input_dim = input.raw_dim();
            builder.edge(node, move |output_grad| {
                Ok(max_pool2_backward_host(output_grad.view(), &argmax, input_dim).into_shared())
            });
        }
        Ok(builder.build(value.into_shared()))
    }
}

/// Mean pooling layer.
#[derive(Clone, Copy, Debug)]
pub struct AvgPool2 {
    kernel: [usize; 2],
    stride: [usize; 2],
}

impl AvgPool2 {
    /// Creates a new [`AvgPool2`] with `kernel` size and `stride`.
    pub fn new(kernel: [usize; 2], stride: [usize; 2]) -> Self {
        Self { kernel, stride }
    }
}

impl Forward for AvgPool2 {
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        let (_, _, ih, iw) = input.dim();
        let [kh, kw] = self.kernel;
        ensure!(
            ih >= kh && iw >= kw,
            "AvgPool2d kernel {:?} larger than input {:?}",
            self.kernel,
            input.shape()
        );
        let value = avg_pool2_host(input.value().view(), self.kernel, self.stride);
        let mut builder = Variable4::builder();
        if let Some(node) = input.node() {
            let input_dim = input.raw_dim();
            let kernel = self.kernel;
            let stride = self.stride;
            builder.edge(node, move |output_grad| {
                Ok(
                    avg_pool2_backward_host(output_grad.view(), input_dim, kernel, stride)
                        .into_shared(),
                )
            });
        }
        Ok(builder.build(value.into_shared()))
    }
}

/// A layer of a [`Network`].
#[derive(Clone, Debug)]
pub enum Layer {
    /// See [`Conv2`].
    Conv2(Conv2),
    /// See [`Relu`].
    Relu(Relu),
    /// See [`MaxPool2`].
    MaxPool2(MaxPool2),
    /// See [`AvgPool2`].
    AvgPool2(AvgPool2),
}

impl Layer {
    /// The kind of the layer.
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Conv2(_) => LayerKind::Conv2,
            Self::Relu(_) => LayerKind::Relu,
            Self::MaxPool2(_) => LayerKind::MaxPool2,
            Self::AvgPool2(_) => LayerKind::AvgPool2,
        }
    }
}

impl Forward for Layer {
    fn forward(&self, input: Variable4) -> Result<Variable4> {
        match self {
            Self::Conv2(layer) => layer.forward(input),
            Self::Relu(layer) => layer.forward(input),
            Self::MaxPool2(layer) => layer.forward(input),
            Self::AvgPool2(layer) => layer.forward(input),
        }
    }
}

/// A sequential network of [`Layer`]s.
///
/// This is the convolutional trunk of a classification architecture; style
/// transfer only reads intermediate activations, so the classifier head is
/// not represented.
#[derive(Clone, Debug)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    /// Creates a network from `layers`.
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }
    /// The layers in traversal order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
    /// Counts the layer instances per kind.
    pub fn kind_counts(&self) -> BTreeMap<LayerKind, usize> {
        let mut counts = BTreeMap::new();
        for layer in self.layers.iter() {
            *counts.entry(layer.kind()).or_insert(0) += 1;
        }
        counts
    }
    /// Replaces every max pooling layer with mean pooling of the same geometry.
    ///
    /// Mean pooling produces smoother gradients for style reconstruction, per
    /// Gatys et al. 2015.
    pub fn replace_max_with_avg(mut self) -> Self {
        for layer in self.layers.iter_mut() {
            if let Layer::MaxPool2(pool) = layer {
                *layer = Layer::AvgPool2(AvgPool2::new(pool.kernel(), pool.stride()));
            }
        }
        self
    }
    /// Saves all conv weights to a gzipped little-endian blob file.
    ///
    /// **Errors**
    ///
    /// Returns an error if the file could not be written.
    pub fn save_weights(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = GzEncoder::new(
            BufWriter::new(File::create(path.as_ref())?),
            Compression::default(),
        );
        writer.write_u32::<LittleEndian>(WEIGHTS_MAGIC)?;
        let tensors: u32 = self
            .layers
            .iter()
            .filter(|x| matches!(x, Layer::Conv2(_)))
            .count() as u32
            * 2;
        writer.write_u32::<LittleEndian>(tensors)?;
        for layer in self.layers.iter() {
            if let Layer::Conv2(conv) = layer {
                write_tensor(&mut writer, conv.kernel.shape(), conv.kernel.iter())?;
                write_tensor(&mut writer, conv.bias.shape(), conv.bias.iter())?;
            }
        }
        writer.finish()?;
        Ok(())
    }
    /// Loads conv weights saved by [`save_weights`](Self::save_weights).
    ///
    /// **Errors**
    ///
    /// Returns an error if the file could not be read, or if the stored
    /// tensor shapes do not match this architecture.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut reader = GzDecoder::new(BufReader::new(File::open(path.as_ref())?));
        let magic = reader.read_u32::<LittleEndian>()?;
        ensure!(
            magic == WEIGHTS_MAGIC,
            "{:?} is not a weights file",
            path.as_ref()
        );
        let tensors = reader.read_u32::<LittleEndian>()? as usize;
        let expected = self
            .layers
            .iter()
            .filter(|x| matches!(x, Layer::Conv2(_)))
            .count()
            * 2;
        ensure!(
            tensors == expected,
            "weights file {:?} holds {tensors} tensors, architecture expects {expected}",
            path.as_ref()
        );
        for layer in self.layers.iter_mut() {
            if let Layer::Conv2(conv) = layer {
                let kernel = read_tensor(&mut reader)?;
                let (o, i, h, w) = conv.kernel.dim();
                ensure!(
                    kernel.0 == [o, i, h, w],
                    "kernel shape mismatch: file {:?}, architecture {:?}",
                    kernel.0,
                    conv.kernel.shape()
                );
                conv.kernel = Array4::from_shape_vec((o, i, h, w), kernel.1)?.into_shared();
                let bias = read_tensor(&mut reader)?;
                ensure!(
                    bias.0 == [o],
                    "bias shape mismatch: file {:?}, architecture {:?}",
                    bias.0,
                    conv.bias.shape()
                );
                conv.bias = Array1::from(bias.1).into_shared();
            }
        }
        Ok(())
    }
}

const WEIGHTS_MAGIC: u32 = 0x4e53_5457; // "NSTW"

fn write_tensor<'a, W: Write>(
    writer: &mut W,
    shape: &[usize],
    data: impl Iterator<Item = &'a f32>,
) -> Result<()> {
    writer.write_u32::<LittleEndian>(shape.len() as u32)?;
    for dim in shape {
        writer.write_u32::<LittleEndian>(*dim as u32)?;
    }
    for x in data {
        writer.write_f32::<LittleEndian>(*x)?;
    }
    Ok(())
}

fn read_tensor<R: Read>(reader: &mut R) -> Result<(Vec<usize>, Vec<f32>)> {
    let ndim = reader.read_u32::<LittleEndian>()? as usize;
    ensure!(ndim <= 4, "tensor rank {ndim} out of range");
    let mut shape = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        shape.push(reader.read_u32::<LittleEndian>()? as usize);
    }
    let len = shape.iter().product();
    let mut data = vec![0f32; len];
    reader.read_f32_into::<LittleEndian>(&mut data)?;
    Ok((shape, data))
}

/// The closed catalog of supported architectures.
pub const ARCHITECTURES: &[&str] = &["alexnet", "vgg11", "vgg13", "vgg16", "vgg19"];

/// Builds the architecture named by `id` with randomly initialized weights.
///
/// Returns [`None`] if `id` is not in [`ARCHITECTURES`].
pub fn build(id: &str) -> Option<Network> {
    match id {
        "alexnet" => Some(alexnet()),
        "vgg11" => Some(vgg(&[&[64], &[128], &[256, 256], &[512, 512], &[512, 512]])),
        "vgg13" => Some(vgg(&[
            &[64, 64],
            &[128, 128],
            &[256, 256],
            &[512, 512],
            &[512, 512],
        ])),
        "vgg16" => Some(vgg(&[
            &[64, 64],
            &[128, 128],
            &[256, 256, 256],
            &[512, 512, 512],
            &[512, 512, 512],
        ])),
        "vgg19" => Some(vgg(&[
            &[64, 64],
            &[128, 128],
            &[256, 256, 256, 256],
            &[512, 512, 512, 512],
            &[512, 512, 512, 512],
        ])),
        _ => None,
    }
}

fn vgg(blocks: &[&[usize]]) -> Network {
    let mut layers = Vec::new();
    let mut inputs = 3;
    for block in blocks {
        for &outputs in *block {
            layers.push(Layer::Conv2(
                Conv2::new(inputs, outputs, [3, 3]).with_padding([1, 1]),
            ));
            layers.push(Layer::Relu(Relu));
            inputs = outputs;
        }
        layers.push(Layer::MaxPool2(MaxPool2::new([2, 2], [2, 2])));
    }
    Network::new(layers)
}

fn alexnet() -> Network {
    Network::new(vec![
        Layer::Conv2(
            Conv2::new(3, 64, [11, 11])
                .with_stride([4, 4])
                .with_padding([2, 2]),
        ),
        Layer::Relu(Relu),
        Layer::MaxPool2(MaxPool2::new([3, 3], [2, 2])),
        Layer::Conv2(Conv2::new(64, 192, [5, 5]).with_padding([2, 2])),
        Layer::Relu(Relu),
        Layer::MaxPool2(MaxPool2::new([3, 3], [2, 2])),
        Layer::Conv2(Conv2::new(192, 384, [3, 3]).with_padding([1, 1])),
        Layer::Relu(Relu),
        Layer::Conv2(Conv2::new(384, 256, [3, 3]).with_padding([1, 1])),
        Layer::Relu(Relu),
        Layer::Conv2(Conv2::new(256, 256, [3, 3]).with_padding([1, 1])),
        Layer::Relu(Relu),
        Layer::MaxPool2(MaxPool2::new([3, 3], [2, 2])),
    ])
}

fn pooled_extent(input: usize, kernel: usize, stride: usize) -> usize {
    (input - kernel) / stride + 1
}

fn conv_extent(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - kernel) / stride + 1
}

fn im2col(
    x: ArrayView3<f32>,
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
) -> Array2<f32> {
    let (c, h, w) = x.dim();
    let [kh, kw] = kernel;
    let [sh, sw] = stride;
    let [ph, pw] = padding;
    let oh = conv_extent(h, kh, sh, ph);
    let ow = conv_extent(w, kw, sw, pw);
    let mut cols = Array2::zeros((c * kh * kw, oh * ow));
    for ci in 0..c {
        for ky in 0..kh {
            for kx in 0..kw {
                let row = (ci * kh + ky) * kw + kx;
                let mut row_view = cols.row_mut(row);
                for oy in 0..oh {
                    let iy = (oy * sh + ky) as isize - ph as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for ox in 0..ow {
                        let ix = (ox * sw + kx) as isize - pw as isize;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        row_view[oy * ow + ox] = x[(ci, iy as usize, ix as usize)];
                    }
                }
            }
        }
    }
    cols
}

fn col2im(
    cols: &Array2<f32>,
    input_dim: (usize, usize, usize),
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
) -> ndarray::Array3<f32> {
    let (c, h, w) = input_dim;
    let [kh, kw] = kernel;
    let [sh, sw] = stride;
    let [ph, pw] = padding;
    let oh = conv_extent(h, kh, sh, ph);
    let ow = conv_extent(w, kw, sw, pw);
    let mut x = ndarray::Array3::zeros(input_dim);
    for ci in 0..c {
        for ky in 0..kh {
            for kx in 0..kw {
                let row = (ci * kh + ky) * kw + kx;
                let row_view = cols.row(row);
                for oy in 0..oh {
                    let iy = (oy * sh + ky) as isize - ph as isize;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for ox in 0..ow {
                        let ix = (ox * sw + kx) as isize - pw as isize;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        x[(ci, iy as usize, ix as usize)] += row_view[oy * ow + ox];
                    }
                }
            }
        }
    }
    x
}

fn conv2_host(
    x: ArrayView4<f32>,
    kernel: ArrayView4<f32>,
    bias: ArrayView1<f32>,
    stride: [usize; 2],
    padding: [usize; 2],
) -> Array4<f32> {
    let (batch, _, h, w) = x.dim();
    let (oc, ic, kh, kw) = kernel.dim();
    let [sh, sw] = stride;
    let [ph, pw] = padding;
    let oh = conv_extent(h, kh, sh, ph);
    let ow = conv_extent(w, kw, sw, pw);
    let kernel2 = kernel.into_shape((oc, ic * kh * kw)).unwrap();
    let mut y = Array4::zeros((batch, oc, oh, ow));
    for b in 0..batch {
        let cols = im2col(x.index_axis(ndarray::Axis(0), b), [kh, kw], stride, padding);
        let mut y2 = kernel2.dot(&cols);
        for (mut row, bias) in y2.outer_iter_mut().zip(bias.iter()) {
            row += *bias;
        }
        y.index_axis_mut(ndarray::Axis(0), b)
            .into_shape((oc, oh * ow))
            .unwrap()
            .assign(&y2);
    }
    y
}

fn conv2_backward_input_host(
    dy: ArrayView4<f32>,
    kernel: ArrayView4<f32>,
    input_dim: Ix4,
    stride: [usize; 2],
    padding: [usize; 2],
) -> Array4<f32> {
    let (batch, _, oh, ow) = dy.dim();
    let (oc, ic, kh, kw) = kernel.dim();
    let kernel2 = kernel.into_shape((oc, ic * kh * kw)).unwrap();
    let mut dx = Array4::zeros(input_dim);
    for b in 0..batch {
        let dy2 = dy
            .index_axis(ndarray::Axis(0), b)
            .into_shape((oc, oh * ow))
            .unwrap();
        let dcols = kernel2.t().dot(&dy2);
        let (_, c, h, w) = dx.dim();
        dx.index_axis_mut(ndarray::Axis(0), b)
            .assign(&col2im(&dcols, (c, h, w), [kh, kw], stride, padding));
    }
    dx
}

fn max_pool2_host(
    x: ArrayView4<f32>,
    kernel: [usize; 2],
    stride: [usize; 2],
) -> (Array4<f32>, Array4<usize>) {
    let (batch, c, h, w) = x.dim();
    let [kh, kw] = kernel;
    let [sh, sw] = stride;
    let oh = pooled_extent(h, kh, sh);
    let ow = pooled_extent(w, kw, sw);
    let mut y = Array4::zeros((batch, c, oh, ow));
    let mut argmax = Array4::zeros((batch, c, oh, ow));
    for b in 0..batch {
        for ci in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut max = f32::NEG_INFINITY;
                    let mut at = 0;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            let (iy, ix) = (oy * sh + ky, ox * sw + kx);
                            let value = x[(b, ci, iy, ix)];
                            if value > max {
                                max = value;
                                at = iy * w + ix;
                            }
                        }
                    }
                    y[(b, ci, oy, ox)] = max;
                    argmax[(b, ci, oy, ox)] = at;
                }
            }
        }
    }
    (y, argmax)
}

fn max_pool2_backward_host(
    dy: ArrayView4<f32>,
    argmax: &Array4<usize>,
    input_dim: Ix4,
) -> Array4<f32> {
    let mut dx = Array4::zeros(input_dim);
    let w = dx.dim().3;
    for ((b, c, oy, ox), dy) in dy.indexed_iter() {
        let at = argmax[(b, c, oy, ox)];
        dx[(b, c, at / w, at % w)] += *dy;
    }
    dx
}

fn avg_pool2_host(x: ArrayView4<f32>, kernel: [usize; 2], stride: [usize; 2]) -> Array4<f32> {
    let (batch, c, h, w) = x.dim();
    let [kh, kw] = kernel;
    let [sh, sw] = stride;
    let oh = pooled_extent(h, kh, sh);
    let ow = pooled_extent(w, kw, sw);
    let scale = 1. / (kh * kw) as f32;
    let mut y = Array4::zeros((batch, c, oh, ow));
    for b in 0..batch {
        for ci in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut sum = 0f32;
                    for ky in 0..kh {
                        for kx in 0..kw {
                            sum += x[(b, ci, oy * sh + ky, ox * sw + kx)];
                        }
                    }
                    y[(b, ci, oy, ox)] = scale * sum;
                }
            }
        }
    }
    y
}

fn avg_pool2_backward_host(
    dy: ArrayView4<f32>,
    input_dim: Ix4,
    kernel: [usize; 2],
    stride: [usize; 2],
) -> Array4<f32> {
    let [kh, kw] = kernel;
    let [sh, sw] = stride;
    let scale = 1. / (kh * kw) as f32;
    let mut dx = Array4::zeros(input_dim);
    for ((b, c, oy, ox), dy) in dy.indexed_iter() {
        for ky in 0..kh {
            for kx in 0..kw {
                dx[(b, c, oy * sh + ky, ox * sw + kx)] += scale * *dy;
            }
        }
    }
    dx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Variable;
    use approx::assert_relative_eq;
    use ndarray::{arr0, Array4};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_input(rng: &mut StdRng, dim: (usize, usize, usize, usize)) -> Array4<f32> {
        let len = dim.0 * dim.1 * dim.2 * dim.3;
        let data = (0..len).map(|_| rng.gen_range(-1f32..1.)).collect();
        Array4::from_shape_vec(dim, data).unwrap()
    }

    // Scalar objective sum(y) used for gradient checks.
    fn sum_output(layer: &Layer, x: &Array4<f32>) -> f32 {
        layer
            .forward(Variable::from(x.clone()))
            .unwrap()
            .value()
            .sum()
    }

    fn backward_grad(layer: &Layer, x: &Array4<f32>) -> Array4<f32> {
        let input = Variable::with_grad(x.clone().into_shared());
        let output = layer.forward(input.clone()).unwrap();
        let mut builder = crate::autograd::Variable0::builder();
        if let Some(node) = output.node() {
            let dim = output.raw_dim();
            builder.edge(node, move |output_grad: crate::autograd::ArcTensor0| {
                Ok(Array4::from_elem(dim, output_grad[()]).into_shared())
            });
        }
        let loss = builder.build(arr0(output.value().sum()).into_shared());
        loss.backward().unwrap();
        input.grad().unwrap().to_owned()
    }

    fn check_gradient(layer: Layer, dim: (usize, usize, usize, usize), tolerance: f32) {
        let mut rng = StdRng::seed_from_u64(0);
        let mut x = random_input(&mut rng, dim);
        let analytic = backward_grad(&layer, &x);
        let epsilon = 1e-2;
        for index in [(0, 0, 0, 0), (0, dim.1 - 1, dim.2 / 2, dim.3 - 1)] {
            let x0 = x[index];
            x[index] = x0 + epsilon;
            let up = sum_output(&layer, &x);
            x[index] = x0 - epsilon;
            let down = sum_output(&layer, &x);
            x[index] = x0;
            let numeric = (up - down) / (2. * epsilon);
            assert_relative_eq!(analytic[index], numeric, epsilon = tolerance);
        }
    }

    #[test]
    fn conv2_gradient() {
        let layer = Layer::Conv2(Conv2::new(2, 3, [3, 3]).with_padding([1, 1]));
        check_gradient(layer, (1, 2, 6, 5), 1e-2);
    }

    #[test]
    fn conv2_strided_gradient() {
        let layer = Layer::Conv2(
            Conv2::new(2, 2, [3, 3])
                .with_stride([2, 2])
                .with_padding([1, 1]),
        );
        check_gradient(layer, (2, 2, 7, 7), 1e-2);
    }

    #[test]
    fn avg_pool2_gradient() {
        let layer = Layer::AvgPool2(AvgPool2::new([2, 2], [2, 2]));
        check_gradient(layer, (1, 2, 4, 4), 1e-3);
    }

    #[test]
    fn relu_masks_negative() {
        let layer = Layer::Relu(Relu);
        let x = Array4::from_shape_vec((1, 1, 1, 4), vec![-1f32, 2., -0.5, 3.]).unwrap();
        let grad = backward_grad(&layer, &x);
        assert_eq!(
            grad.iter().copied().collect::<Vec<_>>(),
            vec![0., 1., 0., 1.]
        );
    }

    #[test]
    fn max_pool2_routes_to_argmax() {
        let layer = Layer::MaxPool2(MaxPool2::new([2, 2], [2, 2]));
        let x = Array4::from_shape_vec(
            (1, 1, 2, 4),
            vec![1f32, 5., 2., 0., 3., 4., 8., 7.],
        )
        .unwrap();
        let output = layer.forward(Variable::from(x.clone())).unwrap();
        assert_eq!(
            output.value().iter().copied().collect::<Vec<_>>(),
            vec![5., 8.]
        );
        let grad = backward_grad(&layer, &x);
        assert_eq!(
            grad.iter().copied().collect::<Vec<_>>(),
            vec![0., 1., 0., 0., 0., 0., 1., 0.]
        );
    }

    #[test]
    fn conv2_shape_mismatch_rejected() {
        let layer = Conv2::new(3, 4, [3, 3]);
        let x = Array4::<f32>::zeros((1, 2, 8, 8));
        assert!(layer.forward(Variable::from(x)).is_err());
    }

    #[test]
    fn pooling_substitution_preserves_geometry() {
        let network = build("vgg11").unwrap().replace_max_with_avg();
        assert_eq!(network.kind_counts().get(&LayerKind::MaxPool2), None);
        assert_eq!(network.kind_counts()[&LayerKind::AvgPool2], 5);
        let x = Array4::<f32>::zeros((1, 3, 32, 32));
        let mut input = Variable::from(x);
        for layer in network.layers() {
            input = layer.forward(input).unwrap();
        }
        assert_eq!(input.shape(), [1, 512, 1, 1]);
    }

    #[test]
    fn weights_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alexnet.nstw");
        let network = build("alexnet").unwrap();
        network.save_weights(&path).unwrap();
        let mut restored = build("alexnet").unwrap();
        restored.load_weights(&path).unwrap();
        for (a, b) in network.layers().iter().zip(restored.layers()) {
            if let (Layer::Conv2(a), Layer::Conv2(b)) = (a, b) {
                assert_eq!(a.kernel, b.kernel);
                assert_eq!(a.bias, b.bias);
            }
        }
    }

    #[test]
    fn load_weights_rejects_architecture_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vgg11.nstw");
        build("vgg11").unwrap().save_weights(&path).unwrap();
        assert!(build("vgg19").unwrap().load_weights(&path).is_err());
    }
}

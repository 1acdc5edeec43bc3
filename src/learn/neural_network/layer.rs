use super::{
    autograd::{Parameter, ParameterD, Variable, VariableD},
    optimizer::Optimizer,
};
use crate::{
    error::Error,
    ops::{col2im_conv2, im2col_conv2, Col2ImConv2Options, Im2ColConv2Options},
    result::Result,
};
use anyhow::bail;
#[doc(hidden)]
pub use dcgan_derive::*;
use ndarray::{
    Array, Array1, Array2, Array4, ArrayView2, ArrayView4, ArcArray, Axis, Ix1, Ix4, IxDyn, Zip,
};
use parking_lot::Mutex;
use rand::{distributions::Uniform, Rng};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// A trait for networks and layers.
///
/// [`Layer`] provides reflection and utility methods.
///
/// # Derive
/// [`Layer`] should be [derived](dcgan_derive).
///
/// # serde
/// Implement [`Serialize`](serde::Serialize) and [`Deserialize`](serde::Deserialize) for saving and loading the layer. This can generally be [derived](<https://serde.rs/derive.html>).
pub trait Layer: Forward + Send + Sync + 'static {
    /// The number of parameters.
    ///
    /// This is the length of [`.parameters()`](Self::parameters()).
    fn parameters_len(&self) -> usize {
        0
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {}
    /// Enumerates the parameters of the layer, including child layers.
    fn parameters(&self) -> Vec<ParameterD> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters(&mut parameters);
        parameters
    }
    #[doc(hidden)]
    #[allow(unused)]
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {}
    /// Enumerates mutable references to the parameters of the layer, including child layers.
    fn parameters_mut(&mut self) -> Vec<&mut ParameterD> {
        let mut parameters = Vec::with_capacity(self.parameters_len());
        self.collect_parameters_mut(&mut parameters);
        parameters
    }
    /// The total number of trainable scalars.
    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(Parameter::len).sum()
    }
    /// Prepares the layer for training or evaluation.
    ///
    /// See [`Parameter::set_training()`].
    fn set_training(&mut self, training: bool) -> Result<()> {
        for parameter in self.parameters_mut() {
            parameter.set_training(training);
        }
        Ok(())
    }
    /// Clears the gradients of all parameters.
    fn zero_grad(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.zero_grad();
        }
    }
    /// Updates the layer with the optimizer.
    ///
    /// Call this method on the network after one or more backward passes.
    fn update<O: Optimizer>(&mut self, learning_rate: f32, optimizer: &O) -> Result<()>
    where
        Self: Sized,
    {
        for parameter in self.parameters_mut() {
            optimizer.update(learning_rate, parameter)?;
        }
        Ok(())
    }
}

/// A trait for the forward pass.
///
/// [`Layer`]'s implement [`Forward`], which computes the output as a function of the input.
///
/// # Derive
/// [`Forward`] can be [derived](dcgan_derive) for sequential layers (ie typical feed-foward networks).
pub trait Forward {
    /// Computes the forward pass.
    ///
    /// # Autograd
    /// Operations on [`Variable`] are expected to apply backward ops via [`VariableBuilder`](super::autograd::builder::VariableBuilder).
    ///
    /// **Errors**
    ///
    /// Returns an error if the operation could not be performed. Generally the implemenation should return an error instead of panicking.
    fn forward(&self, input: VariableD) -> Result<VariableD>;
}

impl<L: Layer> Layer for Vec<L> {
    fn parameters_len(&self) -> usize {
        self.iter().map(Layer::parameters_len).sum()
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        for layer in self.iter() {
            layer.collect_parameters(parameters);
        }
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        for layer in self.iter_mut() {
            layer.collect_parameters_mut(parameters);
        }
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        for layer in self.iter_mut() {
            layer.set_training(training)?;
        }
        Ok(())
    }
}

impl<L: Forward> Forward for Vec<L> {
    fn forward(&self, mut input: VariableD) -> Result<VariableD> {
        for layer in self.iter() {
            input = layer.forward(input)?;
        }
        Ok(input)
    }
}

/// Uniform (-a, a) where a = 1 / sqrt(fan_in).
fn fan_in_uniform(fan_in: usize) -> Uniform<f32> {
    let a = 1. / (fan_in.max(1) as f32).sqrt();
    Uniform::new_inclusive(-a, a)
}

fn sample_parameter<R: Rng + ?Sized>(shape: &[usize], fan_in: usize, rng: &mut R) -> ParameterD {
    let distribution = fan_in_uniform(fan_in);
    Parameter::from(Array::from_shape_simple_fn(shape, || rng.sample(distribution)))
}

/// [B, C, H, W] => [B * H * W, C]
fn channels_last(x: ArrayView4<f32>) -> Result<Array2<f32>> {
    let (bs, c, h, w) = x.dim();
    Ok(x.permuted_axes([0, 2, 3, 1])
        .as_standard_layout()
        .into_owned()
        .into_shape([bs * h * w, c])?)
}

/// [B * H * W, C] => [B, C, H, W]
fn channels_first(x: Array2<f32>, [bs, h, w]: [usize; 3]) -> Result<Array4<f32>> {
    let c = x.dim().1;
    Ok(x.into_shape([bs, h, w, c])?
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned())
}

fn matrix(parameter: &ArcArray<f32, IxDyn>, rows: usize) -> Result<ArrayView2<f32>> {
    let cols = parameter.len() / rows.max(1);
    Ok(parameter.view().into_shape([rows, cols])?)
}

fn check_channels(op: &'static str, input: &VariableD, channels: usize) -> Result<()> {
    let shape = input.shape();
    if shape.len() != 4 || shape[1] != channels {
        let mut expected = shape.to_vec();
        if expected.len() > 1 {
            expected[1] = channels;
        }
        return Err(Error::shape_mismatch(op, &expected, shape).into());
    }
    Ok(())
}

/// Layer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Conv`] or a [`ConvTranspose`].
    #[derive(Clone, Debug)]
    pub struct ConvBuilder<T> {
        inputs: usize,
        outputs: usize,
        filter: usize,
        stride: usize,
        padding: usize,
        bias: bool,
        _m: std::marker::PhantomData<T>,
    }

    impl<T> ConvBuilder<T> {
        pub(super) fn new() -> Self {
            Self {
                inputs: 1,
                outputs: 1,
                filter: 1,
                stride: 1,
                padding: 0,
                bias: true,
                _m: std::marker::PhantomData,
            }
        }
        /// Input channels. Default is 1.
        pub fn inputs(self, inputs: usize) -> Self {
            Self { inputs, ..self }
        }
        /// Output channels. Default is 1.
        pub fn outputs(self, outputs: usize) -> Self {
            Self { outputs, ..self }
        }
        /// Square filter size. Default is 1.
        pub fn filter(self, filter: usize) -> Self {
            Self { filter, ..self }
        }
        /// Stride. Default is 1.
        pub fn stride(self, stride: usize) -> Self {
            Self { stride, ..self }
        }
        /// Zero padding. Default is 0.
        pub fn padding(self, padding: usize) -> Self {
            Self { padding, ..self }
        }
        /// Whether to add a bias. Default is true.
        pub fn bias(self, bias: bool) -> Self {
            Self { bias, ..self }
        }
        fn check(&self) -> Result<()> {
            if self.inputs == 0 || self.outputs == 0 || self.filter == 0 || self.stride == 0 {
                bail!(
                    "inputs {}, outputs {}, filter {} and stride {} must be positive!",
                    self.inputs,
                    self.outputs,
                    self.filter,
                    self.stride
                );
            }
            Ok(())
        }
    }

    impl ConvBuilder<Conv> {
        /// Builds the layer, sampling the parameters from `rng`.
        pub fn build<R: Rng + ?Sized>(self, rng: &mut R) -> Result<Conv> {
            self.check()?;
            let Self {
                inputs,
                outputs,
                filter,
                stride,
                padding,
                bias,
                ..
            } = self;
            let fan_in = inputs * filter * filter;
            let weight = sample_parameter(&[outputs, inputs, filter, filter], fan_in, rng);
            let bias = bias.then(|| sample_parameter(&[outputs], fan_in, rng));
            Ok(Conv {
                weight,
                bias,
                stride,
                padding,
            })
        }
    }

    impl ConvBuilder<ConvTranspose> {
        /// Builds the layer, sampling the parameters from `rng`.
        pub fn build<R: Rng + ?Sized>(self, rng: &mut R) -> Result<ConvTranspose> {
            self.check()?;
            let Self {
                inputs,
                outputs,
                filter,
                stride,
                padding,
                bias,
                ..
            } = self;
            let fan_in = outputs * filter * filter;
            let weight = sample_parameter(&[inputs, outputs, filter, filter], fan_in, rng);
            let bias = bias.then(|| sample_parameter(&[outputs], fan_in, rng));
            Ok(ConvTranspose {
                weight,
                bias,
                stride,
                padding,
            })
        }
    }
}
use builder::ConvBuilder;

/// Convolutional layer.
///
/// Input = [B, inputs, H, W].\
/// Weight = [outputs, inputs, filter, filter].\
/// Output = [B, outputs, OH, OW] where OH = (H + 2 * padding - filter) / stride + 1.
#[derive(Layer, Clone, Serialize, Deserialize)]
#[dcgan(crate)]
pub struct Conv {
    #[dcgan(parameter)]
    weight: ParameterD,
    #[dcgan(optional_parameter)]
    bias: Option<ParameterD>,
    stride: usize,
    padding: usize,
}

impl Conv {
    /// A builder for creating a [`Conv`].
    ///
    ///```
    /// # use dcgan::{learn::neural_network::layer::Conv, result::Result};
    /// # use rand::{rngs::StdRng, SeedableRng};
    /// # fn main() -> Result<()> {
    /// let conv = Conv::builder()
    ///     .inputs(3)
    ///     .outputs(64)
    ///     .filter(4)
    ///     .stride(2)
    ///     .padding(1)
    ///     .build(&mut StdRng::seed_from_u64(0))?;
    /// assert_eq!(conv.weight().shape(), &[64, 3, 4, 4]);
    /// # Ok(())
    /// # }
    ///```
    pub fn builder() -> ConvBuilder<Self> {
        ConvBuilder::new()
    }
    /// The weight.
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
    /// The bias.
    pub fn bias(&self) -> Option<&ParameterD> {
        self.bias.as_ref()
    }
    fn options(&self) -> Im2ColConv2Options {
        let filter = self.weight.shape()[2];
        Im2ColConv2Options {
            filter: [filter; 2],
            padding: [self.padding; 2],
            stride: [self.stride; 2],
        }
    }
}

impl Debug for Conv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Conv");
        builder.field("weight", &self.weight.shape());
        if let Some(bias) = self.bias.as_ref() {
            builder.field("bias", &bias.shape());
        }
        if self.stride != 1 {
            builder.field("stride", &self.stride);
        }
        if self.padding != 0 {
            builder.field("padding", &self.padding);
        }
        builder.finish()
    }
}

impl Forward for Conv {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        let (outputs, inputs) = (self.weight.shape()[0], self.weight.shape()[1]);
        check_channels("Conv", &input, inputs)?;
        let input = input.into_dimensionality::<Ix4>()?;
        let (bs, _, ih, iw) = input.dim();
        let options = self.options();
        let [oh, ow] = options.output_shape([ih, iw])?;
        let weight = self.weight.to_variable();
        let bias = self.bias.as_ref().map(Parameter::to_variable);
        let cols = im2col_conv2(input.value().view(), &options)?;
        let mut y = cols.dot(&matrix(weight.value(), outputs)?.t());
        if let Some(bias) = bias.as_ref() {
            y += &bias.value().view().into_dimensionality::<Ix1>()?;
        }
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let weight = weight.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let dy = channels_last(output_grad.view())?;
                let dcols = dy.dot(&matrix(&weight, outputs)?);
                let dx = col2im_conv2(
                    dcols.view(),
                    &Col2ImConv2Options {
                        shape: [oh, ow],
                        output_shape: [ih, iw],
                        filter: options.filter,
                        padding: options.padding,
                        stride: options.stride,
                    },
                )?;
                Ok(dx.into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let dim = weight.raw_dim();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let dy = channels_last(output_grad.view())?;
                Ok(dy.t().dot(&cols).into_shape(dim)?.into_shared())
            });
        }
        if let Some(node) = bias.as_ref().and_then(Variable::node) {
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                Ok(output_grad
                    .sum_axis(Axis(3))
                    .sum_axis(Axis(2))
                    .sum_axis(Axis(0))
                    .into_dyn()
                    .into_shared())
            });
        }
        let output = channels_first(y, [bs, oh, ow])?;
        Ok(builder.build(output.into_shared()).into_dyn())
    }
}

/// Transposed convolutional layer.
///
/// The adjoint of [`Conv`], used to upsample.\
/// Input = [B, inputs, H, W].\
/// Weight = [inputs, outputs, filter, filter].\
/// Output = [B, outputs, OH, OW] where OH = (H - 1) * stride - 2 * padding + filter.
#[derive(Layer, Clone, Serialize, Deserialize)]
#[dcgan(crate)]
pub struct ConvTranspose {
    #[dcgan(parameter)]
    weight: ParameterD,
    #[dcgan(optional_parameter)]
    bias: Option<ParameterD>,
    stride: usize,
    padding: usize,
}

impl ConvTranspose {
    /// A builder for creating a [`ConvTranspose`].
    pub fn builder() -> ConvBuilder<Self> {
        ConvBuilder::new()
    }
    /// The weight.
    pub fn weight(&self) -> &ParameterD {
        &self.weight
    }
    /// The bias.
    pub fn bias(&self) -> Option<&ParameterD> {
        self.bias.as_ref()
    }
    fn options(&self) -> Im2ColConv2Options {
        let filter = self.weight.shape()[2];
        Im2ColConv2Options {
            filter: [filter; 2],
            padding: [self.padding; 2],
            stride: [self.stride; 2],
        }
    }
}

impl Debug for ConvTranspose {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("ConvTranspose");
        builder.field("weight", &self.weight.shape());
        if let Some(bias) = self.bias.as_ref() {
            builder.field("bias", &bias.shape());
        }
        if self.stride != 1 {
            builder.field("stride", &self.stride);
        }
        if self.padding != 0 {
            builder.field("padding", &self.padding);
        }
        builder.finish()
    }
}

impl Forward for ConvTranspose {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        let inputs = self.weight.shape()[0];
        let outputs = self.weight.shape()[1];
        check_channels("ConvTranspose", &input, inputs)?;
        let input = input.into_dimensionality::<Ix4>()?;
        let (bs, _, ih, iw) = input.dim();
        let options = self.options();
        let [oh, ow] = options.transposed_output_shape([ih, iw])?;
        let col2im_options = Col2ImConv2Options {
            shape: [ih, iw],
            output_shape: [oh, ow],
            filter: options.filter,
            padding: options.padding,
            stride: options.stride,
        };
        let weight = self.weight.to_variable();
        let bias = self.bias.as_ref().map(Parameter::to_variable);
        let x = channels_last(input.value().view())?;
        let cols = x.dot(&matrix(weight.value(), inputs)?);
        let mut y = col2im_conv2(cols.view(), &col2im_options)?;
        if let Some(bias) = bias.as_ref() {
            let bias = bias.value().view().into_shape([1, outputs, 1, 1])?;
            y += &bias;
        }
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let weight = weight.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let dcols = im2col_conv2(output_grad.view(), &options)?;
                let dx = dcols.dot(&matrix(&weight, inputs)?.t());
                Ok(channels_first(dx, [bs, ih, iw])?.into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let dim = weight.raw_dim();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let dcols = im2col_conv2(output_grad.view(), &options)?;
                Ok(x.t().dot(&dcols).into_shape(dim)?.into_shared())
            });
        }
        if let Some(node) = bias.as_ref().and_then(Variable::node) {
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                Ok(output_grad
                    .sum_axis(Axis(3))
                    .sum_axis(Axis(2))
                    .sum_axis(Axis(0))
                    .into_dyn()
                    .into_shared())
            });
        }
        Ok(builder.build(y.into_shared()).into_dyn())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RunningStats {
    mean: Array1<f32>,
    var: Array1<f32>,
}

/// Batch normalization over the channels of [B, C, H, W] inputs.
///
/// When training, normalizes with the mean and biased variance of the batch and updates the
/// running averages with `momentum`. The running variance uses the unbiased estimate.
/// Otherwise normalizes with the running averages.
#[derive(Serialize, Deserialize)]
pub struct BatchNorm {
    weight: ParameterD,
    bias: ParameterD,
    running_stats: Mutex<RunningStats>,
    momentum: f32,
    eps: f32,
    #[serde(skip)]
    training: bool,
}

impl BatchNorm {
    /// Creates a [`BatchNorm`] for `channels`.
    ///
    /// The weight is 1, the bias is 0, and the running mean and variance are 0 and 1.\
    /// Defaults:
    /// - momentum: 0.1
    /// - eps: 1e-5
    pub fn from_channels(channels: usize) -> Self {
        Self {
            weight: Parameter::from(Array::ones(channels).into_dyn()),
            bias: Parameter::from(Array::zeros(channels).into_dyn()),
            running_stats: Mutex::new(RunningStats {
                mean: Array::zeros(channels),
                var: Array::ones(channels),
            }),
            momentum: 0.1,
            eps: 1e-5,
            training: false,
        }
    }
    /// The number of channels.
    pub fn channels(&self) -> usize {
        self.weight.len()
    }
    /// Whether batch statistics are used.
    pub fn is_training(&self) -> bool {
        self.training
    }
    /// The running mean.
    pub fn running_mean(&self) -> Array1<f32> {
        self.running_stats.lock().mean.clone()
    }
    /// The running variance.
    pub fn running_var(&self) -> Array1<f32> {
        self.running_stats.lock().var.clone()
    }
    fn batch_stats(&self, x: ArrayView2<f32>) -> (Array1<f32>, Array1<f32>) {
        let n = x.nrows();
        let mean = x.sum_axis(Axis(0)) / n as f32;
        let mut var = Array1::zeros(mean.len());
        for row in x.rows() {
            Zip::from(&mut var)
                .and(&row)
                .and(&mean)
                .for_each(|var, x, mean| *var += (x - mean) * (x - mean));
        }
        var /= n as f32;
        let unbiased = if n > 1 {
            n as f32 / (n - 1) as f32
        } else {
            1.
        };
        let momentum = self.momentum;
        let mut running_stats = self.running_stats.lock();
        Zip::from(&mut running_stats.mean)
            .and(&mean)
            .for_each(|running, x| *running = (1. - momentum) * *running + momentum * x);
        Zip::from(&mut running_stats.var)
            .and(&var)
            .for_each(|running, x| *running = (1. - momentum) * *running + momentum * x * unbiased);
        (mean, var)
    }
}

impl Clone for BatchNorm {
    fn clone(&self) -> Self {
        Self {
            weight: self.weight.clone(),
            bias: self.bias.clone(),
            running_stats: Mutex::new(self.running_stats.lock().clone()),
            momentum: self.momentum,
            eps: self.eps,
            training: self.training,
        }
    }
}

impl Debug for BatchNorm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BatchNorm")
            .field("channels", &self.channels())
            .field("momentum", &self.momentum)
            .field("eps", &self.eps)
            .field("training", &self.training)
            .finish()
    }
}

impl Layer for BatchNorm {
    fn parameters_len(&self) -> usize {
        2
    }
    fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
        parameters.extend([self.weight.clone(), self.bias.clone()]);
    }
    fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
        parameters.extend([&mut self.weight, &mut self.bias]);
    }
    fn set_training(&mut self, training: bool) -> Result<()> {
        self.weight.set_training(training);
        self.bias.set_training(training);
        self.training = training;
        Ok(())
    }
}

impl Forward for BatchNorm {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        check_channels("BatchNorm", &input, self.channels())?;
        let input = input.into_dimensionality::<Ix4>()?;
        let (bs, _, h, w) = input.dim();
        let x = channels_last(input.value().view())?;
        let (mean, var) = if self.training {
            self.batch_stats(x.view())
        } else {
            let running_stats = self.running_stats.lock();
            (running_stats.mean.clone(), running_stats.var.clone())
        };
        let eps = self.eps;
        let inv_std = var.mapv(|var| 1. / (var + eps).sqrt());
        let weight = self.weight.to_variable();
        let bias = self.bias.to_variable();
        let gamma = weight.value().view().into_dimensionality::<Ix1>()?.to_owned();
        let beta = bias.value().view().into_dimensionality::<Ix1>()?;
        let x_hat = (x - &mean) * &inv_std;
        let y = &x_hat * &gamma + &beta;
        let x_hat = x_hat.into_shared();
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let x_hat = x_hat.clone();
            let training = self.training;
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let dy = channels_last(output_grad.view())?;
                let scale = &gamma * &inv_std;
                let dx = if training {
                    let n = dy.nrows() as f32;
                    let dy_sum = dy.sum_axis(Axis(0));
                    let dy_x_hat_sum = (&dy * &x_hat).sum_axis(Axis(0));
                    (dy * n - &dy_sum - &x_hat * &dy_x_hat_sum) * &(scale / n)
                } else {
                    dy * &scale
                };
                Ok(channels_first(dx, [bs, h, w])?.into_shared())
            });
        }
        if let Some(node) = weight.node() {
            let x_hat = x_hat.clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let dy = channels_last(output_grad.view())?;
                Ok((dy * &x_hat).sum_axis(Axis(0)).into_dyn().into_shared())
            });
        }
        if let Some(node) = bias.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, Ix4>| {
                let dy = channels_last(output_grad.view())?;
                Ok(dy.sum_axis(Axis(0)).into_dyn().into_shared())
            });
        }
        let output = channels_first(y, [bs, h, w])?;
        Ok(builder.build(output.into_shared()).into_dyn())
    }
}

/// Applies `f` elementwise, `df(x, y)` is the derivative at input `x` with output `y`.
fn elementwise<F, G>(input: VariableD, f: F, df: G) -> VariableD
where
    F: Fn(f32) -> f32,
    G: Fn(f32, f32) -> f32 + Send + Sync + 'static,
{
    let output = input.value().mapv(f).into_shared();
    let mut builder = Variable::builder();
    if let Some(node) = input.node() {
        let x = input.value().clone();
        let y = output.clone();
        builder.edge(node, move |output_grad: ArcArray<f32, IxDyn>| {
            let mut dx = output_grad.into_owned();
            Zip::from(&mut dx)
                .and(&x)
                .and(&y)
                .for_each(|dx, x, y| *dx *= df(*x, *y));
            Ok(dx.into_shared())
        });
    }
    builder.build(output)
}

/// Relu.
#[derive(Default, Layer, Clone, Copy, Debug, Serialize, Deserialize)]
#[dcgan(crate)]
pub struct Relu;

impl Forward for Relu {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(elementwise(
            input,
            |x| x.max(0.),
            |x, _| if x > 0. { 1. } else { 0. },
        ))
    }
}

/// Leaky Relu, x if x > 0 else `negative_slope * x`.
#[derive(Layer, Clone, Copy, Debug, Serialize, Deserialize)]
#[dcgan(crate)]
pub struct LeakyRelu {
    negative_slope: f32,
}

impl LeakyRelu {
    /// Creates a [`LeakyRelu`] with `negative_slope`.
    pub fn new(negative_slope: f32) -> Self {
        Self { negative_slope }
    }
    /// The slope for negative inputs.
    pub fn negative_slope(&self) -> f32 {
        self.negative_slope
    }
}

impl Default for LeakyRelu {
    /// Negative slope of 0.2.
    fn default() -> Self {
        Self::new(0.2)
    }
}

impl Forward for LeakyRelu {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        let a = self.negative_slope;
        Ok(elementwise(
            input,
            move |x| if x > 0. { x } else { a * x },
            move |x, _| if x > 0. { 1. } else { a },
        ))
    }
}

/// Tanh.
#[derive(Default, Layer, Clone, Copy, Debug, Serialize, Deserialize)]
#[dcgan(crate)]
pub struct Tanh;

impl Forward for Tanh {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(elementwise(input, f32::tanh, |_, y| 1. - y * y))
    }
}

/// Sigmoid.
#[derive(Default, Layer, Clone, Copy, Debug, Serialize, Deserialize)]
#[dcgan(crate)]
pub struct Sigmoid;

impl Forward for Sigmoid {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(elementwise(
            input,
            |x| 1. / (1. + (-x).exp()),
            |_, y| y * (1. - y),
        ))
    }
}

/// Flattens [B, ..] to [B, N].
#[derive(Default, Layer, Clone, Copy, Debug, Serialize, Deserialize)]
#[dcgan(crate)]
pub struct Flatten;

impl Forward for Flatten {
    fn forward(&self, input: VariableD) -> Result<VariableD> {
        Ok(input.flatten()?.into_dyn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::Variable0;
    use approx::assert_relative_eq;
    use ndarray::{ArrayD, Ix0};
    use rand::{rngs::StdRng, SeedableRng};

    fn weighted_sum(input: VariableD, weights: ArcArray<f32, IxDyn>) -> Variable0 {
        let mut builder = Variable::builder();
        let value = (input.value() * &weights).sum();
        if let Some(node) = input.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                Ok(weights.mapv(|w| w * output_grad[()]).into_shared())
            });
        }
        builder.build(Array::from_elem((), value).into_shared())
    }

    /// Values in (-1, -0.1] and [0.1, 1), away from activation kinks.
    fn random(shape: &[usize], rng: &mut StdRng) -> ArrayD<f32> {
        Array::from_shape_simple_fn(shape, || {
            let x = rng.gen_range(0.1f32..1.);
            if rng.gen() {
                x
            } else {
                -x
            }
        })
    }

    fn shift<L: Layer>(layer: &mut L, parameter: usize, index: usize, delta: f32) {
        let mut parameters = layer.parameters_mut();
        parameters[parameter].value_view_mut().as_slice_mut().unwrap()[index] += delta;
    }

    fn loss<L: Layer>(layer: &L, input: &ArrayD<f32>, weights: &ArcArray<f32, IxDyn>) -> f32 {
        let y = layer.forward(input.clone().into()).unwrap();
        weighted_sum(y, weights.clone()).item()
    }

    /// Compares gradients of the input and all parameters with central differences.
    fn check_gradients<L: Layer>(mut layer: L, input_shape: &[usize]) {
        let mut rng = StdRng::seed_from_u64(11);
        let input = random(input_shape, &mut rng);
        layer.set_training(true).unwrap();
        let mut x = Parameter::from(input.clone());
        x.set_training(true);
        let y = layer.forward(x.to_variable()).unwrap();
        let weights = random(y.shape(), &mut rng).into_shared();
        weighted_sum(y, weights.clone()).backward().unwrap();
        let eps = 1e-2;
        let dx = x.grad().unwrap();
        for i in 0..input.len() {
            let mut plus = input.clone();
            plus.as_slice_mut().unwrap()[i] += eps;
            let mut minus = input.clone();
            minus.as_slice_mut().unwrap()[i] -= eps;
            let numeric = (loss(&layer, &plus, &weights) - loss(&layer, &minus, &weights)) / (2. * eps);
            assert_relative_eq!(
                dx.as_slice().unwrap()[i],
                numeric,
                epsilon = 2e-2,
                max_relative = 2e-2
            );
        }
        let grads: Vec<_> = layer
            .parameters()
            .iter()
            .map(|parameter| parameter.grad().unwrap())
            .collect();
        for (p, grad) in grads.iter().enumerate() {
            for i in 0..grad.len() {
                shift(&mut layer, p, i, eps);
                let plus = loss(&layer, &input, &weights);
                shift(&mut layer, p, i, -2. * eps);
                let minus = loss(&layer, &input, &weights);
                shift(&mut layer, p, i, eps);
                let numeric = (plus - minus) / (2. * eps);
                assert_relative_eq!(
                    grad.as_slice().unwrap()[i],
                    numeric,
                    epsilon = 2e-2,
                    max_relative = 2e-2
                );
            }
        }
    }

    fn direct_conv(x: &Array4<f32>, w: &Array4<f32>, b: &Array1<f32>, s: usize, p: usize) -> Array4<f32> {
        let (bs, c, h, wd) = x.dim();
        let (o, _, k, _) = w.dim();
        let oh = (h + 2 * p - k) / s + 1;
        let ow = (wd + 2 * p - k) / s + 1;
        Array::from_shape_fn([bs, o, oh, ow], |(bi, oi, y, xi)| {
            let mut acc = b[oi];
            for ci in 0..c {
                for fy in 0..k {
                    for fx in 0..k {
                        let iy = (y * s + fy) as isize - p as isize;
                        let ix = (xi * s + fx) as isize - p as isize;
                        if iy >= 0 && ix >= 0 && (iy as usize) < h && (ix as usize) < wd {
                            acc += x[(bi, ci, iy as usize, ix as usize)] * w[(oi, ci, fy, fx)];
                        }
                    }
                }
            }
            acc
        })
    }

    fn direct_conv_transpose(x: &Array4<f32>, w: &Array4<f32>, b: &Array1<f32>, s: usize, p: usize) -> Array4<f32> {
        let (bs, c, h, wd) = x.dim();
        let (_, o, k, _) = w.dim();
        let oh = (h - 1) * s + k - 2 * p;
        let ow = (wd - 1) * s + k - 2 * p;
        let mut y = Array::zeros([bs, o, oh, ow]);
        for bi in 0..bs {
            for ci in 0..c {
                for iy in 0..h {
                    for ix in 0..wd {
                        for oi in 0..o {
                            for fy in 0..k {
                                for fx in 0..k {
                                    let yy = (iy * s + fy) as isize - p as isize;
                                    let yx = (ix * s + fx) as isize - p as isize;
                                    if yy >= 0 && yx >= 0 && (yy as usize) < oh && (yx as usize) < ow {
                                        y[(bi, oi, yy as usize, yx as usize)] +=
                                            x[(bi, ci, iy, ix)] * w[(ci, oi, fy, fx)];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        for ((_, oi, _, _), value) in y.indexed_iter_mut() {
            *value += b[oi];
        }
        y
    }

    #[test]
    fn conv_matches_direct() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv::builder()
            .inputs(3)
            .outputs(5)
            .filter(4)
            .stride(2)
            .padding(1)
            .build(&mut rng)?;
        let x = random(&[2, 3, 8, 8], &mut rng).into_dimensionality::<Ix4>()?;
        let y = conv.forward(x.clone().into_dyn().into())?;
        assert_eq!(y.shape(), &[2, 5, 4, 4]);
        let w = conv.weight().value().to_owned().into_dimensionality::<Ix4>()?;
        let b = conv.bias().unwrap().value().to_owned().into_dimensionality::<Ix1>()?;
        let expected = direct_conv(&x, &w, &b, 2, 1);
        let y = y.into_value().into_dimensionality::<Ix4>()?;
        assert_relative_eq!(y, expected, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn conv_transpose_matches_direct() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        for (s, p, h) in [(1, 0, 1), (2, 1, 4)] {
            let conv = ConvTranspose::builder()
                .inputs(3)
                .outputs(2)
                .filter(4)
                .stride(s)
                .padding(p)
                .build(&mut rng)?;
            let x = random(&[2, 3, h, h], &mut rng).into_dimensionality::<Ix4>()?;
            let y = conv.forward(x.clone().into_dyn().into())?;
            let w = conv.weight().value().to_owned().into_dimensionality::<Ix4>()?;
            let b = conv.bias().unwrap().value().to_owned().into_dimensionality::<Ix1>()?;
            let expected = direct_conv_transpose(&x, &w, &b, s, p);
            assert_eq!(y.shape(), expected.shape());
            let y = y.into_value().into_dimensionality::<Ix4>()?;
            assert_relative_eq!(y, expected, epsilon = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn channel_mismatch() -> Result<()> {
        let conv = Conv::builder()
            .inputs(3)
            .outputs(2)
            .filter(3)
            .build(&mut StdRng::seed_from_u64(0))?;
        let error = conv
            .forward(Array::<f32, _>::zeros([1, 2, 5, 5]).into_dyn().into())
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::ShapeMismatch { op: "Conv", .. })
        ));
        Ok(())
    }

    #[test]
    fn conv_gradients() -> Result<()> {
        let conv = Conv::builder()
            .inputs(2)
            .outputs(3)
            .filter(4)
            .stride(2)
            .padding(1)
            .build(&mut StdRng::seed_from_u64(2))?;
        check_gradients(conv, &[2, 2, 4, 4]);
        Ok(())
    }

    #[test]
    fn conv_transpose_gradients() -> Result<()> {
        let conv = ConvTranspose::builder()
            .inputs(2)
            .outputs(3)
            .filter(4)
            .stride(2)
            .padding(1)
            .build(&mut StdRng::seed_from_u64(3))?;
        check_gradients(conv, &[2, 2, 2, 2]);
        Ok(())
    }

    #[test]
    fn batch_norm_gradients() {
        check_gradients(BatchNorm::from_channels(3), &[4, 3, 2, 2]);
    }

    #[test]
    fn activation_gradients() {
        check_gradients(LeakyRelu::default(), &[2, 3, 2, 2]);
        check_gradients(Tanh, &[2, 3, 2, 2]);
        check_gradients(Sigmoid, &[2, 3, 2, 2]);
    }

    #[test]
    fn batch_norm_normalizes_and_tracks_running_stats() -> Result<()> {
        let mut norm = BatchNorm::from_channels(2);
        norm.set_training(true)?;
        let x = Array::from_shape_fn([4, 2, 3, 3], |(b, c, h, w)| {
            (b * 9 + h * 3 + w) as f32 * (c + 1) as f32
        });
        let y = norm.forward(x.clone().into_dyn().into())?.into_value();
        for c in 0..2 {
            let channel = y.index_axis(Axis(1), c);
            let n = channel.len() as f32;
            let mean = channel.sum() / n;
            let var = channel.mapv(|y| (y - mean) * (y - mean)).sum() / n;
            assert_relative_eq!(mean, 0., epsilon = 1e-4);
            assert_relative_eq!(var, 1., epsilon = 1e-3);
        }
        let channel = x.index_axis(Axis(1), 0);
        let n = channel.len() as f32;
        let mean = channel.sum() / n;
        let var = channel.mapv(|x| (x - mean) * (x - mean)).sum() / (n - 1.);
        assert_relative_eq!(norm.running_mean()[0], 0.1 * mean, epsilon = 1e-4);
        assert_relative_eq!(norm.running_var()[0], 0.9 + 0.1 * var, max_relative = 1e-4);
        norm.set_training(false)?;
        let running_mean = norm.running_mean();
        let y = norm.forward(x.into_dyn().into())?;
        assert_eq!(norm.running_mean(), running_mean);
        assert!(!y.requires_grad());
        Ok(())
    }

    #[test]
    fn vec_is_sequential() -> Result<()> {
        let mut layers = vec![LeakyRelu::new(0.5), LeakyRelu::new(0.5)];
        layers.set_training(true)?;
        let y = layers.forward(Array::from_vec(vec![-4f32, 2.]).into_dyn().into())?;
        assert_eq!(y.value().as_slice().unwrap(), &[-1., 2.]);
        assert_eq!(layers.parameters_len(), 0);
        Ok(())
    }

    #[test]
    fn parameter_count_and_update() -> Result<()> {
        use crate::learn::neural_network::optimizer::Adam;
        let mut rng = StdRng::seed_from_u64(4);
        let mut conv = Conv::builder()
            .inputs(2)
            .outputs(3)
            .filter(3)
            .build(&mut rng)?;
        assert_eq!(conv.parameters_len(), 2);
        assert_eq!(conv.parameter_count(), 3 * 2 * 9 + 3);
        conv.set_training(true)?;
        let before = conv.weight().value().to_owned();
        let y = conv.forward(random(&[1, 2, 3, 3], &mut rng).into())?;
        let weights = Array::ones(y.shape()).into_shared();
        weighted_sum(y, weights).backward()?;
        conv.update(0.01, &Adam::default())?;
        assert_ne!(conv.weight().value(), &before);
        conv.zero_grad();
        assert!(conv.weight().grad().is_none());
        Ok(())
    }

    #[test]
    fn saved_conv_reproduces_output() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(5);
        let conv = ConvTranspose::builder()
            .inputs(2)
            .outputs(2)
            .filter(4)
            .build(&mut rng)?;
        let loaded: ConvTranspose = bincode::deserialize(&bincode::serialize(&conv)?)?;
        let x: ArrayD<f32> = random(&[1, 2, 1, 1], &mut rng);
        let y1 = conv.forward(x.clone().into())?.into_value();
        let y2 = loaded.forward(x.into())?.into_value();
        assert_eq!(y1, y2);
        Ok(())
    }
}

#[cfg(doc)]
use super::autograd::Parameter;
use super::autograd::ParameterD;
use crate::result::Result;
use anyhow::bail;
use ndarray::{ArcArray, ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::any::TypeId;

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating an [`Adam`].
    pub struct AdamBuilder {
        beta1: f32,
        beta2: f32,
        eps: f32,
    }

    impl AdamBuilder {
        pub(super) fn new() -> Self {
            Self {
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
            }
        }
        /// Decay of the first moment estimate. Default is 0.9.
        pub fn beta1(self, beta1: f32) -> Self {
            Self { beta1, ..self }
        }
        /// Decay of the second moment estimate. Default is 0.999.
        pub fn beta2(self, beta2: f32) -> Self {
            Self { beta2, ..self }
        }
        /// Added to the denominator for stability. Default is 1e-8.
        pub fn eps(self, eps: f32) -> Self {
            Self { eps, ..self }
        }
        /// Builds the optimizer.
        ///
        /// **Errors**
        /// The betas are not in [0, 1) or `eps` is negative.
        pub fn build(self) -> Result<Adam> {
            let Self { beta1, beta2, eps } = self;
            for (name, beta) in [("beta1", beta1), ("beta2", beta2)] {
                if !(0. ..1.).contains(&beta) {
                    bail!("Adam {name} {beta} must be in [0, 1)!");
                }
            }
            if eps < 0. {
                bail!("Adam eps {eps} must not be negative!");
            }
            Ok(Adam { beta1, beta2, eps })
        }
    }
}
use builder::*;

/// [`State`] value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    /// A tensor with the shape of the parameter.
    Tensor(ArcArray<f32, IxDyn>),
    /// An elem.
    Elem(f32),
}

/// Optimizer State.
///
/// Stored on each [`Parameter`] and updated by the optimizer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct State {
    name: String,
    #[serde(skip, default = "default_type_id")]
    id: TypeId,
    key_values: Vec<(String, Value)>,
}

fn default_type_id() -> TypeId {
    TypeId::of::<()>()
}

impl State {
    /// Creates a new state for the optimizer `O`.
    pub fn new<O: Optimizer + 'static>(
        name: impl Into<String>,
        key_values: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        Self {
            name: name.into(),
            id: TypeId::of::<O>(),
            key_values: key_values.into_iter().collect(),
        }
    }
    /// Name of the [`Optimizer`].
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Type id of the [`Optimizer`].
    pub fn id(&self) -> TypeId {
        self.id
    }
    /// Iterator over keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.key_values
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }
    /// Iterator over keys and mutable values.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.key_values
            .iter_mut()
            .map(|(key, value)| (key.as_str(), value))
    }
    fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.iter_mut()
            .find_map(|(k, value)| (k == key).then_some(value))
    }
}

/// Optimizer.
pub trait Optimizer {
    /// Performs the optimization, updating the parameter with `learning_rate`.
    ///
    /// Parameters without a gradient are not modified.
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()>;
}

/// Adam.
///
/// Keeps running averages of the gradient and its square, with bias correction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    eps: f32,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl Adam {
    /// An Adam builder.
    pub fn builder() -> AdamBuilder {
        AdamBuilder::new()
    }
    fn init_state(&self, parameter: &mut ParameterD) {
        if let Some(state) = parameter.optimizer_state() {
            if state.id() == TypeId::of::<Self>() {
                return;
            }
        }
        let zeros = || Value::Tensor(ArrayD::zeros(parameter.raw_dim()).into_shared());
        let key_values = [
            ("exp_avg".to_string(), zeros()),
            ("exp_avg_sq".to_string(), zeros()),
            ("step".to_string(), Value::Elem(0.)),
        ];
        parameter.init_optimizer_state(State::new::<Self>("Adam", key_values));
    }
}

impl Optimizer for Adam {
    fn update(&self, learning_rate: f32, parameter: &mut ParameterD) -> Result<()> {
        let Some(grad) = parameter.grad() else {
            return Ok(());
        };
        self.init_state(parameter);
        let Self { beta1, beta2, eps } = *self;
        let (value, state) = parameter.value_view_optimizer_state_mut();
        let Some(state) = state else {
            bail!("Adam state was not initialized!");
        };
        let step = match state.get_mut("step") {
            Some(Value::Elem(step)) => {
                *step += 1.;
                *step
            }
            _ => bail!("Adam state is missing \"step\"!"),
        };
        let bias_correction1 = 1. - beta1.powf(step);
        let bias_correction2 = 1. - beta2.powf(step);
        let step_size = learning_rate / bias_correction1;
        let mut exp_avg = match state.get_mut("exp_avg") {
            Some(Value::Tensor(exp_avg)) => std::mem::take(exp_avg),
            _ => bail!("Adam state is missing \"exp_avg\"!"),
        };
        let mut exp_avg_sq = match state.get_mut("exp_avg_sq") {
            Some(Value::Tensor(exp_avg_sq)) => std::mem::take(exp_avg_sq),
            _ => bail!("Adam state is missing \"exp_avg_sq\"!"),
        };
        Zip::from(value)
            .and(&grad)
            .and(&mut exp_avg)
            .and(&mut exp_avg_sq)
            .for_each(|w, dw, m, v| {
                adam_update(w, *dw, m, v, beta1, beta2, eps, step_size, bias_correction2)
            });
        if let Some(Value::Tensor(x)) = state.get_mut("exp_avg") {
            *x = exp_avg;
        }
        if let Some(Value::Tensor(x)) = state.get_mut("exp_avg_sq") {
            *x = exp_avg_sq;
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn adam_update(
    w: &mut f32,
    dw: f32,
    m: &mut f32,
    v: &mut f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    step_size: f32,
    bias_correction2: f32,
) {
    *m = beta1 * *m + (1. - beta1) * dw;
    *v = beta2 * *v + (1. - beta2) * dw * dw;
    let denom = (*v / bias_correction2).sqrt() + eps;
    *w -= step_size * *m / denom;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::neural_network::autograd::{Parameter, Variable, Variable0};
    use approx::assert_relative_eq;
    use ndarray::{arr1, Array, Ix0};

    fn sum(input: crate::learn::neural_network::autograd::Variable1) -> Variable0 {
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let dim = input.raw_dim();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                Ok(Array::from_elem(dim, output_grad[()]).into_shared())
            });
        }
        builder.build(Array::from_elem((), input.value().sum()).into_shared())
    }

    #[test]
    fn first_step_moves_by_learning_rate() -> Result<()> {
        let mut parameter = Parameter::from(arr1(&[1f32, -1.])).into_dyn();
        parameter.set_training(true);
        sum(parameter.to_variable().into_dimensionality()?).backward()?;
        Adam::default().update(0.1, &mut parameter)?;
        // m_hat = g, v_hat = g^2, so the step is lr * sign(g).
        assert_relative_eq!(parameter.value()[[0]], 0.9, epsilon = 1e-5);
        assert_relative_eq!(parameter.value()[[1]], -1.1, epsilon = 1e-5);
        let state = parameter.optimizer_state().unwrap();
        assert_eq!(state.name(), "Adam");
        let step = state.iter().find(|(key, _)| *key == "step").unwrap().1;
        assert!(matches!(step, Value::Elem(x) if *x == 1.));
        Ok(())
    }

    #[test]
    fn skips_parameters_without_grad() -> Result<()> {
        let mut parameter = Parameter::from(arr1(&[1f32, 2.])).into_dyn();
        parameter.set_training(true);
        Adam::default().update(0.1, &mut parameter)?;
        assert_eq!(parameter.value().as_slice().unwrap(), &[1., 2.]);
        assert!(parameter.optimizer_state().is_none());
        Ok(())
    }

    #[test]
    fn matches_reference_steps() -> Result<()> {
        let (beta1, beta2, eps, lr) = (0.9f32, 0.999f32, 1e-8f32, 0.01f32);
        let adam = Adam::builder().build()?;
        let mut parameter = Parameter::from(arr1(&[0.5f32])).into_dyn();
        parameter.set_training(true);
        let (mut w, mut m, mut v) = (0.5f32, 0f32, 0f32);
        for t in 1..=3 {
            parameter.zero_grad();
            sum(parameter.to_variable().into_dimensionality()?).backward()?;
            adam.update(lr, &mut parameter)?;
            let g = 1f32;
            m = beta1 * m + (1. - beta1) * g;
            v = beta2 * v + (1. - beta2) * g * g;
            let m_hat = m / (1. - beta1.powi(t));
            let v_hat = v / (1. - beta2.powi(t));
            w -= lr * m_hat / (v_hat.sqrt() + eps);
            assert_relative_eq!(parameter.value()[[0]], w, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn invalid_betas() {
        assert!(Adam::builder().beta1(1.).build().is_err());
        assert!(Adam::builder().beta2(-0.1).build().is_err());
    }
}

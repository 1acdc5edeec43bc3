use super::{layer::Forward, optimizer::State as OptimizerState};
#[cfg(doc)]
use crate::learn::neural_network::optimizer::Optimizer;
use crate::result::Result;
use anyhow::bail;
use ndarray::{
    ArcArray, Array, ArrayViewMut, Dimension, IntoDimension, Ix0, Ix1, Ix2, Ix4, IxDyn,
    ShapeError,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

type GradLock = Arc<RwLock<Option<ArcArray<f32, IxDyn>>>>;

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    ///```no_run
    /// # use dcgan::{learn::neural_network::autograd::{Variable, Variable2}, result::Result};
    /// # use ndarray::ArcArray2;
    /// # let input: Variable2 = todo!();
    /// let mut builder = Variable::builder();
    /// if let Some(node) = input.node() {
    ///     // Add an edge computing the input gradient from the output gradient.
    ///     builder.edge(node, |output_grad: ArcArray2<f32>| -> Result<ArcArray2<f32>> { todo!() });
    /// }
    /// let output_value: ArcArray2<f32> = todo!();
    /// # let _ = {
    /// builder.build(output_value)
    /// # };
    ///```
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<GradLock>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension + 'static> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds an edge.
        ///
        /// During the backward pass, `f` computes the gradient of `node` given the gradient of
        /// the output. When multiple edges compute the same gradient, they are added together.
        /// Once there are no more edges needed to compute a gradient for a node, its edges can
        /// be computed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcArray<f32, D>) -> Result<ArcArray<f32, D2>> + Send + Sync + 'static,
        {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            let mut output_grad_lock = self.grad.clone();
            let node = node.inner.clone();
            let mut input_grad_lock = Arc::downgrade(&node.grad);
            let dim = node.dim.clone();
            let name = std::any::type_name::<F>();
            let mut f = Some(f);
            let op = Box::new(move || {
                let input_grad_lock = Weak::upgrade(&std::mem::take(&mut input_grad_lock));
                if let Some((f, (input_grad_lock, output_grad_lock))) =
                    f.take().zip(input_grad_lock.zip(output_grad_lock.take()))
                {
                    let grad = output_grad_lock.read().clone();
                    std::mem::drop(output_grad_lock);
                    let Some(grad) = grad else {
                        return Ok(());
                    };
                    let grad = (f)(grad.into_dimensionality::<D>()?)?;
                    if grad.shape() != dim.slice() {
                        bail!(
                            "{name} computed a gradient with shape {:?}, expected {:?}!",
                            grad.shape(),
                            dim.slice()
                        );
                    }
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        input_grad.zip_mut_with(&grad, |x, y| *x += *y);
                    } else {
                        guard.replace(grad.into_dyn());
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcArray<f32, D>) -> Variable<D> {
            let node = self
                .grad
                .map(|grad| Node::new(value.raw_dim().into_dyn(), grad, self.edges));
            Variable { value, node }
        }
    }
}
use builder::*;

struct EdgeInner {
    name: &'static str,
    op: Box<dyn FnMut() -> Result<()> + Send + Sync + 'static>,
    node: Arc<NodeInner>,
}

impl Debug for EdgeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeInner")
            .field("name", &self.name)
            .field("node", &self.node)
            .finish()
    }
}

#[derive(Debug)]
struct NodeInner {
    dim: IxDyn,
    grad: GradLock,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

/// Node.
///
/// Nodes store gradients and can be connected via [`VariableBuilder::edge()`] to
/// form a graph that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: GradLock, edges: Vec<EdgeInner>) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                dim,
                grad,
                edges: Mutex::new(edges),
            }),
            _m: PhantomData,
        }
    }
    /// The gradient.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.inner.grad.read().clone()?.into_dimensionality().ok()
    }
    /// Executes the backward pass.
    pub fn backward(&self) -> Result<()> {
        self.backward_grad(ArcArray::ones(self.inner.dim.clone()).into_dimensionality::<D>()?)
    }
    /// Executes the backward pass with `grad`.
    ///
    /// Does nothing if the node already has a gradient.
    pub fn backward_grad(&self, grad: ArcArray<f32, D>) -> Result<()> {
        {
            let mut guard = self.inner.grad.write();
            if guard.is_some() {
                return Ok(());
            }
            guard.replace(grad.into_dyn());
        }
        let mut queue = VecDeque::new();
        queue.push_back(self.inner.clone());
        while let Some(node) = queue.pop_front() {
            let edges = std::mem::take(&mut *node.edges.lock());
            std::mem::drop(node);
            for mut edge in edges {
                (edge.op)()?;
                let node = edge.node;
                if node.ready() {
                    queue.push_back(node);
                }
            }
        }
        Ok(())
    }
    fn into_dyn(self) -> Node<IxDyn> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
    fn into_dimensionality<D2: Dimension>(self) -> Node<D2> {
        Node {
            inner: self.inner,
            _m: PhantomData,
        }
    }
}

/// Variable.
///
/// Variables are arrays with an optional [`Node`] that stores a gradient. Operations on
/// variables with a node create a graph of edges that is traversed during the backward pass
/// to compute the gradients.
///
/// Variables can be created from arrays via [`From`].
/// Use [`builder()`](Variable::builder) to create a Variable as a function of another variable.
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcArray<f32, D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions
pub type Variable2 = Variable<Ix2>;
/// Variable with 4 dimensions
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension + 'static> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
}

impl<D: Dimension> Variable<D> {
    /// The value of the variable.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Converts the variable into its value.
    pub fn into_value(self) -> ArcArray<f32, D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// Whether a gradient flows back through the variable.
    pub fn requires_grad(&self) -> bool {
        self.node.is_some()
    }
    /// Removes the variable from the graph.
    ///
    /// The returned variable has the same value but no node, operations on it will not
    /// compute gradients for its inputs.
    pub fn detach(&self) -> Self {
        Self {
            value: self.value.clone(),
            node: None,
        }
    }
    /// Maps the variable with `F`.
    ///
    /// Shortcut for `f.forward(self)`. This allows chaining methods together.
    pub fn forward<F: Forward>(self, f: &F) -> Result<VariableD> {
        f.forward(self.into_dyn())
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ShapeError>
    where
        D2: Dimension,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
    }
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dyn),
        }
    }
}

impl Variable0 {
    /// Executes the backward pass.
    ///
    /// See [`Node::backward`].
    pub fn backward(&self) -> Result<()> {
        if let Some(node) = self.node.as_ref() {
            node.backward()?;
        }
        Ok(())
    }
    /// The scalar value.
    pub fn item(&self) -> f32 {
        self.value[()]
    }
}

impl<D: Dimension + 'static> Variable<D> {
    /// Converts into `shape`.
    ///
    /// The gradient is reshaped back to the input shape.
    pub fn into_shape<E>(self, shape: E) -> Result<Variable<E::Dim>>
    where
        E: IntoDimension,
        E::Dim: 'static,
    {
        let dim = self.raw_dim();
        let mut builder = Variable::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad: ArcArray<f32, E::Dim>| {
                Ok(output_grad
                    .as_standard_layout()
                    .into_owned()
                    .into_shape(dim)?
                    .into_shared())
            })
        }
        let value = self
            .value
            .as_standard_layout()
            .into_owned()
            .into_shape(shape)?
            .into_shared();
        Ok(builder.build(value))
    }
    /// Flattens the variable into 2 dimensions, [batch_size, ..].
    pub fn flatten(self) -> Result<Variable2> {
        let shape = self.shape();
        let batch_size = shape.first().copied().unwrap_or(1);
        let size = shape.iter().skip(1).product();
        self.into_shape([batch_size, size])
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Variable<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            node: None,
        }
    }
}

/// Parameter.
///
/// Parameter values are updated during training by the [`Optimizer`]. A Parameter
/// can be converted to a [`Variable`] via [`.to_variable()`](Parameter::to_variable),
/// which allows it to be used in operations.
/// During training, [`.set_training(true)`](Parameter::set_training) ensures that
/// the variable created from this parameter has a [`Node`].
/// A parameter stores the [`OptimizerState`] which is updated in [`Optimizer::update`].
/// Only the value is serialized.
#[derive(Clone, Serialize, Deserialize)]
pub struct Parameter<D: Dimension> {
    value: ArcArray<f32, D>,
    #[serde(skip)]
    grad: Option<GradLock>,
    #[serde(skip)]
    optim_state: Option<OptimizerState>,
}

/// Parameter with 1 dimension.
pub type Parameter1 = Parameter<Ix1>;
/// Parameter with dynamic dimensions.
pub type ParameterD = Parameter<IxDyn>;

impl<D: Dimension> Parameter<D> {
    /// The value of the parameter.
    pub fn value(&self) -> &ArcArray<f32, D> {
        &self.value
    }
    /// Borrows the value of the parameter mutably.
    ///
    /// Copies the value if it is shared, for example by a graph that has not been dropped.
    pub fn value_view_mut(&mut self) -> ArrayViewMut<f32, D> {
        self.value.view_mut()
    }
    /// The gradient of the parameter.
    pub fn grad(&self) -> Option<ArcArray<f32, D>> {
        self.grad
            .as_ref()?
            .read()
            .clone()?
            .into_dimensionality()
            .ok()
    }
    /// The shape.
    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }
    /// The dim in pattern form.
    pub fn dim(&self) -> D::Pattern {
        self.value.dim()
    }
    /// The dim.
    pub fn raw_dim(&self) -> D {
        self.value.raw_dim()
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }
    /// Whether the parameter is empty.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
    /// Enables / disables training.
    ///
    /// If `training`, ensures that when the parameter is converted to a [`Variable`],
    /// it will have a [`Node`] for computing a gradient.
    /// If `training` is false, discards any gradient that has been computed.
    pub fn set_training(&mut self, training: bool) {
        if training && self.grad.is_none() {
            self.grad.replace(Arc::new(RwLock::default()));
        } else if !training {
            self.grad = None;
        }
    }
    /// Whether gradients are computed for the parameter.
    pub fn is_training(&self) -> bool {
        self.grad.is_some()
    }
    /// Clears the gradient.
    pub fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_ref() {
            grad.write().take();
        }
    }
    /// Borrows the optimizer state.
    pub fn optimizer_state(&self) -> Option<&OptimizerState> {
        self.optim_state.as_ref()
    }
    /// Borrows the optimizer state mutably.
    pub fn optimizer_state_mut(&mut self) -> Option<&mut OptimizerState> {
        self.optim_state.as_mut()
    }
    /// Replaces the optimizer state.
    pub fn init_optimizer_state(&mut self, state: OptimizerState) {
        self.optim_state.replace(state);
    }
    /// Borrows the value and optimizer state mutably.
    pub fn value_view_optimizer_state_mut(
        &mut self,
    ) -> (ArrayViewMut<f32, D>, Option<&mut OptimizerState>) {
        (self.value.view_mut(), self.optim_state.as_mut())
    }
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Parameter<D2>, ShapeError>
    where
        D2: Dimension,
    {
        Ok(Parameter {
            value: self.value.into_dimensionality()?,
            grad: self.grad,
            optim_state: self.optim_state,
        })
    }
    /// Converts into a dynamic dimensional parameter.
    pub fn into_dyn(self) -> ParameterD {
        Parameter {
            value: self.value.into_dyn(),
            grad: self.grad,
            optim_state: self.optim_state,
        }
    }
    /// Converts to a `Variable`.
    ///
    /// When training, gradients of the variable are accumulated into the parameter.
    pub fn to_variable(&self) -> Variable<D> {
        let value = self.value.clone();
        let node = self
            .grad
            .as_ref()
            .map(|grad| Node::new(value.raw_dim().into_dyn(), grad.clone(), Vec::new()));
        Variable { value, node }
    }
}

impl<D: Dimension> From<Array<f32, D>> for Parameter<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcArray<f32, D>> for Parameter<D> {
    fn from(array: ArcArray<f32, D>) -> Self {
        Self {
            value: array,
            grad: None,
            optim_state: None,
        }
    }
}

impl<D: Dimension> Debug for Parameter<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("value", &self.value)
            .field("grad", &self.grad)
            .field("optim_state", &self.optim_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array1};

    fn square_sum(input: Variable1) -> Variable0 {
        let mut builder = Variable::builder();
        if let Some(node) = input.node() {
            let x = input.value().clone();
            builder.edge(node, move |output_grad: ArcArray<f32, Ix0>| {
                Ok(x.mapv(|x| 2. * x * output_grad[()]).into_shared())
            });
        }
        let value = Array::from_elem((), input.value().mapv(|x| x * x).sum());
        builder.build(value.into_shared())
    }

    #[test]
    fn parameter_gradient() -> Result<()> {
        let mut parameter = Parameter::from(arr1(&[1f32, -2., 3.]));
        parameter.set_training(true);
        let loss = square_sum(parameter.to_variable());
        assert_eq!(loss.item(), 14.);
        loss.backward()?;
        assert_eq!(parameter.grad().unwrap(), arr1(&[2., -4., 6.]));
        Ok(())
    }

    #[test]
    fn gradients_accumulate_until_zeroed() -> Result<()> {
        let mut parameter = Parameter::from(arr1(&[1f32, 2.]));
        parameter.set_training(true);
        square_sum(parameter.to_variable()).backward()?;
        square_sum(parameter.to_variable()).backward()?;
        assert_eq!(parameter.grad().unwrap(), arr1(&[4., 8.]));
        parameter.zero_grad();
        assert!(parameter.grad().is_none());
        square_sum(parameter.to_variable()).backward()?;
        assert_eq!(parameter.grad().unwrap(), arr1(&[2., 4.]));
        Ok(())
    }

    #[test]
    fn no_gradient_when_not_training() -> Result<()> {
        let parameter = Parameter::from(arr1(&[1f32, 2.]));
        let loss = square_sum(parameter.to_variable());
        assert!(!loss.requires_grad());
        loss.backward()?;
        assert!(parameter.grad().is_none());
        Ok(())
    }

    #[test]
    fn detach_stops_gradient() -> Result<()> {
        let mut parameter = Parameter::from(arr1(&[1f32, 2.]));
        parameter.set_training(true);
        let x = parameter.to_variable();
        let loss = square_sum(x.detach());
        loss.backward()?;
        assert!(parameter.grad().is_none());
        Ok(())
    }

    #[test]
    fn into_shape_backward() -> Result<()> {
        let mut parameter = Parameter::from(arr2(&[[1f32, 2.], [3., 4.]]));
        parameter.set_training(true);
        let x = parameter
            .to_variable()
            .into_shape(4)?
            .into_dimensionality::<Ix1>()?;
        square_sum(x).backward()?;
        assert_eq!(parameter.grad().unwrap(), arr2(&[[2., 4.], [6., 8.]]));
        Ok(())
    }

    #[test]
    fn parameter_serializes_value_only() -> Result<()> {
        let mut parameter = Parameter::from(Array1::from(vec![0.5f32, 1.5]));
        parameter.set_training(true);
        square_sum(parameter.to_variable()).backward()?;
        let bytes = bincode::serialize(&parameter)?;
        let loaded: Parameter1 = bincode::deserialize(&bytes)?;
        assert_eq!(loaded.value(), parameter.value());
        assert!(loaded.grad().is_none());
        assert!(!loaded.is_training());
        Ok(())
    }
}

use anyhow::Result;
use ndarray::{ArcArray, Array, Dimension, Ix0, Ix1, Ix2, Ix3, Ix4, IxDyn};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    marker::PhantomData,
    sync::{Arc, Weak},
};

/// Shared tensor.
pub type ArcTensor<D> = ArcArray<f32, D>;
/// Shared tensor with 1 element.
pub type ArcTensor0 = ArcTensor<Ix0>;
/// Shared tensor with 1 dimension.
pub type ArcTensor1 = ArcTensor<Ix1>;
/// Shared tensor with 2 dimensions.
pub type ArcTensor2 = ArcTensor<Ix2>;
/// Shared tensor with 3 dimensions.
pub type ArcTensor3 = ArcTensor<Ix3>;
/// Shared tensor with 4 dimensions.
pub type ArcTensor4 = ArcTensor<Ix4>;
/// Shared tensor with dynamic dimensions.
pub type ArcTensorD = ArcTensor<IxDyn>;

/// Builders.
pub mod builder {
    use super::*;

    /// VariableBuilder.
    ///
    /// Creates a [`Variable`] as a function of other variables. Add an edge per
    /// input that requires a gradient, then [`build`](Self::build) with the
    /// output value.
    pub struct VariableBuilder<D: Dimension> {
        grad: Option<Arc<RwLock<Option<ArcTensorD>>>>,
        edges: Vec<EdgeInner>,
        _m: PhantomData<D>,
    }

    impl<D: Dimension> VariableBuilder<D> {
        pub(super) fn new() -> Self {
            Self {
                grad: None,
                edges: Vec::new(),
                _m: PhantomData,
            }
        }
        /// Adds a node.
        ///
        /// Ensures a node is created even if no edges are added. Used for leaf
        /// variables (eg the image being optimized) so that their gradient can
        /// be read back after the backward pass.
        pub fn node(mut self) -> Self {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            self
        }
        /// Adds an edge.
        ///
        /// During the backward pass, for each edge to `node`, `f` computes the
        /// gradient of `node` given the gradient of `self`. When multiple edges
        /// compute the same gradient, they are added together. Once there are no
        /// more edges needed to compute a gradient for a node, its own edges can
        /// be computed.
        pub fn edge<D2, F>(&mut self, node: &Node<D2>, f: F)
        where
            D2: Dimension,
            F: FnOnce(ArcTensor<D>) -> Result<ArcTensor<D2>> + Send + Sync + 'static,
        {
            if self.grad.is_none() {
                self.grad.replace(Arc::new(RwLock::default()));
            }
            let mut output_grad_lock = Some(self.grad.clone().unwrap());
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
                    let grad = output_grad_lock
                        .read()
                        .clone()
                        .unwrap()
                        .into_dimensionality()
                        .unwrap();
                    std::mem::drop(output_grad_lock);
                    let grad = (f)(grad)?;
                    assert_eq!(grad.shape(), dim.slice(), "{name}");
                    let mut guard = input_grad_lock.write();
                    if let Some(input_grad) = guard.as_mut() {
                        *input_grad += &grad;
                    } else {
                        guard.replace(grad.into_dyn());
                    }
                }
                Ok(())
            });
            self.edges.push(EdgeInner { name, op, node })
        }
        /// Builds the variable with `value`.
        pub fn build(self, value: ArcTensor<D>) -> Variable<D> {
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
    grad: Arc<RwLock<Option<ArcTensorD>>>,
    edges: Mutex<Vec<EdgeInner>>,
}

impl NodeInner {
    fn ready(&self) -> bool {
        Arc::weak_count(&self.grad) == 0
    }
}

/// Node.
///
/// Nodes store gradients and can be connected via [`VariableBuilder::edge()`]
/// to form a graph that is traversed in [`.backward()`](Node::backward).
#[derive(Clone, Debug)]
pub struct Node<D: Dimension> {
    inner: Arc<NodeInner>,
    _m: PhantomData<D>,
}

impl<D: Dimension> Node<D> {
    fn new(dim: IxDyn, grad: Arc<RwLock<Option<ArcTensorD>>>, edges: Vec<EdgeInner>) -> Self {
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
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        Some(
            self.inner
                .grad
                .read()
                .clone()?
                .into_dimensionality()
                .unwrap(),
        )
    }
    /// Executes the backward pass.
    pub fn backward(&self) -> Result<()> {
        self.backward_grad(
            Array::ones(self.inner.dim.clone())
                .into_shared()
                .into_dimensionality::<D>()
                .unwrap(),
        )
    }
    /// Executes the backward pass with `grad`.
    pub fn backward_grad(&self, grad: ArcTensor<D>) -> Result<()> {
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
                    queue.push_back(node.clone())
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
/// Variables are tensors with an optional [`Node`] that stores a gradient.
/// Numerical operations on variables with a node create a graph of edges that
/// is traversed during the backward pass to compute the gradients.
///
/// Variables can be created from tensors via [`From`]; use
/// [`with_grad`](Variable::with_grad) for the optimization variable and
/// [`builder()`](Variable::builder) to create a variable as a function of
/// another variable.
#[derive(Clone, Debug)]
pub struct Variable<D: Dimension> {
    value: ArcTensor<D>,
    node: Option<Node<D>>,
}

/// Variable with 1 element.
pub type Variable0 = Variable<Ix0>;
/// Variable with 1 dimension.
pub type Variable1 = Variable<Ix1>;
/// Variable with 2 dimensions.
pub type Variable2 = Variable<Ix2>;
/// Variable with 3 dimensions.
pub type Variable3 = Variable<Ix3>;
/// Variable with 4 dimensions.
pub type Variable4 = Variable<Ix4>;
/// Variable with dynamic dimensions.
pub type VariableD = Variable<IxDyn>;

impl<D: Dimension> Variable<D> {
    /// A `VariableBuilder` for creating nodes and edges.
    pub fn builder() -> VariableBuilder<D> {
        VariableBuilder::new()
    }
    /// Creates a leaf variable that requires a gradient.
    ///
    /// After the backward pass the gradient is read via
    /// [`.grad()`](Variable::grad).
    pub fn with_grad(value: ArcTensor<D>) -> Self {
        Self::builder().node().build(value)
    }
    /// The value of the variable.
    pub fn value(&self) -> &ArcTensor<D> {
        &self.value
    }
    /// Converts the variable into a tensor.
    pub fn into_value(self) -> ArcTensor<D> {
        self.value
    }
    /// The node.
    pub fn node(&self) -> Option<&Node<D>> {
        self.node.as_ref()
    }
    /// The gradient, if a backward pass has been executed.
    pub fn grad(&self) -> Option<ArcTensor<D>> {
        self.node.as_ref()?.grad()
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
    /// Converts into a dynamic dimensional variable.
    pub fn into_dyn(self) -> VariableD {
        Variable {
            value: self.value.into_dyn(),
            node: self.node.map(Node::into_dyn),
        }
    }
    /// Scales the variable by `scale`.
    pub fn scale(self, scale: f32) -> Self
    where
        D: 'static,
    {
        let mut builder = Self::builder();
        if let Some(node) = self.node() {
            builder.edge(node, move |output_grad| {
                Ok(output_grad.mapv(|x| scale * x).into_shared())
            });
        }
        builder.build(self.value.mapv(|x| scale * x).into_shared())
    }
}

impl VariableD {
    /// Converts into dimensionality `D2`.
    pub fn into_dimensionality<D2>(self) -> Result<Variable<D2>, ndarray::ShapeError>
    where
        D2: Dimension,
    {
        let value = self.value.into_dimensionality()?;
        Ok(Variable {
            value,
            node: self.node.map(Node::into_dimensionality),
        })
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
    /// The value as a scalar.
    pub fn item(&self) -> f32 {
        self.value[()]
    }
}

impl<D: Dimension> From<Array<f32, D>> for Variable<D> {
    fn from(array: Array<f32, D>) -> Self {
        Self::from(array.into_shared())
    }
}

impl<D: Dimension> From<ArcTensor<D>> for Variable<D> {
    fn from(value: ArcTensor<D>) -> Self {
        Self { value, node: None }
    }
}

/// Sums weighted scalar variables: `Σ wᵢ·lᵢ`.
///
/// Tolerates an empty input, which yields a constant zero.
pub fn weighted_sum(terms: &[(f32, Variable0)]) -> Variable0 {
    let mut builder = Variable0::builder();
    let mut sum = 0f32;
    for (weight, term) in terms {
        sum += *weight * term.item();
        if let Some(node) = term.node() {
            let weight = *weight;
            builder.edge(node, move |output_grad: ArcTensor0| {
                Ok(ArcArray::from_elem((), weight * output_grad[()]))
            });
        }
    }
    builder.build(ArcArray::from_elem((), sum))
}

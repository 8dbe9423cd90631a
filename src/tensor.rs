use std::cell::{Ref, RefCell, RefMut};

use ndarray::{Array, Dimension, Ix5, ShapeBuilder};

/// A value array paired with a same-shape gradient array.
///
/// Tensors are owned by the network driver, which hands layers shared
/// references; interior mutability lets a layer fill its top's values and
/// accumulate into its bottom's gradient through those references. Layers
/// never take ownership of the tensors they exchange.
pub struct Tensor<D>
where
    D: Dimension,
{
    data: RefCell<Array<f32, D>>,
    gradient: RefCell<Array<f32, D>>,
}

/// The 5-axis tensor exchanged at every layer boundary, shaped
/// (batch, channels, length, height, width).
pub type Volume = Tensor<Ix5>;

impl<D> Tensor<D>
where
    D: Dimension,
{
    /// Creates a tensor with zeroed values and gradient.
    pub fn zeros<Sh>(shape: Sh) -> Self
    where
        Sh: ShapeBuilder<Dim = D>,
    {
        let data = Array::zeros(shape);
        let gradient = Array::zeros(data.raw_dim());

        Self {
            data: RefCell::new(data),
            gradient: RefCell::new(gradient),
        }
    }

    /// Creates a tensor from a [ndarray] array that owns its data, with a
    /// zeroed gradient of the same shape.
    pub fn from_ndarray(array: Array<f32, D>) -> Self {
        let gradient = Array::zeros(array.raw_dim());

        Self {
            data: RefCell::new(array),
            gradient: RefCell::new(gradient),
        }
    }

    /// Returns an immutable reference to the value array.
    pub fn data(&self) -> Ref<Array<f32, D>> {
        self.data.borrow()
    }

    /// Returns a mutable reference to the value array.
    pub fn data_mut(&self) -> RefMut<Array<f32, D>> {
        self.data.borrow_mut()
    }

    /// Returns an immutable reference to the gradient array.
    pub fn gradient(&self) -> Ref<Array<f32, D>> {
        self.gradient.borrow()
    }

    /// Returns a mutable reference to the gradient array.
    pub fn gradient_mut(&self) -> RefMut<Array<f32, D>> {
        self.gradient.borrow_mut()
    }

    /// Shape of the tensor.
    pub fn raw_dim(&self) -> D {
        self.data.borrow().raw_dim()
    }

    /// Number of elements in the tensor.
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    /// Whether the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reshapes both the value and the gradient array, zero-filled.
    ///
    /// Leaves the tensor untouched when it already has the requested shape,
    /// so repeated set-ups with identical geometry preserve state.
    pub fn resize(&self, dim: D) {
        if self.data.borrow().raw_dim() == dim {
            return;
        }

        *self.data.borrow_mut() = Array::zeros(dim.clone());
        *self.gradient.borrow_mut() = Array::zeros(dim);
    }

    /// Zero-fills the gradient array.
    pub fn zero_gradient(&self) {
        self.gradient.borrow_mut().fill(0.);
    }
}

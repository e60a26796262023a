use std::fmt;
use std::sync::{Mutex, RwLock};

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};

/// Shape of a tensor
pub type Shape = Vec<usize>;

/// Data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    Float32,
    Float64,
    Float16,
    BFloat16,
    Int8,
    Int32,
    Int64,
    Uint8,
    Bool,
}

impl DataType {
    /// Get the size in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float64 => 8,
            DataType::Float16 => 2,
            DataType::BFloat16 => 2,
            DataType::Int8 => 1,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Uint8 => 1,
            DataType::Bool => 1,
        }
    }

    /// Check if data type is a floating point type
    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            DataType::Float32 | DataType::Float64 | DataType::Float16 | DataType::BFloat16
        )
    }
}

/// Data type, shape and gradient flag of a tensor, without its values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub data_type: DataType,
    pub shape: Shape,
    pub requires_grad: bool,
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.data_type, self.shape)
    }
}

/// Tensor struct for runtime computation
///
/// Values are always held as `f32`; `data_type` is the logical type reported
/// to observers.
#[derive(Clone)]
pub struct Tensor {
    pub data_type: DataType,
    pub data: ArrayD<f32>,
    pub requires_grad: bool,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {{ data_type: {:?}, shape: {:?}, requires_grad: {} }}",
            self.data_type,
            self.data.shape(),
            self.requires_grad
        )
    }
}

impl Tensor {
    /// Create a new zero-filled tensor
    pub fn new(shape: &[usize], data_type: DataType) -> Self {
        Self {
            data_type,
            data: ArrayD::zeros(IxDyn(shape)),
            requires_grad: false,
        }
    }

    /// Wrap an `f32` array
    pub fn from_array(data: ArrayD<f32>) -> Self {
        Self {
            data_type: DataType::Float32,
            data,
            requires_grad: false,
        }
    }

    pub fn from_shape_vec(shape: &[usize], values: Vec<f32>) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Self::from_array(data))
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn descriptor(&self) -> TensorDescriptor {
        TensorDescriptor {
            data_type: self.data_type,
            shape: self.shape().to_vec(),
            requires_grad: self.requires_grad,
        }
    }

    /// Memory footprint of the logical data type
    pub fn size_in_bytes(&self) -> usize {
        self.data.len() * self.data_type.size_in_bytes()
    }

    /// Reshape the tensor, keeping element order
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let expected: usize = shape.iter().product();
        if expected != self.data.len() {
            return Err(Error::InvalidShape(format!(
                "cannot reshape {:?} ({} elements) into {:?}",
                self.shape(),
                self.data.len(),
                shape
            )));
        }
        let values: Vec<f32> = self.data.iter().copied().collect();
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Tensor {
            data_type: self.data_type,
            data,
            requires_grad: self.requires_grad,
        })
    }
}

/// Learnable tensor (or non-learnable buffer) owned by a module
///
/// Uses interior mutability so a model shared behind an `Arc` can still be
/// updated by the optimizer.
pub struct Parameter {
    data: RwLock<ArrayD<f32>>,
    grad: Mutex<Option<ArrayD<f32>>>,
    requires_grad: bool,
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parameter {{ shape: {:?}, requires_grad: {} }}",
            self.shape(),
            self.requires_grad
        )
    }
}

impl Parameter {
    /// Create a learnable parameter
    pub fn new(data: ArrayD<f32>) -> Self {
        Self {
            data: RwLock::new(data),
            grad: Mutex::new(None),
            requires_grad: true,
        }
    }

    /// Create a non-learnable buffer (e.g. running statistics)
    pub fn buffer(data: ArrayD<f32>) -> Self {
        Self {
            data: RwLock::new(data),
            grad: Mutex::new(None),
            requires_grad: false,
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Snapshot of the current value
    pub fn value(&self) -> ArrayD<f32> {
        self.data.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn shape(&self) -> Shape {
        self.data.read().unwrap_or_else(|e| e.into_inner()).shape().to_vec()
    }

    pub fn descriptor(&self) -> TensorDescriptor {
        TensorDescriptor {
            data_type: DataType::Float32,
            shape: self.shape(),
            requires_grad: self.requires_grad,
        }
    }

    /// Replace the value, rejecting a shape change
    pub fn set_value(&self, value: ArrayD<f32>) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        if data.shape() != value.shape() {
            return Err(Error::InvalidShape(format!(
                "parameter has shape {:?}, got {:?}",
                data.shape(),
                value.shape()
            )));
        }
        *data = value;
        Ok(())
    }

    /// Mutate the value in place
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ArrayD<f32>),
    {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        f(&mut data);
    }

    pub fn grad(&self) -> Option<ArrayD<f32>> {
        self.grad.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Add a gradient contribution; buffers ignore gradients
    pub fn accumulate_grad(&self, grad: &ArrayD<f32>) {
        if !self.requires_grad {
            return;
        }
        let mut slot = self.grad.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            Some(existing) if existing.shape() == grad.shape() => *existing += grad,
            _ => *slot = Some(grad.clone()),
        }
    }

    pub fn zero_grad(&self) {
        *self.grad.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

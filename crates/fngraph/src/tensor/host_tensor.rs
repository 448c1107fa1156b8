//! Host-backed tensor tagged with the device its contents live on.

use crate::device::DeviceDescriptor;
use crate::error::{ensure, Result};

use super::shape::Shape;

/// Dense f32 tensor plus the device it is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f32>,
    device: DeviceDescriptor,
}

impl Tensor {
    /// Constructs a CPU tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: impl Into<Shape>, data: Vec<f32>) -> Result<Self> {
        Tensor::from_vec_on(shape, data, DeviceDescriptor::cpu())
    }

    pub fn from_vec_on(
        shape: impl Into<Shape>,
        data: Vec<f32>,
        device: DeviceDescriptor,
    ) -> Result<Self> {
        let shape = shape.into();
        ensure!(
            data.len() == shape.num_elements(),
            argument,
            "tensor data length ({}) does not match shape {}",
            data.len(),
            shape
        );
        Ok(Tensor {
            shape,
            data,
            device,
        })
    }

    /// Returns a zero-initialized tensor of the requested shape.
    pub fn zeros(shape: impl Into<Shape>, device: DeviceDescriptor) -> Self {
        Tensor::filled(shape, 0.0, device)
    }

    pub fn ones(shape: impl Into<Shape>, device: DeviceDescriptor) -> Self {
        Tensor::filled(shape, 1.0, device)
    }

    pub fn filled(shape: impl Into<Shape>, value: f32, device: DeviceDescriptor) -> Self {
        let shape = shape.into();
        let data = vec![value; shape.num_elements()];
        Tensor {
            shape,
            data,
            device,
        }
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn device(&self) -> DeviceDescriptor {
        self.device
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Explicit transfer: returns a copy of the contents bound to `device`.
    pub fn to_device(&self, device: DeviceDescriptor) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.clone(),
            device,
        }
    }

    /// Overwrites the contents with `source`, keeping this tensor's device.
    pub fn copy_from(&mut self, source: &Tensor) -> Result<()> {
        ensure!(
            self.shape == source.shape,
            argument,
            "cannot copy tensor of shape {} into buffer of shape {}",
            source.shape,
            self.shape
        );
        self.data.copy_from_slice(&source.data);
        Ok(())
    }

    /// Element-wise accumulation used for gradient fan-in.
    pub fn accumulate(&mut self, other: &Tensor) -> Result<()> {
        ensure!(
            self.shape == other.shape,
            argument,
            "cannot accumulate tensor of shape {} into shape {}",
            other.shape,
            self.shape
        );
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += *src;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn rejects_length_mismatch() {
        let err = Tensor::from_vec([2, 2], vec![1.0; 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentMismatch);
    }

    #[test]
    fn copy_keeps_destination_device() {
        let gpu = DeviceDescriptor::gpu(1);
        let mut dst = Tensor::zeros([3], gpu);
        let src = Tensor::from_vec([3], vec![1.0, 2.0, 3.0]).unwrap();
        dst.copy_from(&src).unwrap();
        assert_eq!(dst.device(), gpu);
        assert_eq!(dst.data(), &[1.0, 2.0, 3.0]);
        assert!(dst.copy_from(&Tensor::zeros([2], gpu)).is_err());
    }

    #[test]
    fn accumulate_adds_elementwise() {
        let cpu = DeviceDescriptor::cpu();
        let mut acc = Tensor::ones([2], cpu);
        acc.accumulate(&Tensor::from_vec([2], vec![2.0, 3.0]).unwrap())
            .unwrap();
        assert_eq!(acc.data(), &[3.0, 4.0]);
    }
}

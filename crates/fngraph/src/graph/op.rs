//! Primitive operation catalog and shape inference.
//!
//! The core only knows each op's arity, attributes and output shapes. Forward and
//! backward math for every op lives behind the [`Backend`](crate::backend::Backend) seam.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ensure, Error, Result};
use crate::tensor::Shape;

pub const ATTR_FACTOR: &str = "factor";
pub const ATTR_RATE: &str = "rate";
pub const ATTR_SEED: &str = "seed";
pub const ATTR_PARTS: &str = "parts";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimitiveOp {
    Plus,
    Minus,
    ElementTimes,
    Negate,
    Sigmoid,
    Tanh,
    ReLU,
    Exp,
    Log,
    /// Multiplies every element by the `factor` attribute.
    Scale,
    /// Matrix product of two rank-2 operands.
    Times,
    /// Sums every element into a single-element tensor.
    ReduceSum,
    /// Splits the leading axis into `parts` equal outputs.
    Split,
    /// Inverted dropout with rate `rate`; the only stateful op.
    Dropout,
    /// Encapsulated composite body; never dispatched to a backend.
    Block,
}

impl PrimitiveOp {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveOp::Plus => "Plus",
            PrimitiveOp::Minus => "Minus",
            PrimitiveOp::ElementTimes => "ElementTimes",
            PrimitiveOp::Negate => "Negate",
            PrimitiveOp::Sigmoid => "Sigmoid",
            PrimitiveOp::Tanh => "Tanh",
            PrimitiveOp::ReLU => "ReLU",
            PrimitiveOp::Exp => "Exp",
            PrimitiveOp::Log => "Log",
            PrimitiveOp::Scale => "Scale",
            PrimitiveOp::Times => "Times",
            PrimitiveOp::ReduceSum => "ReduceSum",
            PrimitiveOp::Split => "Split",
            PrimitiveOp::Dropout => "Dropout",
            PrimitiveOp::Block => "Block",
        }
    }

    /// Fixed input count, `None` for blocks.
    pub fn arity(self) -> Option<usize> {
        match self {
            PrimitiveOp::Plus
            | PrimitiveOp::Minus
            | PrimitiveOp::ElementTimes
            | PrimitiveOp::Times => Some(2),
            PrimitiveOp::Block => None,
            _ => Some(1),
        }
    }

    /// Stateful ops carry RNG state that advances on every evaluation.
    pub fn is_stateful(self) -> bool {
        matches!(self, PrimitiveOp::Dropout)
    }

    pub fn infer_output_shapes(self, inputs: &[Shape], attributes: &Attributes) -> Result<Vec<Shape>> {
        if let Some(arity) = self.arity() {
            ensure!(
                inputs.len() == arity,
                argument,
                "{} expects {} inputs, got {}",
                self,
                arity,
                inputs.len()
            );
        }
        match self {
            PrimitiveOp::Plus | PrimitiveOp::Minus | PrimitiveOp::ElementTimes => {
                ensure!(
                    inputs[0] == inputs[1],
                    argument,
                    "{} operands must share a shape, got {} and {}",
                    self,
                    inputs[0],
                    inputs[1]
                );
                Ok(vec![inputs[0].clone()])
            }
            PrimitiveOp::Negate
            | PrimitiveOp::Sigmoid
            | PrimitiveOp::Tanh
            | PrimitiveOp::ReLU
            | PrimitiveOp::Exp
            | PrimitiveOp::Log => Ok(vec![inputs[0].clone()]),
            PrimitiveOp::Scale => {
                attributes.require_f64(self, ATTR_FACTOR)?;
                Ok(vec![inputs[0].clone()])
            }
            PrimitiveOp::Dropout => {
                let rate = attributes.require_f64(self, ATTR_RATE)?;
                // Kernels apply the rate in f32.
                ensure!(
                    (0.0..1.0).contains(&(rate as f32)),
                    argument,
                    "Dropout rate must lie in [0, 1), got {}",
                    rate
                );
                Ok(vec![inputs[0].clone()])
            }
            PrimitiveOp::Times => {
                let (lhs, rhs) = (inputs[0].dims(), inputs[1].dims());
                ensure!(
                    lhs.len() == 2 && rhs.len() == 2,
                    argument,
                    "Times expects rank-2 operands, got {} and {}",
                    inputs[0],
                    inputs[1]
                );
                ensure!(
                    lhs[1] == rhs[0],
                    argument,
                    "Times inner dimensions differ: {} x {}",
                    inputs[0],
                    inputs[1]
                );
                Ok(vec![Shape::new(vec![lhs[0], rhs[1]])])
            }
            PrimitiveOp::ReduceSum => Ok(vec![Shape::scalar()]),
            PrimitiveOp::Split => {
                let parts = attributes.require_i64(self, ATTR_PARTS)?;
                let dims = inputs[0].dims();
                ensure!(
                    parts > 0 && !dims.is_empty() && dims[0] % parts as usize == 0,
                    argument,
                    "Split cannot divide shape {} into {} parts",
                    inputs[0],
                    parts
                );
                let mut part = dims.to_vec();
                part[0] /= parts as usize;
                Ok(vec![Shape::new(part); parts as usize])
            }
            PrimitiveOp::Block => Err(Error::argument(
                "block output shapes come from the block body",
            )),
        }
    }
}

impl fmt::Display for PrimitiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Str(value.to_string())
    }
}

/// Ordered attribute dictionary attached to a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    entries: BTreeMap<String, AttributeValue>,
}

impl Attributes {
    pub fn new() -> Self {
        Attributes::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.get(key)
    }

    /// Reads a float attribute, accepting integers as well.
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.entries.get(key)? {
            AttributeValue::Float(value) => Some(*value),
            AttributeValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.entries.get(key)? {
            AttributeValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    fn require_f64(&self, op: PrimitiveOp, key: &str) -> Result<f64> {
        self.get_f64(key)
            .ok_or_else(|| Error::argument(format!("{op} requires float attribute '{key}'")))
    }

    fn require_i64(&self, op: PrimitiveOp, key: &str) -> Result<i64> {
        self.get_i64(key)
            .ok_or_else(|| Error::argument(format!("{op} requires integer attribute '{key}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn elementwise_requires_matching_shapes() {
        let shapes = [Shape::new([2]), Shape::new([3])];
        let err = PrimitiveOp::Plus
            .infer_output_shapes(&shapes, &Attributes::new())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentMismatch);
    }

    #[test]
    fn times_contracts_inner_dimension() {
        let shapes = [Shape::new([2, 3]), Shape::new([3, 4])];
        let out = PrimitiveOp::Times
            .infer_output_shapes(&shapes, &Attributes::new())
            .unwrap();
        assert_eq!(out, vec![Shape::new([2, 4])]);
    }

    #[test]
    fn split_divides_leading_axis() {
        let attrs = Attributes::new().with(ATTR_PARTS, 2i64);
        let out = PrimitiveOp::Split
            .infer_output_shapes(&[Shape::new([4, 3])], &attrs)
            .unwrap();
        assert_eq!(out, vec![Shape::new([2, 3]), Shape::new([2, 3])]);
        let attrs = Attributes::new().with(ATTR_PARTS, 3i64);
        assert!(PrimitiveOp::Split
            .infer_output_shapes(&[Shape::new([4, 3])], &attrs)
            .is_err());
    }

    #[test]
    fn dropout_validates_rate() {
        let ok = Attributes::new().with(ATTR_RATE, 0.5);
        assert!(PrimitiveOp::Dropout
            .infer_output_shapes(&[Shape::new([4])], &ok)
            .is_ok());
        for rate in [1.5, -0.1, 0.999_999_99] {
            let bad = Attributes::new().with(ATTR_RATE, rate);
            assert!(
                PrimitiveOp::Dropout
                    .infer_output_shapes(&[Shape::new([4])], &bad)
                    .is_err(),
                "{rate}"
            );
        }
        assert!(PrimitiveOp::Dropout.is_stateful());
        assert!(!PrimitiveOp::Plus.is_stateful());
    }
}

use fngraph::backend::{Backend, BackendError, BackendResult, KernelContext};
use fngraph::graph::op::{ATTR_FACTOR, ATTR_PARTS, ATTR_RATE};
use fngraph::{DeviceDescriptor, PrimitiveOp, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Straightforward host kernels for every primitive op. Correctness over speed: used as
/// the reference the engine is tested against.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        CpuBackend
    }
}

impl Backend for CpuBackend {
    fn backend_name(&self) -> &str {
        "ref-cpu"
    }

    fn forward(&self, ctx: &KernelContext<'_>, inputs: &[&Tensor]) -> BackendResult<Vec<Tensor>> {
        forward(ctx, inputs).map_err(|err| augment_backend_error(err, ctx))
    }

    fn backward(
        &self,
        ctx: &KernelContext<'_>,
        inputs: &[&Tensor],
        outputs: &[&Tensor],
        output_gradients: &[Option<&Tensor>],
    ) -> BackendResult<Vec<Option<Tensor>>> {
        backward(ctx, inputs, outputs, output_gradients)
            .map_err(|err| augment_backend_error(err, ctx))
    }
}

fn augment_backend_error(err: BackendError, ctx: &KernelContext<'_>) -> BackendError {
    match err {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!("{} ({}): {message}", ctx.node_uid, ctx.op),
        },
        other => other,
    }
}

fn forward(ctx: &KernelContext<'_>, inputs: &[&Tensor]) -> BackendResult<Vec<Tensor>> {
    let device = ctx.device;
    let single = |data: Vec<f32>| -> BackendResult<Vec<Tensor>> {
        Ok(vec![tensor(output_shape(ctx, 0)?, data, device)?])
    };
    match ctx.op {
        PrimitiveOp::Plus => single(zip_map(inputs, |a, b| a + b)?),
        PrimitiveOp::Minus => single(zip_map(inputs, |a, b| a - b)?),
        PrimitiveOp::ElementTimes => single(zip_map(inputs, |a, b| a * b)?),
        PrimitiveOp::Negate => single(unary_map(inputs, |x| -x)?),
        PrimitiveOp::Sigmoid => single(unary_map(inputs, sigmoid)?),
        PrimitiveOp::Tanh => single(unary_map(inputs, f32::tanh)?),
        PrimitiveOp::ReLU => single(unary_map(inputs, |x| x.max(0.0))?),
        PrimitiveOp::Exp => single(unary_map(inputs, f32::exp)?),
        PrimitiveOp::Log => single(unary_map(inputs, f32::ln)?),
        PrimitiveOp::Scale => {
            let factor = float_attribute(ctx, ATTR_FACTOR)? as f32;
            single(unary_map(inputs, |x| x * factor)?)
        }
        PrimitiveOp::Times => {
            let (lhs, rhs) = (operand(inputs, 0)?, operand(inputs, 1)?);
            let (m, k) = matrix_dims(lhs.shape())?;
            let (_, n) = matrix_dims(rhs.shape())?;
            single(matmul(lhs.data(), rhs.data(), m, k, n))
        }
        PrimitiveOp::ReduceSum => single(vec![operand(inputs, 0)?.data().iter().sum()]),
        PrimitiveOp::Split => {
            let input = operand(inputs, 0)?;
            let parts = split_parts(ctx, input)?;
            let chunk = input.len() / parts;
            (0..parts)
                .map(|index| {
                    let values = input.data()[index * chunk..(index + 1) * chunk].to_vec();
                    tensor(output_shape(ctx, index)?, values, device)
                })
                .collect()
        }
        PrimitiveOp::Dropout => {
            let input = operand(inputs, 0)?;
            let mask = dropout_mask(ctx, input.len())?;
            single(
                input
                    .data()
                    .iter()
                    .zip(&mask)
                    .map(|(x, m)| x * m)
                    .collect(),
            )
        }
        PrimitiveOp::Block => Err(BackendError::unimplemented(
            "Block",
            "block bodies are inlined into execution plans",
        )),
    }
}

fn backward(
    ctx: &KernelContext<'_>,
    inputs: &[&Tensor],
    outputs: &[&Tensor],
    output_gradients: &[Option<&Tensor>],
) -> BackendResult<Vec<Option<Tensor>>> {
    let grad = match (ctx.op, output_gradients.first().copied().flatten()) {
        (PrimitiveOp::Split, _) => return split_backward(ctx, inputs, output_gradients),
        (_, Some(grad)) => grad,
        (_, None) => return Ok(vec![None; inputs.len()]),
    };
    let device = ctx.device;
    let like = |index: usize, data: Vec<f32>| -> BackendResult<Option<Tensor>> {
        Ok(Some(tensor(operand(inputs, index)?.shape().clone(), data, device)?))
    };
    let g = grad.data();

    match ctx.op {
        PrimitiveOp::Plus => Ok(vec![like(0, g.to_vec())?, like(1, g.to_vec())?]),
        PrimitiveOp::Minus => Ok(vec![
            like(0, g.to_vec())?,
            like(1, g.iter().map(|v| -v).collect())?,
        ]),
        PrimitiveOp::ElementTimes => {
            let (a, b) = (operand(inputs, 0)?.data(), operand(inputs, 1)?.data());
            Ok(vec![
                like(0, mul(g, b))?,
                like(1, mul(g, a))?,
            ])
        }
        PrimitiveOp::Negate => Ok(vec![like(0, g.iter().map(|v| -v).collect())?]),
        PrimitiveOp::Sigmoid => {
            let y = operand(outputs, 0)?.data();
            let data = g.iter().zip(y).map(|(g, y)| g * y * (1.0 - y)).collect();
            Ok(vec![like(0, data)?])
        }
        PrimitiveOp::Tanh => {
            let y = operand(outputs, 0)?.data();
            let data = g.iter().zip(y).map(|(g, y)| g * (1.0 - y * y)).collect();
            Ok(vec![like(0, data)?])
        }
        PrimitiveOp::ReLU => {
            let x = operand(inputs, 0)?.data();
            let data = g
                .iter()
                .zip(x)
                .map(|(g, x)| if *x > 0.0 { *g } else { 0.0 })
                .collect();
            Ok(vec![like(0, data)?])
        }
        PrimitiveOp::Exp => {
            let y = operand(outputs, 0)?.data();
            Ok(vec![like(0, mul(g, y))?])
        }
        PrimitiveOp::Log => {
            let x = operand(inputs, 0)?.data();
            let data = g.iter().zip(x).map(|(g, x)| g / x).collect();
            Ok(vec![like(0, data)?])
        }
        PrimitiveOp::Scale => {
            let factor = float_attribute(ctx, ATTR_FACTOR)? as f32;
            Ok(vec![like(0, g.iter().map(|v| v * factor).collect())?])
        }
        PrimitiveOp::Times => {
            let (lhs, rhs) = (operand(inputs, 0)?, operand(inputs, 1)?);
            let (m, k) = matrix_dims(lhs.shape())?;
            let (_, n) = matrix_dims(rhs.shape())?;
            // dL = G * R^T, dR = L^T * G
            let rhs_t = transpose(rhs.data(), k, n);
            let lhs_t = transpose(lhs.data(), m, k);
            Ok(vec![
                like(0, matmul(g, &rhs_t, m, n, k))?,
                like(1, matmul(&lhs_t, g, k, m, n))?,
            ])
        }
        PrimitiveOp::ReduceSum => {
            let input = operand(inputs, 0)?;
            let seed = g.first().copied().unwrap_or(0.0);
            Ok(vec![like(0, vec![seed; input.len()])?])
        }
        PrimitiveOp::Dropout => {
            let mask = dropout_mask(ctx, g.len())?;
            Ok(vec![like(0, mul(g, &mask))?])
        }
        PrimitiveOp::Split => split_backward(ctx, inputs, output_gradients),
        PrimitiveOp::Block => Err(BackendError::unimplemented(
            "Block",
            "block bodies are inlined into execution plans",
        )),
    }
}

/// Concatenates the part gradients back along the leading axis; parts without flow
/// contribute zeros.
fn split_backward(
    ctx: &KernelContext<'_>,
    inputs: &[&Tensor],
    output_gradients: &[Option<&Tensor>],
) -> BackendResult<Vec<Option<Tensor>>> {
    if output_gradients.iter().all(Option::is_none) {
        return Ok(vec![None]);
    }
    let input = operand(inputs, 0)?;
    let parts = split_parts(ctx, input)?;
    let chunk = input.len() / parts;
    let mut data = Vec::with_capacity(input.len());
    for index in 0..parts {
        match output_gradients.get(index).copied().flatten() {
            Some(grad) => data.extend_from_slice(grad.data()),
            None => data.extend(std::iter::repeat(0.0).take(chunk)),
        }
    }
    Ok(vec![Some(tensor(input.shape().clone(), data, ctx.device)?)])
}

fn tensor(shape: Shape, data: Vec<f32>, device: DeviceDescriptor) -> BackendResult<Tensor> {
    Tensor::from_vec_on(shape, data, device).map_err(|err| BackendError::execution(err.to_string()))
}

fn operand<'t>(tensors: &[&'t Tensor], index: usize) -> BackendResult<&'t Tensor> {
    tensors
        .get(index)
        .copied()
        .ok_or_else(|| BackendError::execution(format!("missing operand {index}")))
}

fn output_shape(ctx: &KernelContext<'_>, index: usize) -> BackendResult<Shape> {
    ctx.output_shapes
        .get(index)
        .cloned()
        .ok_or_else(|| BackendError::execution(format!("missing output shape {index}")))
}

fn float_attribute(ctx: &KernelContext<'_>, key: &str) -> BackendResult<f64> {
    ctx.attributes
        .get_f64(key)
        .ok_or_else(|| BackendError::execution(format!("missing float attribute '{key}'")))
}

fn split_parts(ctx: &KernelContext<'_>, input: &Tensor) -> BackendResult<usize> {
    let parts = ctx
        .attributes
        .get_i64(ATTR_PARTS)
        .and_then(|parts| usize::try_from(parts).ok())
        .filter(|parts| *parts > 0)
        .ok_or_else(|| BackendError::execution("split requires a positive 'parts' attribute"))?;
    if input.len() % parts != 0 {
        return Err(BackendError::execution(format!(
            "cannot split {} elements into {parts} parts",
            input.len()
        )));
    }
    Ok(parts)
}

fn unary_map(inputs: &[&Tensor], f: impl Fn(f32) -> f32) -> BackendResult<Vec<f32>> {
    Ok(operand(inputs, 0)?.data().iter().map(|x| f(*x)).collect())
}

fn zip_map(inputs: &[&Tensor], f: impl Fn(f32, f32) -> f32) -> BackendResult<Vec<f32>> {
    let (lhs, rhs) = (operand(inputs, 0)?, operand(inputs, 1)?);
    if lhs.len() != rhs.len() {
        return Err(BackendError::execution(format!(
            "operand lengths differ: {} vs {}",
            lhs.len(),
            rhs.len()
        )));
    }
    Ok(lhs
        .data()
        .iter()
        .zip(rhs.data())
        .map(|(a, b)| f(*a, *b))
        .collect())
}

fn mul(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter().zip(b).map(|(a, b)| a * b).collect()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn matrix_dims(shape: &Shape) -> BackendResult<(usize, usize)> {
    match shape.dims() {
        [rows, cols] => Ok((*rows, *cols)),
        _ => Err(BackendError::execution(format!(
            "expected a rank-2 operand, got {shape}"
        ))),
    }
}

/// Row-major `[m, k] x [k, n]`.
fn matmul(lhs: &[f32], rhs: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for p in 0..k {
            let a = lhs[i * k + p];
            for j in 0..n {
                out[i * n + j] += a * rhs[p * n + j];
            }
        }
    }
    out
}

fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = data[r * cols + c];
        }
    }
    out
}

/// Inverted-dropout mask for the stream position in `ctx`: kept elements are scaled by
/// `1 / (1 - rate)`, dropped ones are zero. The same position always yields the same mask.
fn dropout_mask(ctx: &KernelContext<'_>, len: usize) -> BackendResult<Vec<f32>> {
    let rate = float_attribute(ctx, ATTR_RATE)? as f32;
    if !(0.0..1.0).contains(&rate) {
        return Err(BackendError::execution(format!(
            "dropout rate {rate} lies outside [0, 1)"
        )));
    }
    let state = ctx
        .rng
        .ok_or_else(|| BackendError::execution("dropout evaluated without random state"))?;
    let mut rng = StdRng::seed_from_u64(state.stream_seed());
    let keep = 1.0 / (1.0 - rate);
    Ok((0..len)
        .map(|_| if rng.gen::<f32>() < rate { 0.0 } else { keep })
        .collect())
}

//! Incremental gradient update functions for backprop
//!
//! Applied depending on the operation which created outputs from inputs. Corresponds to
//! a node in the computation graph.

use crate::values::Value;

/// Represents the function in the computation graph
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackpropFunc {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    ReLU,
    /// Leaky ReLU with the given negative slope
    LeakyReLU(f32),
    Sigmoid,
    Sqrt,
    /// Sum over an arbitrary number of operands
    Sum,
}

impl BackpropFunc {
    /// Number of operands the function consumes, `None` when variadic
    pub fn n_operands(&self) -> Option<usize> {
        match self {
            BackpropFunc::Add
            | BackpropFunc::Sub
            | BackpropFunc::Mul
            | BackpropFunc::Div => Some(2),
            BackpropFunc::Neg
            | BackpropFunc::ReLU
            | BackpropFunc::LeakyReLU(_)
            | BackpropFunc::Sigmoid
            | BackpropFunc::Sqrt => Some(1),
            BackpropFunc::Sum => None,
        }
    }
}

/// Takes two values and updates their gradients
/// Represents backprop for the operation `in1 + in2 = out`
pub fn add(in1: &Value, in2: &Value, out: &Value) {
    in1.0.borrow_mut().grad += out.0.borrow().grad;
    in2.0.borrow_mut().grad += out.0.borrow().grad;
}

/// Represents backprop for the operation `in1 - in2 = out`
pub fn sub(in1: &Value, in2: &Value, out: &Value) {
    in1.0.borrow_mut().grad += out.0.borrow().grad;
    in2.0.borrow_mut().grad += -out.0.borrow().grad;
}

/// Represents backprop for the operation `in1 * in2 = out`
pub fn mul(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.0.borrow().grad;
    let in1_data = in1.0.borrow().data;
    let in2_data = in2.0.borrow().data;
    // operands may be the same node (`x * x`), so never hold two borrows at once
    in1.0.borrow_mut().grad += in2_data * grad;
    in2.0.borrow_mut().grad += in1_data * grad;
}

/// Represents backprop for the operation `in1 / in2 = out`
pub fn div(in1: &Value, in2: &Value, out: &Value) {
    let grad = out.0.borrow().grad;
    let in1_data = in1.0.borrow().data;
    let in2_data = in2.0.borrow().data;
    in1.0.borrow_mut().grad += grad / in2_data;
    in2.0.borrow_mut().grad += -in1_data * grad / (in2_data.powf(2.0));
}

/// Represents backprop for the operation `-in = out`
pub fn neg(in1: &Value, out: &Value) {
    let grad = out.0.borrow().grad;
    in1.0.borrow_mut().grad += -grad;
}

/// Represents backprop for the operation `relu(in) = out`
pub fn relu(in1: &Value, out: &Value) {
    let in1_data = in1.0.borrow().data;
    let grad = out.0.borrow().grad;
    in1.0.borrow_mut().grad += if in1_data > 0.0 { grad } else { 0.0 };
}

/// Represents backprop for the operation `leaky_relu(in) = out`
pub fn leaky_relu(in1: &Value, out: &Value, alpha: f32) {
    let in1_data = in1.0.borrow().data;
    let grad = out.0.borrow().grad;
    in1.0.borrow_mut().grad += if in1_data > 0.0 { grad } else { alpha * grad };
}

/// Represents backprop for the operation `sigmoid(in) = out`
pub fn sigmoid(in1: &Value, out: &Value) {
    let grad = out.0.borrow().grad;
    let out_data = out.0.borrow().data;
    in1.0.borrow_mut().grad += out_data * (1.0 - out_data) * grad;
}

/// Represents backprop for the operation `sqrt(in) = out`
/// The derivative is unbounded at zero, where the subgradient 0 is used instead
pub fn sqrt(in1: &Value, out: &Value) {
    let grad = out.0.borrow().grad;
    let out_data = out.0.borrow().data;
    if out_data > 0.0 {
        in1.0.borrow_mut().grad += grad / (2.0 * out_data);
    }
}

/// Represents backprop for the operation `in_1 + ... + in_n = out`
pub fn sum(inputs: &[Value], out: &Value) {
    let grad = out.0.borrow().grad;
    for input in inputs {
        input.0.borrow_mut().grad += grad;
    }
}

/// Applies a backprop function for operators with two operands
pub fn update_gradients_two_operands(in1: &Value, in2: &Value, out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Add) => add(in1, in2, out),
        Some(BackpropFunc::Sub) => sub(in1, in2, out),
        Some(BackpropFunc::Mul) => mul(in1, in2, out),
        Some(BackpropFunc::Div) => div(in1, in2, out),
        Some(BackpropFunc::Sum) => sum(&[in1.clone(), in2.clone()], out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Applies a backprop function for operators with one operand
pub fn update_gradients_one_operand(in1: &Value, out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match backprop_fn {
        Some(BackpropFunc::Neg) => neg(in1, out),
        Some(BackpropFunc::ReLU) => relu(in1, out),
        Some(BackpropFunc::LeakyReLU(alpha)) => leaky_relu(in1, out, alpha),
        Some(BackpropFunc::Sigmoid) => sigmoid(in1, out),
        Some(BackpropFunc::Sqrt) => sqrt(in1, out),
        Some(BackpropFunc::Sum) => sum(std::slice::from_ref(in1), out),
        None => {}
        _ => panic!("Invalid backprop function: {:?}", backprop_fn),
    }
}

/// Dispatches to the right update for a node given all of its operands
pub fn update_gradients(inputs: &[Value], out: &Value) {
    let backprop_fn = { out.0.borrow().backprop_fn };
    match (backprop_fn, inputs) {
        (None, _) | (_, []) => {}
        (Some(BackpropFunc::Sum), inputs) => sum(inputs, out),
        (_, [in1]) => update_gradients_one_operand(in1, out),
        (_, [in1, in2]) => update_gradients_two_operands(in1, in2, out),
        (Some(f), inputs) => panic!(
            "Unsupported number of operands for {:?}: {}",
            f,
            inputs.len()
        ),
    }
}

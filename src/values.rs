//! Scalar values which form a computation graph
use std::{
    cell::RefCell,
    collections::HashSet,
    iter::Sum,
    ops::{Add, Div, Mul, Neg, Sub},
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::backprop_fns::{BackpropFunc, update_gradients};

type SharedValue = Rc<RefCell<InnerValue>>;

/// Newtype representing a shared value in a computation graph
#[derive(Debug, Clone)]
pub struct Value(pub(crate) SharedValue);

impl Value {
    /// Create a new value, not derived from any other values
    pub fn new(data: f32) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(data, None))))
    }

    /// Create a new value derived from an operation on other values (i.e. not a leaf node)
    fn new_derived(data: f32, backprop_fn: BackpropFunc) -> Self {
        Self(Rc::new(RefCell::new(InnerValue::new(
            data,
            Some(backprop_fn),
        ))))
    }

    fn add_child(&self, child: Value) {
        self.0.borrow_mut().children.push(child.0);
    }

    pub fn data(&self) -> f32 {
        self.0.borrow().data
    }

    pub fn grad(&self) -> f32 {
        self.0.borrow().grad
    }

    fn id(&self) -> u64 {
        self.0.borrow().id
    }

    // Strictly, &mut isn't needed since the value is behind a shared mutable type,
    // but it indicates that the value should be excusively mutable
    pub fn set_data(&mut self, data: f32) {
        self.0.borrow_mut().data = data;
    }

    /// Unlike PyTorch which only zeros out the gradients of the leaf nodes, this zeros out
    /// all gradients in the computation graph which are children of this node
    pub fn zero_grad(&mut self) {
        for value in self.topological_order() {
            value.0.borrow_mut().grad = 0.0;
        }
    }

    pub fn backward(&self) {
        // d out / d out = 1
        self.0.borrow_mut().grad = 1.0;

        // apply backprop, reversed to start from root first
        for value in self.topological_order().into_iter().rev() {
            let inputs = value
                .0
                .borrow()
                .children
                .iter()
                .map(|c| Value(c.clone()))
                .collect::<Vec<_>>();
            if let Some(n_operands) = value.0.borrow().backprop_fn.and_then(|f| f.n_operands()) {
                debug_assert!(n_operands == inputs.len());
            }
            update_gradients(&inputs, &value);
        }
    }

    /// Post order over the graph rooted at this value. Walked with an explicit stack
    /// since conv and dense layers build chains far deeper than the thread stack allows.
    fn topological_order(&self) -> Vec<Value> {
        let mut order = vec![];
        let mut visited: HashSet<u64> = HashSet::new();
        let mut stack = vec![(self.clone(), false)];
        while let Some((value, expanded)) = stack.pop() {
            if expanded {
                order.push(value);
                continue;
            }
            if !visited.insert(value.id()) {
                continue;
            }
            stack.push((value.clone(), true));
            for c in value.0.borrow().children.iter() {
                if !visited.contains(&c.borrow().id) {
                    stack.push((Value(c.clone()), false));
                }
            }
        }
        order
    }
}

// Various operations on values
impl Value {
    pub fn relu(&self) -> Value {
        let result = Value::new_derived(self.0.borrow().data.max(0.0), BackpropFunc::ReLU);
        result.add_child(self.clone());

        result
    }

    pub fn leaky_relu(&self, alpha: f32) -> Value {
        let data = self.0.borrow().data;
        let data = if data > 0.0 { data } else { alpha * data };
        let result = Value::new_derived(data, BackpropFunc::LeakyReLU(alpha));
        result.add_child(self.clone());

        result
    }

    pub fn sigmoid(&self) -> Value {
        let x = self.0.borrow().data;
        // split on the sign so exp never overflows
        let data = if x >= 0.0 {
            1.0 / (1.0 + (-x).exp())
        } else {
            let e = x.exp();
            e / (1.0 + e)
        };
        let result = Value::new_derived(data, BackpropFunc::Sigmoid);
        result.add_child(self.clone());

        result
    }

    pub fn sqrt(&self) -> Value {
        let result = Value::new_derived(self.0.borrow().data.sqrt(), BackpropFunc::Sqrt);
        result.add_child(self.clone());

        result
    }

    /// Sums any number of values into a single node rather than a chain of additions
    pub fn sum_of(values: &[Value]) -> Value {
        let data = values.iter().map(|v| v.data()).sum::<f32>();
        let result = Value::new_derived(data, BackpropFunc::Sum);
        for v in values {
            result.add_child(v.clone());
        }

        result
    }
}

impl Add for &Value {
    type Output = Value;

    fn add(self, other: &Value) -> Value {
        let data = self.0.borrow().data + other.0.borrow().data;

        let result = Value::new_derived(data, BackpropFunc::Add);
        result.add_child(self.clone());
        result.add_child(other.clone());

        result
    }
}

impl Sub for &Value {
    type Output = Value;

    fn sub(self, other: &Value) -> Value {
        let result = Value::new_derived(
            self.0.borrow().data - other.0.borrow().data,
            BackpropFunc::Sub,
        );
        result.add_child(self.clone());
        result.add_child(other.clone());

        result
    }
}

impl Mul for &Value {
    type Output = Value;

    fn mul(self, other: &Value) -> Value {
        let result = Value::new_derived(
            self.0.borrow().data * other.0.borrow().data,
            BackpropFunc::Mul,
        );
        result.add_child(self.clone());
        result.add_child(other.clone());

        result
    }
}

impl Div for &Value {
    type Output = Value;

    fn div(self, other: &Value) -> Value {
        let data = if other.0.borrow().data.is_nan() {
            0.0
        } else {
            self.0.borrow().data / other.0.borrow().data
        };
        let result = Value::new_derived(data, BackpropFunc::Div);
        result.add_child(self.clone());
        result.add_child(other.clone());

        result
    }
}

impl Neg for &Value {
    type Output = Value;

    fn neg(self) -> Value {
        let result = Value::new_derived(-self.0.borrow().data, BackpropFunc::Neg);
        result.add_child(self.clone());

        result
    }
}

impl Sum for Value {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Value::sum_of(&iter.collect::<Vec<_>>())
    }
}

/// Convenience macro to implement operations on `[Value]` when ownership can be transferred
macro_rules! impl_arithmetic(
    ($trait:ident, $trait_method:ident, $operator:tt, $struct:ident) => {
        impl $trait for $struct {
            type Output = Self;

            fn $trait_method(self, other: Self) -> Self {
                &self $operator &other
            }
        }
    }
);
impl_arithmetic!(Add, add, +, Value);
impl_arithmetic!(Sub, sub, -, Value);
impl_arithmetic!(Mul, mul, *, Value);
impl_arithmetic!(Div, div, /, Value);

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.0.borrow().data == other.0.borrow().data
    }
}

impl Eq for Value {}

// unfortunate that there isn't a blanket impl for AsRef<T> for T
// <https://doc.rust-lang.org/std/convert/trait.AsRef.html#reflexivity>
impl AsRef<Value> for Value {
    fn as_ref(&self) -> &Value {
        self
    }
}

#[derive(Debug)]
pub(crate) struct InnerValue {
    // the network uses 32 bit precision floats (roughly 7 decimal digits of precision)
    pub(crate) data: f32,
    /// gradient of the value with respect to the output
    pub(crate) grad: f32,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedValue>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this value from its children
    /// `None` when the value is a leaf node
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerValue {
    pub fn new(data: f32, backprop_fn: Option<BackpropFunc>) -> Self {
        Self {
            data,
            grad: 0.0,
            children: vec![],
            id: next_id(),
            backprop_fn,
        }
    }
}

// Dropping the root of a deep graph would otherwise recurse once per node
impl Drop for InnerValue {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(child) = pending.pop() {
            if let Ok(cell) = Rc::try_unwrap(child) {
                let mut inner = cell.into_inner();
                pending.append(&mut inner.children);
            }
        }
    }
}

fn next_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(0);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

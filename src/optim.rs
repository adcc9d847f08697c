//! Optimizer(s)

use crate::values::Value;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
    fn lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
}

/// Adam, <https://arxiv.org/abs/1412.6980>
pub struct Adam {
    params: Vec<Value>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    // number of steps taken, for bias correction
    t: i32,
    // first and second moment estimates per parameter
    m: Vec<f32>,
    v: Vec<f32>,
}

impl Adam {
    pub fn new(params: Vec<Value>, lr: f32, beta1: f32, beta2: f32) -> Self {
        let n = params.len();
        Self {
            params,
            lr,
            beta1,
            beta2,
            eps: 1e-8,
            t: 0,
            m: vec![0.0; n],
            v: vec![0.0; n],
        }
    }

    pub fn n_params(&self) -> usize {
        self.params.len()
    }

    #[cfg(test)]
    fn moments(&self) -> (&[f32], &[f32]) {
        (&self.m, &self.v)
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);
        for (idx, param) in self.params.iter_mut().enumerate() {
            let grad = param.grad();
            self.m[idx] = self.beta1 * self.m[idx] + (1.0 - self.beta1) * grad;
            self.v[idx] = self.beta2 * self.v[idx] + (1.0 - self.beta2) * grad * grad;
            let m_hat = self.m[idx] / bias1;
            let v_hat = self.v[idx] / bias2;
            let new_val = param.data() - self.lr * m_hat / (v_hat.sqrt() + self.eps);
            param.set_data(new_val);
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// Multiplicative learning rate decay with a lower bound, applied only when the caller asks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrDecay {
    pub rate: f32,
    pub floor: f32,
}

impl LrDecay {
    pub fn new(rate: f32, floor: f32) -> Self {
        Self { rate, floor }
    }

    /// Decays the learning rate of `optim` once and returns the new value
    pub fn apply(&self, optim: &mut dyn Optim) -> f32 {
        let lr = (optim.lr() * self.rate).max(self.floor);
        optim.set_lr(lr);
        lr
    }
}

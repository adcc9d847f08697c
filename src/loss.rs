//! Loss function(s)

use crate::values::Value;

/// Least squares GAN loss of a batch of discriminator outputs against a constant label
///
/// Computed as `‖pred - target‖₂ / batch_size`, so it grows with the euclidean distance of
/// the whole batch rather than averaging squared errors.
pub struct LsganLoss;

impl LsganLoss {
    pub fn call<T>(y_pred: &[T], target: f32, batch_size: usize) -> Value
    where
        T: AsRef<Value>,
    {
        let target = Value::new(target);
        let squares = y_pred
            .iter()
            .map(|p| {
                let d = p.as_ref() - &target;
                &d * &d
            })
            .collect::<Vec<_>>();
        &Value::sum_of(&squares).sqrt() / &Value::new(batch_size.max(1) as f32)
    }
}

/// Scalar losses of one adversarial update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GanLosses {
    pub d_loss: f32,
    pub d_real_loss: f32,
    pub d_fake_loss: f32,
    pub g_loss: f32,
    /// Mean discriminator probability on the real batch
    pub d_real: f32,
    /// Mean discriminator probability on the generated batch
    pub d_fake: f32,
}

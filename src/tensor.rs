//! Shaped collections of [`Value`]s
//!
//! Images are stored NHWC: batch, height, width, channels, with channels varying fastest.

use crate::{nn::NNError, values::Value};

/// A row-major n-dimensional array of values
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<Value>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<Value>) -> Result<Self, NNError> {
        let expected = shape.iter().product::<usize>();
        if expected != values.len() {
            return Err(NNError::InputSizeMismatch {
                expected,
                got: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    /// Wraps raw floats as fresh leaf values
    pub fn from_f32(shape: Vec<usize>, data: &[f32]) -> Result<Self, NNError> {
        Self::new(shape, data.iter().map(|v| Value::new(*v)).collect())
    }

    /// Stacks equally sized rows into a `[rows, ...item_shape]` tensor
    pub fn from_rows<R: AsRef<[f32]>>(item_shape: &[usize], rows: &[R]) -> Result<Self, NNError> {
        let shape = std::iter::once(rows.len())
            .chain(item_shape.iter().copied())
            .collect::<Vec<_>>();
        let data = rows
            .iter()
            .flat_map(|r| r.as_ref().iter().copied())
            .collect::<Vec<_>>();
        Self::from_f32(shape, &data)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Current data of every element, detached from the graph
    pub fn data(&self) -> Vec<f32> {
        self.values.iter().map(|v| v.data()).collect()
    }

    /// Leading dimension
    pub fn batch_size(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Returns `(batch, height, width, channels)` for image tensors
    pub fn dims4(&self) -> Result<(usize, usize, usize, usize), NNError> {
        match self.shape.as_slice() {
            &[n, h, w, c] => Ok((n, h, w, c)),
            other => Err(NNError::RankMismatch {
                expected: 4,
                got: other.len(),
            }),
        }
    }

    /// Returns `(batch, features)` for flat tensors
    pub fn dims2(&self) -> Result<(usize, usize), NNError> {
        match self.shape.as_slice() {
            &[n, f] => Ok((n, f)),
            other => Err(NNError::RankMismatch {
                expected: 2,
                got: other.len(),
            }),
        }
    }

    /// Element `(n, y, x, c)` of an NHWC tensor, the caller guarantees the shape is 4D
    pub(crate) fn at4(&self, n: usize, y: usize, x: usize, c: usize) -> &Value {
        let (_, h, w, ch) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        &self.values[((n * h + y) * w + x) * ch + c]
    }

    /// Reinterprets the buffer under a new shape with the same element count
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, NNError> {
        Self::new(shape, self.values)
    }

    /// Collapses every dimension after the first
    pub fn flatten(self) -> Result<Self, NNError> {
        let n = self.batch_size();
        let features = if n == 0 { 0 } else { self.values.len() / n };
        self.reshape(vec![n, features])
    }

    /// Applies `f` element-wise, keeping the shape
    pub fn map(&self, f: impl Fn(&Value) -> Value) -> Self {
        Self {
            shape: self.shape.clone(),
            values: self.values.iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_checks() {
        let err = Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            NNError::InputSizeMismatch {
                expected: 4,
                got: 3
            }
        ));

        let t = Tensor::from_f32(vec![1, 2, 2, 1], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.dims4().unwrap(), (1, 2, 2, 1));
        assert!(matches!(
            t.dims2(),
            Err(NNError::RankMismatch {
                expected: 2,
                got: 4
            })
        ));
    }

    #[test]
    fn test_nhwc_indexing() {
        // 1 x 2 x 2 x 2, value encodes its own coordinates
        let data = (0..8).map(|i| i as f32).collect::<Vec<_>>();
        let t = Tensor::from_f32(vec![1, 2, 2, 2], &data).unwrap();
        assert_eq!(t.at4(0, 0, 0, 1).data(), 1.0);
        assert_eq!(t.at4(0, 0, 1, 0).data(), 2.0);
        assert_eq!(t.at4(0, 1, 0, 0).data(), 4.0);
        assert_eq!(t.at4(0, 1, 1, 1).data(), 7.0);
    }

    #[test]
    fn test_from_rows_and_flatten() {
        let rows = vec![vec![0.0, 1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0, 7.0]];
        let t = Tensor::from_rows(&[2, 2, 1], &rows).unwrap();
        assert_eq!(t.shape(), &[2, 2, 2, 1]);
        let flat = t.flatten().unwrap();
        assert_eq!(flat.shape(), &[2, 4]);
        assert_eq!(flat.data(), (0..8).map(|i| i as f32).collect::<Vec<_>>());
    }
}

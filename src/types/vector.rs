//! Parameter vector
//!
//! The averaged payload is opaque to the protocol: the only operations
//! needed are scaled elementwise addition and division by a scalar.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Two vectors of different length were combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Dense vector of parameters, serialized as a plain JSON array
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamVector(Vec<f64>);

impl ParamVector {
    /// All-zero vector of the given dimension
    pub fn zeros(dimension: usize) -> Self {
        Self(vec![0.0; dimension])
    }

    pub fn from_vec(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// `self += scale * other`
    pub fn add_scaled(&mut self, other: &ParamVector, scale: f64) -> Result<(), DimensionMismatch> {
        if self.len() != other.len() {
            return Err(DimensionMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }
        for (acc, x) in self.0.iter_mut().zip(other.0.iter()) {
            *acc += scale * x;
        }
        Ok(())
    }

    /// New vector with every element divided by `divisor`
    pub fn divided_by(&self, divisor: f64) -> ParamVector {
        Self(self.0.iter().map(|x| x / divisor).collect())
    }

    /// Whether `self + scale * other` would keep every element finite.
    /// Vectors of different length never pass.
    pub fn add_scaled_stays_finite(&self, other: &ParamVector, scale: f64) -> bool {
        self.len() == other.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(acc, x)| (acc + scale * x).is_finite())
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|x| x.is_finite())
    }
}

impl From<Vec<f64>> for ParamVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

impl fmt::Display for ParamVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Long vectors are abbreviated in logs
        const SHOWN: usize = 4;
        write!(f, "[")?;
        for (i, x) in self.0.iter().take(SHOWN).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:.4}", x)?;
        }
        if self.0.len() > SHOWN {
            write!(f, ", … ({} total)", self.0.len())?;
        }
        write!(f, "]")
    }
}

/// Parses comma separated values, e.g. `"1.0,2.5,-3"`
impl FromStr for ParamVector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|part| {
                let part = part.trim();
                part.parse::<f64>()
                    .map_err(|e| format!("invalid vector element '{}': {}", part, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if values.is_empty() {
            return Err("vector must have at least one element".to_string());
        }
        Ok(Self(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_scaled_accumulates() {
        let mut sum = ParamVector::zeros(2);
        sum.add_scaled(&ParamVector::from_vec(vec![1.0, 2.0]), 2.0).unwrap();
        sum.add_scaled(&ParamVector::from_vec(vec![4.0, -1.0]), 3.0).unwrap();
        assert_eq!(sum.as_slice(), &[14.0, 1.0]);
        assert_eq!(sum.divided_by(5.0).as_slice(), &[2.8, 0.2]);
    }

    #[test]
    fn test_add_scaled_stays_finite() {
        let sum = ParamVector::from_vec(vec![1e308, 0.0]);
        let small = ParamVector::from_vec(vec![1.0, 1.0]);
        assert!(sum.add_scaled_stays_finite(&small, 2.0));
        assert!(!sum.add_scaled_stays_finite(&ParamVector::from_vec(vec![1e308, 0.0]), 1.0));
        assert!(!ParamVector::zeros(1).add_scaled_stays_finite(&ParamVector::from_vec(vec![1e308]), 10.0));
        assert!(!ParamVector::zeros(2).add_scaled_stays_finite(&ParamVector::zeros(3), 1.0));
    }

    #[test]
    fn test_add_scaled_rejects_wrong_dimension() {
        let mut sum = ParamVector::zeros(3);
        let err = sum
            .add_scaled(&ParamVector::from_vec(vec![1.0]), 1.0)
            .unwrap_err();
        assert_eq!(err, DimensionMismatch { expected: 3, actual: 1 });
        assert_eq!(sum, ParamVector::zeros(3));
    }

    #[test]
    fn test_parse_from_str() {
        let v: ParamVector = "1.5, 2,-3".parse().unwrap();
        assert_eq!(v.as_slice(), &[1.5, 2.0, -3.0]);
        assert!("1.0,abc".parse::<ParamVector>().is_err());
    }

    #[test]
    fn test_serializes_as_array() {
        let v = ParamVector::from_vec(vec![1.0, 0.5]);
        assert_eq!(serde_json::to_string(&v).unwrap(), "[1.0,0.5]");
    }

    #[test]
    fn test_display_abbreviates() {
        let v = ParamVector::zeros(10);
        assert!(v.to_string().contains("10 total"));
        assert_eq!(ParamVector::from_vec(vec![1.0]).to_string(), "[1.0000]");
    }
}

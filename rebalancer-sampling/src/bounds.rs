use thiserror::Error;

/// Raised when constructing invalid [`RateBounds`].
#[derive(Clone, Copy, Debug, Error, PartialEq)]
#[error("invalid sample rate bounds [{min}, {max}]")]
pub struct InvalidBounds {
    /// The requested lower bound.
    pub min: f64,
    /// The requested upper bound.
    pub max: f64,
}

/// Global lower and upper bounds for every computed sample rate.
///
/// Invariant: `0.0 <= min <= max <= 1.0`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateBounds {
    min: f64,
    max: f64,
}

impl RateBounds {
    /// Bounds that allow every valid sample rate.
    pub const FULL: Self = Self { min: 0.0, max: 1.0 };

    /// Creates new bounds, validating that they describe a non-empty sub-range of `[0, 1]`.
    pub fn new(min: f64, max: f64) -> Result<Self, InvalidBounds> {
        // Written to also reject NaN.
        if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max {
            return Err(InvalidBounds { min, max });
        }

        Ok(Self { min, max })
    }

    /// The smallest rate any entity can be assigned.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// The largest rate any entity can be assigned.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Clamps a rate into the bounds. `NaN` maps to the lower bound.
    pub fn clamp(&self, rate: f64) -> f64 {
        if rate.is_nan() {
            self.min
        } else {
            rate.clamp(self.min, self.max)
        }
    }
}

impl Default for RateBounds {
    fn default() -> Self {
        Self::FULL
    }
}

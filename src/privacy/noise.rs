//! Laplace mechanism for differentially private numeric fields.
//!
//! For a field with L1 sensitivity `Δ` released under budget `ε`, noise is
//! drawn from Laplace(0, b) with `b = Δ / ε` by inverse transform:
//!
//! ```text
//! u     ~ Uniform(-0.5, 0.5)
//! noise = -b * sign(u) * ln(1 - 2|u|)
//! ```
//!
//! The noise has mean 0 and variance `2b²`.

use rand::Rng;

/// Invalid mechanism parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseError {
    /// Sensitivity must be finite and > 0
    Sensitivity(f64),
    /// Epsilon must be finite and > 0
    Epsilon(f64),
    /// Lower bound must be below upper bound
    Bounds(f64, f64),
}

impl std::fmt::Display for NoiseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoiseError::Sensitivity(v) => write!(f, "Invalid sensitivity: {v}"),
            NoiseError::Epsilon(v) => write!(f, "Invalid epsilon: {v}"),
            NoiseError::Bounds(lo, hi) => write!(f, "Invalid bounds: [{lo}, {hi}]"),
        }
    }
}

impl std::error::Error for NoiseError {}

/// Draw one sample of Laplace(0, `scale`) noise.
pub fn laplace_noise<R: Rng + ?Sized>(scale: f64, rng: &mut R) -> f64 {
    loop {
        let u: f64 = rng.gen_range(-0.5..0.5);
        let tail = 1.0 - 2.0 * u.abs();
        // u = -0.5 gives ln(0); redraw
        if tail > 0.0 {
            return -scale * u.signum() * tail.ln();
        }
    }
}

/// Laplace mechanism for one numeric quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaplaceMechanism {
    sensitivity: f64,
    epsilon: f64,
}

impl LaplaceMechanism {
    pub fn new(sensitivity: f64, epsilon: f64) -> Result<Self, NoiseError> {
        if !(sensitivity.is_finite() && sensitivity > 0.0) {
            return Err(NoiseError::Sensitivity(sensitivity));
        }
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(NoiseError::Epsilon(epsilon));
        }
        Ok(Self {
            sensitivity,
            epsilon,
        })
    }

    /// Noise scale `b = sensitivity / epsilon`.
    pub fn scale(&self) -> f64 {
        self.sensitivity / self.epsilon
    }

    /// Return `value` plus a fresh noise draw.
    pub fn randomize<R: Rng + ?Sized>(&self, value: f64, rng: &mut R) -> f64 {
        value + laplace_noise(self.scale(), rng)
    }
}

/// A bounded numeric field released through a Laplace mechanism.
///
/// The true value is clamped into `[lower, upper]` first, so the declared
/// sensitivity holds for any input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensitiveField {
    pub name: &'static str,
    lower: f64,
    upper: f64,
    mechanism: LaplaceMechanism,
}

impl SensitiveField {
    pub fn new(
        name: &'static str,
        (lower, upper): (f64, f64),
        mechanism: LaplaceMechanism,
    ) -> Result<Self, NoiseError> {
        if !(lower.is_finite() && upper.is_finite() && lower < upper) {
            return Err(NoiseError::Bounds(lower, upper));
        }
        Ok(Self {
            name,
            lower,
            upper,
            mechanism,
        })
    }

    pub fn mechanism(&self) -> &LaplaceMechanism {
        &self.mechanism
    }

    /// Clamp and noise a true value. Non-finite input is treated as the midpoint.
    pub fn privatize<R: Rng + ?Sized>(&self, value: f64, rng: &mut R) -> f64 {
        let value = if value.is_finite() {
            value.clamp(self.lower, self.upper)
        } else {
            (self.lower + self.upper) / 2.0
        };
        self.mechanism.randomize(value, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use statrs::statistics::Statistics;

    #[test]
    fn test_noise_mean_and_variance() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mechanism = LaplaceMechanism::new(1.0, 1.0).unwrap();
        let true_value = 0.4;

        let deltas: Vec<f64> = (0..100_000)
            .map(|_| mechanism.randomize(true_value, &mut rng) - true_value)
            .collect();

        let mean = deltas.iter().mean();
        let variance = deltas.iter().variance();
        assert!(mean.abs() < 0.03, "mean {mean}");
        assert!((variance - 2.0).abs() < 0.1, "variance {variance}");
    }

    #[test]
    fn test_scale_follows_epsilon() {
        let mechanism = LaplaceMechanism::new(2.0, 0.5).unwrap();
        assert_eq!(mechanism.scale(), 4.0);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert_eq!(
            LaplaceMechanism::new(0.0, 1.0),
            Err(NoiseError::Sensitivity(0.0))
        );
        assert_eq!(
            LaplaceMechanism::new(1.0, -1.0),
            Err(NoiseError::Epsilon(-1.0))
        );

        let mechanism = LaplaceMechanism::new(1.0, 1.0).unwrap();
        assert!(SensitiveField::new("impact", (1.0, -1.0), mechanism).is_err());
    }

    #[test]
    fn test_noise_is_finite() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10_000 {
            assert!(laplace_noise(1.0, &mut rng).is_finite());
        }
    }

    #[test]
    fn test_field_clamps_before_noise() {
        let mut rng = StdRng::seed_from_u64(9);
        // Tiny scale so the clamped value dominates
        let mechanism = LaplaceMechanism::new(1e-9, 1.0).unwrap();
        let field = SensitiveField::new("impact", (-1.0, 1.0), mechanism).unwrap();

        assert!((field.privatize(50.0, &mut rng) - 1.0).abs() < 1e-6);
        assert!((field.privatize(f64::NAN, &mut rng)).abs() < 1e-6);
    }
}

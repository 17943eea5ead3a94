//! Per-pixel spectral-basis fit/evaluate across channels.
//!
//! `Fit` absorbs the beam normalization into the least-squares weighting
//! (rather than the design matrix): each channel's effective weight is
//! `ChannelWeights[c] * JonesNorm[c]^2`, the standard way of accounting for
//! beam-sensitivity-dependent noise without dividing through by a
//! potentially-small gain. `Eval`/`EvalOn` then evaluate the fitted curve
//! directly against apparent flux — no re-multiplication step is needed
//! because the design matrix was never scaled by the beam in the first
//! place.

use crate::error::{Result, WscmsError};

/// Spectral basis used by the Frequency Machine. Polynomial-in-log-frequency
/// is the only implemented basis; anything else is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Basis {
    Polynomial,
}

impl Basis {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "polynomial" => Ok(Basis::Polynomial),
            other => Err(WscmsError::Configuration(format!(
                "unknown frequency basis {other:?}"
            ))),
        }
    }
}

/// Fits/evaluates a per-pixel spectral coefficient vector across channels.
pub struct FrequencyMachine {
    freqs: Vec<f64>,
    freq_ref: f64,
    k: usize,
    basis: Basis,
}

impl FrequencyMachine {
    /// `k` is clamped to 1 when there is only a single frequency band,
    /// matching the "K defaults to 1" numeric semantics in the design.
    pub fn new(freqs: Vec<f64>, freq_ref: f64, k: usize, basis: Basis) -> Self {
        let k = if freqs.len() <= 1 { 1 } else { k.max(1) };
        FrequencyMachine {
            freqs,
            freq_ref,
            k,
            basis,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn freq_ref(&self) -> f64 {
        self.freq_ref
    }

    fn basis_value(&self, freq: f64, order: usize) -> f64 {
        match self.basis {
            Basis::Polynomial => {
                if order == 0 {
                    1.0
                } else {
                    (freq / self.freq_ref).ln().powi(order as i32)
                }
            }
        }
    }

    /// Weighted least-squares fit of `samples` against the native frequency
    /// grid. Accumulates in `f64`, returns `f32` coefficients. Returns
    /// `FitFailure`-shaped error (via `WscmsError::Configuration`'s sibling,
    /// see caller policy) when the normal-equations matrix is singular.
    pub fn fit(&self, samples: &[f32], jones_norm: &[f32], weights: &[f32]) -> Result<Vec<f32>> {
        let c = self.freqs.len();
        assert_eq!(samples.len(), c);
        assert_eq!(jones_norm.len(), c);
        assert_eq!(weights.len(), c);

        let k = self.k;
        let mut m = vec![0.0_f64; k * k];
        let mut rhs = vec![0.0_f64; k];

        for ch in 0..c {
            let w_eff = weights[ch] as f64 * (jones_norm[ch] as f64).powi(2);
            if w_eff == 0.0 {
                continue;
            }
            let basis: Vec<f64> = (0..k).map(|o| self.basis_value(self.freqs[ch], o)).collect();
            for a in 0..k {
                rhs[a] += w_eff * basis[a] * samples[ch] as f64;
                for b in 0..k {
                    m[a * k + b] += w_eff * basis[a] * basis[b];
                }
            }
        }

        let coeffs = solve_linear_system(&mut m, &mut rhs, k).ok_or_else(|| {
            WscmsError::Configuration(
                "frequency fit failed: singular normal-equations matrix".to_string(),
            )
        })?;

        Ok(coeffs.into_iter().map(|v| v as f32).collect())
    }

    /// Evaluates the fit on the native frequency grid.
    pub fn eval(&self, coeffs: &[f32]) -> Vec<f32> {
        self.eval_on(coeffs, &self.freqs.clone())
    }

    /// Evaluates the fit on an arbitrary frequency grid (e.g. degrid frequencies).
    pub fn eval_on(&self, coeffs: &[f32], freqs: &[f64]) -> Vec<f32> {
        freqs
            .iter()
            .map(|&freq| {
                let mut acc = 0.0_f64;
                for (order, &coeff) in coeffs.iter().enumerate() {
                    acc += coeff as f64 * self.basis_value(freq, order);
                }
                acc as f32
            })
            .collect()
    }
}

/// Gaussian elimination with partial pivoting on a `k*k` row-major matrix.
/// Returns `None` if the matrix is numerically singular.
fn solve_linear_system(m: &mut [f64], rhs: &mut [f64], k: usize) -> Option<Vec<f64>> {
    const EPS: f64 = 1e-12;

    for col in 0..k {
        let mut pivot_row = col;
        let mut pivot_val = m[col * k + col].abs();
        for row in (col + 1)..k {
            let val = m[row * k + col].abs();
            if val > pivot_val {
                pivot_val = val;
                pivot_row = row;
            }
        }
        if pivot_val < EPS {
            return None;
        }
        if pivot_row != col {
            for c in 0..k {
                m.swap(col * k + c, pivot_row * k + c);
            }
            rhs.swap(col, pivot_row);
        }

        let pivot = m[col * k + col];
        for row in (col + 1)..k {
            let factor = m[row * k + col] / pivot;
            if factor == 0.0 {
                continue;
            }
            for c in col..k {
                m[row * k + c] -= factor * m[col * k + c];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = vec![0.0_f64; k];
    for row in (0..k).rev() {
        let mut sum = rhs[row];
        for c in (row + 1)..k {
            sum -= m[row * k + c] * x[c];
        }
        x[row] = sum / m[row * k + row];
    }
    Some(x)
}

use serde::Deserialize;

use crate::error::{Result, WscmsError};

/// Explicit scale list, or auto-derivation from the average beam FWHM.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
#[serde(untagged)]
pub enum ScaleSpec {
    Explicit(Vec<f64>),
    #[default]
    Auto,
}

/// CPU affinity policy for compute workers (`Parallel.Affinity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffinityPolicy {
    Contiguous,
    Stride2,
    InterleavedStride4,
}

/// Policy for when auto-masking engages, mirroring `WSCMS.AutoMask*`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub enum AutoMaskPolicy {
    Disabled,
    Threshold(f32),
    RmsFactor(f32),
}

/// Every recognized configuration option from the external interfaces section,
/// collected into one typed struct. Consumers (CLI / config parsing, out of
/// scope here) are responsible for populating this from whatever source
/// format they use; this crate only validates and consumes it.
#[derive(Debug, Clone, Deserialize)]
pub struct WscmsConfig {
    /// `Deconv.Gain` (γ): loop gain applied per sub-minor component.
    pub gain: f32,
    /// `Deconv.AllowNegative`: if true, peak search considers |value| instead
    /// of requiring a positive maximum.
    pub allow_negative: bool,
    /// `WSCMS.SubMinorPeakFact`: threshold ratio T = factor * |ConvMaxDirty|.
    pub sub_minor_peak_fact: f32,
    /// `WSCMS.NSubMinorIter`: hard cap on sub-minor loop iterations.
    pub n_sub_minor_iter: u32,
    /// `WSCMS.MultiScaleBias` (β): scale bias base, in (0, 1].
    pub multi_scale_bias: f32,
    /// `WSCMS.Scales`: explicit scale list or auto-derivation.
    #[serde(default)]
    pub scales: ScaleSpec,
    /// `WSCMS.MaxScale`: ceiling (in pixels) for auto-derived scales.
    pub max_scale: f64,
    /// `WSCMS.CacheSize`: max in-memory entries held by the LRU manager.
    pub cache_size: usize,
    /// `WSCMS.AutoMask*` collapsed into one policy.
    pub auto_mask: AutoMaskPolicy,
    /// `WSCMS.NumFreqBasisFuncs`: K, the spectral coefficient count.
    pub num_freq_basis_funcs: usize,
    /// `Freq.NBand`: number of frequency bands / channels.
    pub n_band: usize,
    /// `Facets.NFacets`: number of image facets.
    pub n_facets: usize,
    /// `Facets.Padding`: zero-padding factor applied before FFTs.
    pub facets_padding: f64,
    /// `Image.Cell`: pixel cell size in arcsec, used to convert FWHM to pixels.
    pub image_cell_arcsec: f64,
    /// `Parallel.NCPU`: total compute worker count for the async pool.
    pub n_cpu: usize,
    /// `Parallel.Affinity`: CPU pinning policy for compute workers.
    pub affinity: AffinityPolicy,
}

impl WscmsConfig {
    /// Validates configuration invariants that must hold before any
    /// iteration begins (spec §7, "Configuration error").
    pub fn validate(&self) -> Result<()> {
        if self.multi_scale_bias <= 0.0 || self.multi_scale_bias > 1.0 {
            return Err(WscmsError::Configuration(format!(
                "WSCMS.MultiScaleBias must be in (0, 1], got {}",
                self.multi_scale_bias
            )));
        }
        if let ScaleSpec::Explicit(scales) = &self.scales {
            if scales.is_empty() {
                return Err(WscmsError::Configuration(
                    "WSCMS.Scales explicit list must not be empty".into(),
                ));
            }
            if scales[0] != 0.0 {
                return Err(WscmsError::Configuration(
                    "WSCMS.Scales[0] must be the delta scale (0.0)".into(),
                ));
            }
            if scales.windows(2).any(|w| w[1] <= w[0]) {
                return Err(WscmsError::Configuration(
                    "WSCMS.Scales must be strictly increasing".into(),
                ));
            }
        }
        if self.n_band == 0 {
            return Err(WscmsError::Configuration(
                "Freq.NBand must be >= 1".into(),
            ));
        }
        if self.num_freq_basis_funcs == 0 {
            return Err(WscmsError::Configuration(
                "WSCMS.NumFreqBasisFuncs must be >= 1".into(),
            ));
        }
        if self.cache_size == 0 {
            return Err(WscmsError::Configuration(
                "WSCMS.CacheSize must be >= 1".into(),
            ));
        }
        if self.n_cpu == 0 {
            return Err(WscmsError::Configuration(
                "Parallel.NCPU must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective K, defaulting to 1 when only one frequency band exists.
    pub fn effective_basis_funcs(&self) -> usize {
        if self.n_band <= 1 {
            1
        } else {
            self.num_freq_basis_funcs.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> WscmsConfig {
        WscmsConfig {
            gain: 0.1,
            allow_negative: false,
            sub_minor_peak_fact: 0.75,
            n_sub_minor_iter: 100,
            multi_scale_bias: 0.6,
            scales: ScaleSpec::Auto,
            max_scale: 64.0,
            cache_size: 16,
            auto_mask: AutoMaskPolicy::Disabled,
            num_freq_basis_funcs: 2,
            n_band: 4,
            n_facets: 1,
            facets_padding: 1.5,
            image_cell_arcsec: 1.0,
            n_cpu: 4,
            affinity: AffinityPolicy::Contiguous,
        }
    }

    #[test]
    fn rejects_bias_out_of_range() {
        let mut cfg = base_config();
        cfg.multi_scale_bias = 0.0;
        assert!(cfg.validate().is_err());
        cfg.multi_scale_bias = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_scale_list_not_starting_at_zero() {
        let mut cfg = base_config();
        cfg.scales = ScaleSpec::Explicit(vec![1.0, 2.0]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_increasing_scale_list() {
        let mut cfg = base_config();
        cfg.scales = ScaleSpec::Explicit(vec![0.0, 2.0, 2.0]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn single_band_collapses_basis_funcs_to_one() {
        let mut cfg = base_config();
        cfg.n_band = 1;
        cfg.num_freq_basis_funcs = 3;
        assert_eq!(cfg.effective_basis_funcs(), 1);
    }
}

//! Scale set/bias definition, analytic Gaussian kernels in Fourier space,
//! per-facet per-scale convolved PSF caching, and scale-biased peak search.

use ndarray::{s, Array2, Array3};
use rustfft::num_complex::Complex;
use std::collections::HashMap;
use std::f64::consts::PI;

use crate::cache::{ArrayBlob, CacheValue, LruCacheManager};
use crate::error::{Result, WscmsError};
use crate::fft::{fftshift, pad_to, FftBatch, FftManager};

/// σ_1 = FWHM_avg / (2 * sqrt(2 * ln2 * 2)); doubled until MaxScale/1.5 is
/// exceeded. The alternative empirical seed (σ_1 = 3.5 * FWHM_avg) named in
/// the design as a fallback auto-seeding heuristic is not used by default —
/// see DESIGN.md.
pub fn derive_scale_set(fwhm_avg_pixels: f64, max_scale_pixels: f64) -> Vec<f64> {
    let mut scales = vec![0.0];
    if fwhm_avg_pixels <= 0.0 {
        return scales;
    }
    let sigma1 = fwhm_avg_pixels / (2.0 * (2.0 * (2.0_f64).ln() * 2.0).sqrt());
    let mut sigma = sigma1;
    let ceiling = max_scale_pixels / 1.5;
    while sigma <= ceiling {
        scales.push(sigma);
        sigma *= 2.0;
    }
    scales
}

/// b[0] = 1; b[i] = β^(−1 − log2(σ_i / σ_1)) for i >= 1. Uses the σ ratio
/// directly since FWHM_i/FWHM_1 = σ_i/σ_1 (the sigma-to-FWHM constant cancels).
pub fn scale_bias(scales: &[f64], beta: f32) -> Vec<f32> {
    if scales.is_empty() {
        return Vec::new();
    }
    let sigma1 = scales.get(1).copied().unwrap_or(1.0).max(1e-12);
    let beta = beta as f64;
    scales
        .iter()
        .enumerate()
        .map(|(i, &sigma)| {
            if i == 0 {
                1.0
            } else {
                beta.powf(-1.0 - (sigma / sigma1).log2())
            }
        })
        .map(|v| v as f32)
        .collect()
}

fn freq_index(bin: usize, n: usize) -> i64 {
    if bin <= n / 2 {
        bin as i64
    } else {
        bin as i64 - n as i64
    }
}

/// Analytic Fourier-domain Gaussian kernel K_σ on a half-spectrum grid of
/// shape (ny, nx_half): `exp(-2π²ρ²σ²)`, optionally phase-shifted by (x0, y0).
pub fn gaussian_kernel_ft(
    sigma: f64,
    ny: usize,
    nx: usize,
    nx_half: usize,
    shift: Option<(f64, f64)>,
) -> Array2<Complex<f32>> {
    let mut out = Array2::from_elem((ny, nx_half), Complex::new(0.0_f32, 0.0));
    for row in 0..ny {
        let fy = freq_index(row, ny) as f64 / ny as f64;
        for col in 0..nx_half {
            let fx = col as f64 / nx as f64;
            let rho2 = fx * fx + fy * fy;
            let mag = (-2.0 * PI * PI * rho2 * sigma * sigma).exp();
            let val = if let Some((x0, y0)) = shift {
                let angle = -2.0 * PI * (fx * y0 + fy * x0);
                Complex::new(mag * angle.cos(), mag * angle.sin())
            } else {
                Complex::new(mag, 0.0)
            };
            out[[row, col]] = Complex::new(val.re as f32, val.im as f32);
        }
    }
    out
}

fn cache_key(scale: usize, facet: usize) -> String {
    format!("S{scale}F{facet}")
}

/// The two persisted arrays for one (facet, scale) convolved-PSF cache entry.
#[derive(Debug, Clone)]
pub struct ConvolvedPsf {
    /// Once-convolved full per-channel PSF, shape (C, Y_p, X_p).
    pub conv_psf: Array3<f32>,
    /// Twice-convolved mean PSF (already divided by N_conv), shape (Y_p, X_p).
    pub conv2_psf_mean: Array2<f32>,
}

impl From<&ConvolvedPsf> for CacheValue {
    fn from(v: &ConvolvedPsf) -> Self {
        CacheValue {
            arrays: vec![
                ArrayBlob::from_array(&v.conv_psf.view()),
                ArrayBlob::from_array(&v.conv2_psf_mean.view()),
            ],
        }
    }
}

impl TryFrom<CacheValue> for ConvolvedPsf {
    type Error = WscmsError;

    fn try_from(v: CacheValue) -> Result<Self> {
        if v.arrays.len() != 2 {
            return Err(WscmsError::Configuration(
                "convolved-PSF cache entry must hold exactly two arrays".into(),
            ));
        }
        let conv_psf = to_array3(&v.arrays[0])?;
        let conv2_psf_mean = to_array2(&v.arrays[1])?;
        Ok(ConvolvedPsf {
            conv_psf,
            conv2_psf_mean,
        })
    }
}

fn to_array3(blob: &ArrayBlob) -> Result<Array3<f32>> {
    if blob.shape.len() != 3 {
        return Err(WscmsError::Configuration("expected a 3D array blob".into()));
    }
    Array3::from_shape_vec((blob.shape[0], blob.shape[1], blob.shape[2]), blob.data.clone())
        .map_err(|e| WscmsError::Configuration(e.to_string()))
}

fn to_array2(blob: &ArrayBlob) -> Result<Array2<f32>> {
    if blob.shape.len() != 2 {
        return Err(WscmsError::Configuration("expected a 2D array blob".into()));
    }
    Array2::from_shape_vec((blob.shape[0], blob.shape[1]), blob.data.clone())
        .map_err(|e| WscmsError::Configuration(e.to_string()))
}

/// In-memory-only gain metadata for a (facet, scale) pair. Not persisted:
/// cheap to recompute, and the disk cache contract only covers the two
/// convolved-PSF arrays (spec §4.2).
#[derive(Debug, Clone, Copy)]
pub struct ScaleGain {
    pub gain: f32,
    pub conv_psf_mean_center: f32,
    pub channel_peak_ratio_mean: f32,
}

struct FacetFt {
    ft_psf: Array3<Complex<f32>>,
    ft_mean_psf: Array2<Complex<f32>>,
}

/// Scale set definition, kernel construction, convolved-PSF caching, and
/// scale-biased peak search. Holds a non-owning borrow of nothing — PSF
/// Server access goes through a `&mut dyn PsfServer` parameter on each call,
/// per the cyclic-reference design note.
pub struct ScaleMachine {
    pub scales: Vec<f64>,
    pub bias: Vec<f32>,
    gain_user: f32,
    image_shape: (usize, usize),
    psf_shape: (usize, usize),
    fft: FftManager,
    ft_cache: HashMap<usize, FacetFt>,
    conv_cache: LruCacheManager,
    gain_cache: HashMap<String, ScaleGain>,
    scale0_psf_max: Option<f32>,
    n_conv: Option<f32>,
}

impl ScaleMachine {
    pub fn new(
        scales: Vec<f64>,
        bias: Vec<f32>,
        gain_user: f32,
        image_shape: (usize, usize),
        psf_shape: (usize, usize),
        fft_threads: usize,
        cache_dir: impl AsRef<std::path::Path>,
        cache_size: usize,
    ) -> Result<Self> {
        Ok(ScaleMachine {
            scales,
            bias,
            gain_user,
            image_shape,
            psf_shape,
            fft: FftManager::new(image_shape, psf_shape, fft_threads),
            ft_cache: HashMap::new(),
            conv_cache: LruCacheManager::new(cache_dir, cache_size)?,
            gain_cache: HashMap::new(),
            scale0_psf_max: None,
            n_conv: None,
        })
    }

    fn ensure_facet_ft(&mut self, facet: usize, psf: &crate::psf::FacetPsf) {
        if self.ft_cache.contains_key(&facet) {
            return;
        }
        let (ny, nx) = self.psf_shape;
        let n_chan = psf.psf_cube.shape()[0];

        let mut batch = self.fft.psf_plan.new_batch(n_chan);
        for c in 0..n_chan {
            let padded = pad_to(&psf.psf_cube.slice(s![c, .., ..]), ny, nx);
            batch.real.slice_mut(s![c, .., ..]).assign(&padded);
        }
        self.fft.psf_plan.forward(&mut batch);
        let ft_psf = batch.spectrum;

        let mut mean_batch = self.fft.psf_plan.new_batch(1);
        let padded_mean = pad_to(&psf.mean_psf.view(), ny, nx);
        mean_batch.real.slice_mut(s![0, .., ..]).assign(&padded_mean);
        self.fft.psf_plan.forward(&mut mean_batch);
        let ft_mean_psf = mean_batch.spectrum.slice(s![0, .., ..]).to_owned();

        self.ft_cache.insert(facet, FacetFt { ft_psf, ft_mean_psf });
    }

    /// Computes and caches, for (facet, scale): the once-convolved full PSF,
    /// the (N_conv-normalized) twice-convolved mean PSF, and the gain. On
    /// the central facet at scale 0, also records `Scale0PSFmax`/`N_conv`.
    pub fn give_gain(
        &mut self,
        facet: usize,
        scale: usize,
        is_central_facet: bool,
        psf: &crate::psf::FacetPsf,
    ) -> Result<(ConvolvedPsf, ScaleGain)> {
        let key = cache_key(scale, facet);
        if self.conv_cache.contains(&key) && self.gain_cache.contains_key(&key) {
            let cached = ConvolvedPsf::try_from(self.conv_cache.get(&key)?)?;
            let gain = self.gain_cache[&key];
            return Ok((cached, gain));
        }

        self.ensure_facet_ft(facet, psf);
        let (ny, nx) = self.psf_shape;
        let nx_half = nx / 2 + 1;
        let sigma = self.scales[scale];

        let k1 = gaussian_kernel_ft(sigma, ny, nx, nx_half, None);
        let k2 = &k1 * &k1;

        let ft = self.ft_cache.get(&facet).expect("facet FT must be populated");

        // ConvPSFmean = iFFT(FT(Pbar) * K_sigma), evaluated at center.
        let conv_psf_mean = inverse_single(&self.fft, &ft.ft_mean_psf, &k1, ny, nx);
        let center = (ny / 2, nx / 2);
        let conv_psf_mean_center = conv_psf_mean[center];

        if is_central_facet && scale == 0 {
            self.scale0_psf_max = Some(conv_psf_mean_center);
            let twice = inverse_single(&self.fft, &ft.ft_mean_psf, &k2, ny, nx);
            self.n_conv = Some(twice[center]);
        }
        let n_conv = self.n_conv.unwrap_or(1.0).max(f32::EPSILON);
        let scale0_psf_max = self.scale0_psf_max.unwrap_or(conv_psf_mean_center);

        // ConvPSF: once-convolved full per-channel PSF (subtracted from the dirty cube).
        let n_chan = ft.ft_psf.shape()[0];
        let mut conv_psf = Array3::zeros((n_chan, ny, nx));
        let mut channel_peaks = Vec::with_capacity(n_chan);
        for c in 0..n_chan {
            let spec = ft.ft_psf.slice(s![c, .., ..]).to_owned();
            let plane = inverse_single(&self.fft, &spec, &k1, ny, nx);
            channel_peaks.push(plane[center]);
            conv_psf.slice_mut(s![c, .., ..]).assign(&plane);
        }
        let channel_peak_mean = channel_peaks.iter().sum::<f32>() / channel_peaks.len().max(1) as f32;
        let channel_peak_ratio_mean = if channel_peak_mean.abs() > f32::EPSILON {
            channel_peaks.iter().map(|p| p / channel_peak_mean).sum::<f32>() / channel_peaks.len().max(1) as f32
        } else {
            1.0
        };

        // Conv2PSFmean: twice-convolved MEAN PSF, normalized by N_conv. (Using
        // the mean PSF here, not the per-channel cube, keeps this
        // self-consistent with N_conv's own definition and with the
        // central-facet/scale-0 identity `Conv2PSF(center) == N_conv`.)
        let conv2_raw = inverse_single(&self.fft, &ft.ft_mean_psf, &k2, ny, nx);
        let conv2_psf_mean = conv2_raw.mapv(|v| v / n_conv);

        let gain = self.gain_user * scale0_psf_max / conv_psf_mean_center.max(f32::EPSILON);

        let entry = ConvolvedPsf {
            conv_psf,
            conv2_psf_mean,
        };
        let gain_info = ScaleGain {
            gain,
            conv_psf_mean_center,
            channel_peak_ratio_mean,
        };

        self.conv_cache.put(&key, CacheValue::from(&entry))?;
        self.gain_cache.insert(key, gain_info);

        Ok((entry, gain_info))
    }

    /// Zero-pads `mean_dirty`, batch-convolves with every scale kernel, and
    /// returns the scale-biased argmax: `(x, y, peak, current_dirty, scale)`.
    /// Ties in the biased score break toward the lowest scale index.
    pub fn do_scale_convolve(
        &self,
        mean_dirty: &Array2<f32>,
        mask: Option<&Array2<bool>>,
        allow_negative: bool,
    ) -> (usize, usize, f32, Array2<f32>, usize) {
        let (ny, nx) = self.image_shape;
        let (orig_ny, orig_nx) = mean_dirty.dim();
        let n_scales = self.scales.len();

        let mut batch = self.fft.scale_plan.new_batch(n_scales);
        let padded = pad_to(&mean_dirty.view(), ny, nx);
        for s in 0..n_scales {
            batch.real.slice_mut(s![s, .., ..]).assign(&padded);
        }
        self.fft.scale_plan.forward(&mut batch);

        let nx_half = ny_half_guard(nx);
        let mut best_scale = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        let mut best_plane = Array2::<f32>::zeros((orig_ny, orig_nx));
        let mut best_loc = (0usize, 0usize);
        let mut best_peak = 0.0_f32;

        for (s, &sigma) in self.scales.iter().enumerate() {
            let kernel = gaussian_kernel_ft(sigma, ny, nx, nx_half, None);
            let mut one = FftBatch::zeros(1, ny, nx);
            for row in 0..ny {
                for col in 0..nx_half {
                    one.spectrum[[0, row, col]] = batch.spectrum[[s, row, col]] * kernel[[row, col]];
                }
            }
            self.fft.scale_plan.inverse(&mut one);
            let cropped = one.real.slice(s![0, 0..orig_ny, 0..orig_nx]).to_owned();

            let (loc, peak) = argmax_abs(&cropped, mask, allow_negative);
            let score = self.bias[s] * peak.abs();
            if score > best_score {
                best_score = score;
                best_scale = s;
                best_plane = cropped;
                best_loc = loc;
                best_peak = peak;
            }
        }

        (best_loc.1, best_loc.0, best_peak, best_plane, best_scale)
    }

    /// Real-space convolution stamp for `scale`: inverse-FFT of its analytic
    /// Gaussian kernel, re-centered so the peak sits at the image center.
    /// Used to place non-zero-scale model components back into a
    /// reconstructed model image.
    pub fn spatial_kernel(&self, scale: usize) -> Array2<f32> {
        let (ny, nx) = self.image_shape;
        let nx_half = ny_half_guard(nx);
        let sigma = self.scales[scale];
        let kernel_ft = gaussian_kernel_ft(sigma, ny, nx, nx_half, None);
        let mut batch = FftBatch::zeros(1, ny, nx);
        batch.spectrum.slice_mut(s![0, .., ..]).assign(&kernel_ft);
        self.fft.image_plan.inverse(&mut batch);
        fftshift(&batch.real.slice(s![0, .., ..]).to_owned())
    }
}

fn ny_half_guard(nx: usize) -> usize {
    nx / 2 + 1
}

/// Pointwise-multiplies a single spectrum by a kernel and inverse-transforms,
/// returning the real plane (batch size 1, reused for scalar "evaluate at
/// center" computations in `give_gain`).
fn inverse_single(
    fft: &FftManager,
    spectrum: &Array2<Complex<f32>>,
    kernel: &Array2<Complex<f32>>,
    ny: usize,
    nx: usize,
) -> Array2<f32> {
    let mut batch = FftBatch::zeros(1, ny, nx);
    batch.spectrum.slice_mut(s![0, .., ..]).assign(&(spectrum * kernel));
    fft.psf_plan.inverse(&mut batch);
    batch.real.slice(s![0, .., ..]).to_owned()
}

/// Location and signed value of the maximum-scoring pixel not excluded by
/// `mask` (mask bit true = excluded). When `allow_negative` is false, only
/// positive values are eligible (a strict-max search rather than absolute-max,
/// per `Deconv.AllowNegative`). Ties break to lowest row, then column.
fn argmax_abs(
    plane: &Array2<f32>,
    mask: Option<&Array2<bool>>,
    allow_negative: bool,
) -> ((usize, usize), f32) {
    let mut best = (0usize, 0usize);
    let mut best_val = f32::NEG_INFINITY;
    let mut best_score = f32::NEG_INFINITY;
    for ((row, col), &v) in plane.indexed_iter() {
        if let Some(m) = mask {
            if m[[row, col]] {
                continue;
            }
        }
        if !allow_negative && v < 0.0 {
            continue;
        }
        let score = if allow_negative { v.abs() } else { v };
        if score > best_score {
            best_score = score;
            best_val = v;
            best = (row, col);
        }
    }
    (best, best_val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::odd_padded_size;

    #[test]
    fn scale_bias_matches_formula() {
        let scales = vec![0.0, 2.0, 4.0, 8.0];
        let beta = 0.6_f32;
        let bias = scale_bias(&scales, beta);
        assert_eq!(bias[0], 1.0);
        for i in 1..scales.len() {
            let expected = (beta as f64).powf(-1.0 - (scales[i] / scales[1]).log2());
            assert!((bias[i] as f64 - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn derive_scale_set_starts_at_zero_and_doubles() {
        let scales = derive_scale_set(8.0, 64.0);
        assert_eq!(scales[0], 0.0);
        for i in 2..scales.len() {
            assert!((scales[i] / scales[i - 1] - 2.0).abs() < 1e-9);
        }
        assert!(scales.len() > 1);
    }

    #[test]
    fn kernel_peak_at_zero_frequency_is_one() {
        let k = gaussian_kernel_ft(3.0, 16, 16, 9, None);
        assert!((k[[0, 0]].re - 1.0).abs() < 1e-6);
        assert!(k[[0, 0]].im.abs() < 1e-6);
    }

    #[test]
    fn larger_sigma_decays_faster_away_from_dc() {
        let k_small = gaussian_kernel_ft(1.0, 16, 16, 9, None);
        let k_large = gaussian_kernel_ft(4.0, 16, 16, 9, None);
        assert!(k_large[[0, 2]].re < k_small[[0, 2]].re);
    }

    #[test]
    fn argmax_abs_breaks_ties_by_lowest_row_then_column() {
        let mut plane = Array2::zeros((3, 3));
        plane[[2, 0]] = 1.0;
        plane[[0, 2]] = -1.0;
        plane[[1, 1]] = 1.0;
        let (loc, _) = argmax_abs(&plane, None, true);
        assert_eq!(loc, (0, 2));
    }

    fn unit_impulse_psf(n: usize) -> crate::psf::FacetPsf {
        let mut mean_psf = Array2::zeros((n, n));
        mean_psf[[n / 2, n / 2]] = 1.0;
        let mut psf_cube = Array3::zeros((1, n, n));
        psf_cube[[0, n / 2, n / 2]] = 1.0;
        crate::psf::FacetPsf { psf_cube, mean_psf }
    }

    #[test]
    fn central_facet_scale0_conv2psf_center_equals_n_conv_and_normalizes_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let n = odd_padded_size(9, 1.0);
        let mut sm = ScaleMachine::new(
            vec![0.0, 2.0],
            vec![1.0, 0.8],
            1.0,
            (n, n),
            (n, n),
            1,
            dir.path(),
            8,
        )
        .unwrap();
        let psf = unit_impulse_psf(n);

        let (entry, _gain) = sm.give_gain(0, 0, true, &psf).unwrap();
        let center = (n / 2, n / 2);
        let n_conv = sm.n_conv.unwrap();
        assert!((entry.conv2_psf_mean[center] - 1.0).abs() < 1e-3);
        assert!(n_conv.abs() > 0.0);
    }

    #[test]
    fn do_scale_convolve_locates_delta_spike_at_scale_zero() {
        let dir = tempfile::tempdir().unwrap();
        let n = odd_padded_size(17, 1.0);
        let bias = scale_bias(&[0.0, 2.0, 4.0], 0.6);
        let sm = ScaleMachine::new(vec![0.0, 2.0, 4.0], bias, 1.0, (n, n), (n, n), 1, dir.path(), 8)
            .unwrap();

        let mut mean_dirty = Array2::<f32>::zeros((n, n));
        mean_dirty[[8, 8]] = 1.0;

        let (x, y, peak, _current, scale) = sm.do_scale_convolve(&mean_dirty, None, true);
        assert_eq!((x, y), (8, 8));
        assert_eq!(scale, 0);
        assert!((peak - 1.0).abs() < 1e-3);
    }
}

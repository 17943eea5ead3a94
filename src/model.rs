//! Minor-cycle driver: scale selection, sub-minor peak/fit/subtract loop,
//! model-component accumulation, auto-masking.

use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use crate::beam::BeamJonesProvider;
use crate::config::AutoMaskPolicy;
use crate::error::{Result, WscmsError};
use crate::freq::FrequencyMachine;
use crate::psf::PsfServer;
use crate::scale::ScaleMachine;

/// Mapping from scale index to a mapping from pixel to accumulated spectral
/// coefficient vector. Only ever holds non-zero entries; subtracting a
/// component at an existing (scale, pixel) accumulates into it rather than
/// appending a duplicate.
#[derive(Debug, Default, Clone)]
pub struct ModelDictionary {
    entries: HashMap<usize, HashMap<(usize, usize), Vec<f32>>>,
}

impl ModelDictionary {
    pub fn accumulate(&mut self, scale: usize, x: usize, y: usize, coeffs: &[f32]) {
        let pixel_map = self.entries.entry(scale).or_default();
        match pixel_map.get_mut(&(x, y)) {
            Some(existing) => {
                for (acc, &c) in existing.iter_mut().zip(coeffs) {
                    *acc += c;
                }
            }
            None => {
                pixel_map.insert((x, y), coeffs.to_vec());
            }
        }
    }

    pub fn num_components(&self, scale: usize) -> usize {
        self.entries.get(&scale).map(|m| m.len()).unwrap_or(0)
    }

    pub fn get(&self, scale: usize, x: usize, y: usize) -> Option<&[f32]> {
        self.entries
            .get(&scale)
            .and_then(|m| m.get(&(x, y)))
            .map(|v| v.as_slice())
    }

    pub fn scales(&self) -> impl Iterator<Item = &usize> {
        self.entries.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|m| m.is_empty())
    }

    /// Every (pixel, coefficients) component accumulated at `scale`.
    pub fn entries(&self, scale: usize) -> impl Iterator<Item = (&(usize, usize), &Vec<f32>)> {
        self.entries.get(&scale).into_iter().flat_map(|m| m.iter())
    }
}

/// `Scale_Info`/`Comp` on-disk schema, one entry per persisted field.
#[derive(Debug, Serialize, Deserialize)]
struct ScaleInfoEntry {
    sigma: f64,
}

/// Stable, language-agnostic model-file schema: `{Type, RefFreq, ModelShape,
/// Scale_Info, Comp}`. `Comp` pixel keys are serialized as `"x,y"` strings
/// since JSON object keys must be strings; `Scale_Info` only records `sigma`
/// (the spatial kernel itself is rebuilt from it on load, not persisted).
#[derive(Debug, Serialize, Deserialize)]
struct PersistedModel {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "RefFreq")]
    ref_freq: f64,
    #[serde(rename = "ModelShape")]
    model_shape: (usize, usize),
    #[serde(rename = "Scale_Info")]
    scale_info: HashMap<usize, ScaleInfoEntry>,
    #[serde(rename = "Comp")]
    comp: HashMap<usize, HashMap<String, Vec<f32>>>,
}

fn parse_pixel_key(key: &str) -> Option<(usize, usize)> {
    let (x, y) = key.split_once(',')?;
    Some((x.parse().ok()?, y.parse().ok()?))
}

/// Parallel-array "arena + index" representation of the active working set:
/// instead of a sparse mask, `rows`/`cols`/`values` track the surviving
/// above-threshold pixels directly.
struct ActiveSet {
    rows: Vec<usize>,
    cols: Vec<usize>,
    values: Vec<f32>,
}

impl ActiveSet {
    fn build(plane: &Array2<f32>, threshold: f32, exclude: Option<&Array2<bool>>) -> Self {
        let mut rows = Vec::new();
        let mut cols = Vec::new();
        let mut values = Vec::new();
        for ((row, col), &v) in plane.indexed_iter() {
            if v.abs() <= threshold {
                continue;
            }
            if let Some(mask) = exclude {
                if mask[[row, col]] {
                    continue;
                }
            }
            rows.push(row);
            cols.push(col);
            values.push(v);
        }
        ActiveSet { rows, cols, values }
    }

    /// Index of the max-|value| entry; ties break to lowest row, then column.
    fn argmax(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for i in 0..self.values.len() {
            match best {
                None => best = Some(i),
                Some(b) => {
                    let a_abs = self.values[i].abs();
                    let b_abs = self.values[b].abs();
                    if a_abs > b_abs
                        || (a_abs == b_abs
                            && (self.rows[i], self.cols[i]) < (self.rows[b], self.cols[b]))
                    {
                        best = Some(i);
                    }
                }
            }
        }
        best
    }

    fn swap_remove(&mut self, idx: usize) {
        self.rows.swap_remove(idx);
        self.cols.swap_remove(idx);
        self.values.swap_remove(idx);
    }
}

/// Subtracts `conv_psf[c] * f_hat[c] * gain` from `dirty_cube[c]`, centered at
/// (x, y), clipping the window on both source and destination at the image
/// boundary (equivalent to full-support subtraction with zero outside).
fn subtract_psf_from_cube(
    dirty_cube: &mut Array3<f32>,
    conv_psf: &Array3<f32>,
    x: usize,
    y: usize,
    f_hat: &[f32],
    gain: f32,
) {
    let (n_chan, img_y, img_x) = dirty_cube.dim();
    let (_, psf_y, psf_x) = conv_psf.dim();
    let cy = (psf_y / 2) as isize;
    let cx = (psf_x / 2) as isize;

    for c in 0..n_chan {
        let amount = f_hat[c] * gain;
        if amount == 0.0 {
            continue;
        }
        for py in 0..psf_y {
            let ty = y as isize + (py as isize - cy);
            if ty < 0 || ty as usize >= img_y {
                continue;
            }
            for px in 0..psf_x {
                let tx = x as isize + (px as isize - cx);
                if tx < 0 || tx as usize >= img_x {
                    continue;
                }
                dirty_cube[[c, ty as usize, tx as usize]] -= conv_psf[[c, py, px]] * amount;
            }
        }
    }
}

/// Subtracts `conv2_psf_mean * amount` from the active set wherever the
/// twice-convolved PSF's support overlaps a surviving active index, aligned
/// so the PSF center lands on (x, y).
fn subtract_psf_from_active_set(
    active: &mut ActiveSet,
    conv2_psf_mean: &Array2<f32>,
    x: usize,
    y: usize,
    amount: f32,
) {
    if amount == 0.0 {
        return;
    }
    let (psf_y, psf_x) = conv2_psf_mean.dim();
    let cy = (psf_y / 2) as isize;
    let cx = (psf_x / 2) as isize;

    for i in 0..active.values.len() {
        let dy = active.rows[i] as isize - y as isize;
        let dx = active.cols[i] as isize - x as isize;
        let py = cy + dy;
        let px = cx + dx;
        if py < 0 || px < 0 || py as usize >= psf_y || px as usize >= psf_x {
            continue;
        }
        active.values[i] -= conv2_psf_mean[[py as usize, px as usize]] * amount;
    }
}

/// Minor-cycle driver. Holds owning references to its PSF Server and Scale
/// Machine (breaking the cyclic reference the Scale Machine would otherwise
/// have back to the PSF Server, per the design note), and a beam collaborator
/// narrowed to the single `jones_norm` reduction this core consumes.
pub struct ModelMachine<P: PsfServer, B: BeamJonesProvider> {
    pub scale_machine: ScaleMachine,
    pub freq_machine: FrequencyMachine,
    pub psf_server: P,
    pub beam: B,
    pub model: ModelDictionary,

    sub_minor_peak_fact: f32,
    n_sub_minor_iter: u32,
    allow_negative: bool,
    auto_mask: AutoMaskPolicy,

    mask_engaged: bool,
    per_scale_found: HashMap<usize, Array2<bool>>,
    working_exclusion_mask: Option<Array2<bool>>,
    image_shape: (usize, usize),
}

impl<P: PsfServer, B: BeamJonesProvider> ModelMachine<P, B> {
    pub fn new(
        scale_machine: ScaleMachine,
        freq_machine: FrequencyMachine,
        psf_server: P,
        beam: B,
        sub_minor_peak_fact: f32,
        n_sub_minor_iter: u32,
        allow_negative: bool,
        auto_mask: AutoMaskPolicy,
        image_shape: (usize, usize),
    ) -> Self {
        ModelMachine {
            scale_machine,
            freq_machine,
            psf_server,
            beam,
            model: ModelDictionary::default(),
            sub_minor_peak_fact,
            n_sub_minor_iter,
            allow_negative,
            auto_mask,
            mask_engaged: false,
            per_scale_found: HashMap::new(),
            working_exclusion_mask: None,
            image_shape,
        }
    }

    fn should_engage_mask(&self, max_dirty: f32, rms: f32) -> bool {
        match self.auto_mask {
            AutoMaskPolicy::Disabled => false,
            AutoMaskPolicy::Threshold(t) => max_dirty.abs() <= t,
            AutoMaskPolicy::RmsFactor(f) => max_dirty.abs() <= f * rms,
        }
    }

    /// Engages auto-masking for this call if it hasn't already engaged and
    /// the policy's condition holds, freezing the exclusion mask from the
    /// OR-unified per-scale found masks (De Morgan-equivalent to the
    /// "intersection of all per-scale masks" phrasing: AND of per-scale
    /// *exclusion* masks == NOT(OR of per-scale *found* masks)).
    fn maybe_engage_mask(&mut self, max_dirty: f32, rms: f32) {
        if self.mask_engaged {
            return;
        }
        if !self.should_engage_mask(max_dirty, rms) {
            return;
        }
        self.mask_engaged = true;
        let mut unified = Array2::from_elem(self.image_shape, false);
        for found in self.per_scale_found.values() {
            for ((r, c), &v) in found.indexed_iter() {
                if v {
                    unified[[r, c]] = true;
                }
            }
        }
        self.working_exclusion_mask = Some(unified.mapv(|found| !found));
    }

    /// Runs one invocation of the sub-minor loop. Returns the number of
    /// accepted components and the winning scale.
    pub fn do_minor_loop(
        &mut self,
        dirty_cube: &mut Array3<f32>,
        mean_dirty: &Array2<f32>,
        channel_weights: &[f32],
        max_dirty: f32,
        rms: f32,
    ) -> Result<(u32, usize)> {
        if self.n_sub_minor_iter == 0 {
            return Ok((0, 0));
        }

        self.maybe_engage_mask(max_dirty, rms);

        let (x0, y0, peak0, current_dirty, scale) = self.scale_machine.do_scale_convolve(
            mean_dirty,
            self.working_exclusion_mask.as_ref(),
            self.allow_negative,
        );

        let facet = self.psf_server.set_location(x0, y0);
        let is_central = facet == 0;
        let psf = self.psf_server.give_psf();
        let (conv_psf_entry, gain_info) =
            self.scale_machine.give_gain(facet, scale, is_central, &psf)?;

        let threshold = self.sub_minor_peak_fact * peak0.abs();

        let mut active = ActiveSet::build(
            &current_dirty,
            threshold,
            self.working_exclusion_mask.as_ref(),
        );

        let n_chan = dirty_cube.shape()[0];
        let mut k = 0u32;

        #[allow(clippy::while_let_loop)]
        loop {
            let Some(idx) = active.argmax() else {
                break;
            };
            if active.values[idx].abs() <= threshold {
                break;
            }
            if k >= self.n_sub_minor_iter {
                log::warn!("sub-minor loop hit NSubMinorIter cap without converging");
                break;
            }

            let x = active.cols[idx];
            let y = active.rows[idx];

            let f_pol: Vec<f32> = (0..n_chan).map(|c| dirty_cube[[c, y, x]]).collect();
            let jones_norm: Vec<f32> = (0..n_chan).map(|c| self.beam.jones_norm(c, y, x)).collect();

            let fit_result = self.freq_machine.fit(&f_pol, &jones_norm, channel_weights);
            let coeffs = match fit_result {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("frequency fit failed at ({x},{y}), treating component as zero: {e}");
                    active.swap_remove(idx);
                    continue;
                }
            };

            let f_hat_pol = self.freq_machine.eval(&coeffs);
            let gain = if f_hat_pol.iter().any(|&v| v < 0.0) {
                0.25 * gain_info.gain
            } else {
                gain_info.gain
            };

            let scaled_coeffs: Vec<f32> = coeffs.iter().map(|&c| c * gain).collect();
            self.model.accumulate(scale, x, y, &scaled_coeffs);

            self.per_scale_found
                .entry(scale)
                .or_insert_with(|| Array2::from_elem(self.image_shape, false))[[y, x]] = true;

            subtract_psf_from_cube(dirty_cube, &conv_psf_entry.conv_psf, x, y, &f_hat_pol, gain);
            let picked_value = active.values[idx];
            subtract_psf_from_active_set(
                &mut active,
                &conv_psf_entry.conv2_psf_mean,
                x,
                y,
                picked_value * gain,
            );

            k += 1;
        }

        Ok((k, scale))
    }

    /// Reconstructs the model image at `freqs` from the accumulated
    /// dictionary: scale-0 components place their evaluated spectrum
    /// directly at the pixel (a delta); non-zero-scale components are
    /// spread through their scale's spatial kernel, windowed and edge-clipped
    /// the same way the minor loop subtracts the convolved PSF.
    pub fn give_model_image(&self, freqs: &[f64]) -> Array3<f32> {
        let n_chan = freqs.len();
        let (ny, nx) = self.image_shape;
        let mut image = Array3::<f32>::zeros((n_chan, ny, nx));

        for &scale in self.model.scales() {
            if scale == 0 {
                for (&(x, y), coeffs) in self.model.entries(scale) {
                    let spectrum = self.freq_machine.eval_on(coeffs, freqs);
                    for c in 0..n_chan {
                        image[[c, y, x]] += spectrum[c];
                    }
                }
                continue;
            }

            let kernel = self.scale_machine.spatial_kernel(scale);
            let (ky, kx) = kernel.dim();
            let cy = (ky / 2) as isize;
            let cx = (kx / 2) as isize;

            for (&(x, y), coeffs) in self.model.entries(scale) {
                let spectrum = self.freq_machine.eval_on(coeffs, freqs);
                for py in 0..ky {
                    let ty = y as isize + (py as isize - cy);
                    if ty < 0 || ty as usize >= ny {
                        continue;
                    }
                    for px in 0..kx {
                        let tx = x as isize + (px as isize - cx);
                        if tx < 0 || tx as usize >= nx {
                            continue;
                        }
                        let k = kernel[[py, px]];
                        for c in 0..n_chan {
                            image[[c, ty as usize, tx as usize]] += spectrum[c] * k;
                        }
                    }
                }
            }
        }

        image
    }

    /// Serializes the accumulated model dictionary to `path`, atomically
    /// (temp file + rename), so a crash mid-write never corrupts the prior
    /// model file.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let scale_info = self
            .scale_machine
            .scales
            .iter()
            .enumerate()
            .map(|(i, &sigma)| (i, ScaleInfoEntry { sigma }))
            .collect();

        let comp = self
            .model
            .scales()
            .map(|&scale| {
                let pixels = self
                    .model
                    .entries(scale)
                    .map(|(&(x, y), coeffs)| (format!("{x},{y}"), coeffs.clone()))
                    .collect();
                (scale, pixels)
            })
            .collect();

        let persisted = PersistedModel {
            kind: "WSCMS".to_string(),
            ref_freq: self.freq_machine.freq_ref(),
            model_shape: self.image_shape,
            scale_info,
            comp,
        };

        let bytes = serde_json::to_vec_pretty(&persisted).map_err(|e| WscmsError::ModelFormat {
            path: path.display().to_string(),
            source: e,
        })?;

        let tmp_path = path.with_extension("tmp");
        let write_result = (|| -> std::io::Result<()> {
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(WscmsError::ModelIo {
                path: path.display().to_string(),
                source: e,
            });
        }

        std::fs::rename(&tmp_path, path).map_err(|e| WscmsError::ModelIo {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Loads a model dictionary previously written by `to_file`, replacing
    /// whatever components this machine had accumulated so far.
    pub fn from_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| WscmsError::ModelIo {
            path: path.display().to_string(),
            source: e,
        })?;
        let persisted: PersistedModel =
            serde_json::from_slice(&bytes).map_err(|e| WscmsError::ModelFormat {
                path: path.display().to_string(),
                source: e,
            })?;

        let mut model = ModelDictionary::default();
        for (scale, pixels) in persisted.comp {
            for (key, coeffs) in pixels {
                let (x, y) = parse_pixel_key(&key).ok_or_else(|| WscmsError::ModelIo {
                    path: path.display().to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed component pixel key {key:?}"),
                    ),
                })?;
                model.accumulate(scale, x, y, &coeffs);
            }
        }
        self.model = model;
        Ok(())
    }
}

//! End-to-end coverage of `do_minor_loop` against the concrete scenarios it
//! is designed around, exercised through the crate's public API only.

use ndarray::{Array2, Array3};
use wscms_core::beam::UnitJonesNorm;
use wscms_core::config::AutoMaskPolicy;
use wscms_core::freq::{Basis, FrequencyMachine};
use wscms_core::psf::{FacetPsf, PaddedPsfInfo, SingleFacetPsfServer, VariablePsfInfo};
use wscms_core::scale::{derive_scale_set, scale_bias, ScaleMachine};
use wscms_core::ModelMachine;

fn unit_impulse_psf(n: usize, n_chan: usize) -> FacetPsf {
    let mut mean_psf = Array2::zeros((n, n));
    mean_psf[[n / 2, n / 2]] = 1.0;
    let mut psf_cube = Array3::zeros((n_chan, n, n));
    for c in 0..n_chan {
        psf_cube[[c, n / 2, n / 2]] = 1.0;
    }
    FacetPsf { psf_cube, mean_psf }
}

fn single_facet_server(n: usize, n_chan: usize) -> SingleFacetPsfServer {
    SingleFacetPsfServer {
        psf: unit_impulse_psf(n, n_chan),
        info: VariablePsfInfo {
            estimates_avg_psf: 4.0,
            fwhm_beam: (4.0, 4.0),
            padded_psf_info: PaddedPsfInfo {
                padded_shape: (n, n),
                padding_factor: 1.0,
            },
        },
        image_shape: (n, n),
    }
}

fn build_machine(
    n: usize,
    n_chan: usize,
    gain: f32,
    n_sub_minor_iter: u32,
    auto_mask: AutoMaskPolicy,
    cache_dir: &std::path::Path,
) -> ModelMachine<SingleFacetPsfServer, UnitJonesNorm> {
    let scales = vec![0.0, 2.0];
    let bias = scale_bias(&scales, 0.6);
    let scale_machine =
        ScaleMachine::new(scales, bias, gain, (n, n), (n, n), 1, cache_dir, 8).unwrap();
    let freqs: Vec<f64> = (0..n_chan).map(|i| 1.0e9 + i as f64 * 1.0e8).collect();
    let freq_ref = freqs[freqs.len() / 2];
    let freq_machine = FrequencyMachine::new(freqs, freq_ref, 1, Basis::Polynomial);

    ModelMachine::new(
        scale_machine,
        freq_machine,
        single_facet_server(n, n_chan),
        UnitJonesNorm,
        0.75,
        n_sub_minor_iter,
        false,
        auto_mask,
        (n, n),
    )
}

/// Scenario 1 (spec §8): a centered unit-impulse PSF and a single-pixel
/// dirty spike clean in exactly one iteration, landing the full flux in the
/// model dictionary and zeroing the dirty cube.
#[test]
fn unit_psf_delta_dirty_cleans_in_one_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let n = 21;
    let mut mm = build_machine(n, 1, 1.0, 10, AutoMaskPolicy::Disabled, dir.path());

    let mut dirty = Array3::<f32>::zeros((1, n, n));
    dirty[[0, 10, 10]] = 1.0;
    let mean_dirty = dirty.slice(ndarray::s![0, .., ..]).to_owned();

    let (k, scale) = mm
        .do_minor_loop(&mut dirty, &mean_dirty, &[1.0], 1.0, 0.01)
        .unwrap();

    assert_eq!((k, scale), (1, 0));
    let comp = mm.model.get(0, 10, 10).unwrap();
    assert!((comp[0] - 1.0).abs() < 1e-3, "component = {comp:?}");
    for &v in dirty.iter() {
        assert!(v.abs() < 1e-3, "dirty cube not cleaned: {v}");
    }
}

/// Scenario 2 (spec §8): two well-separated sources, one at the global peak
/// and one below the sub-minor threshold T=0.75*peak0. Only the stronger
/// source enters the active set and gets cleaned; the weaker one sits below
/// T and is left completely untouched by this call.
#[test]
fn weaker_well_separated_source_is_left_below_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let n = 81;
    let mut mm = build_machine(n, 1, 0.5, 4, AutoMaskPolicy::Disabled, dir.path());

    let mut dirty = Array3::<f32>::zeros((1, n, n));
    dirty[[0, 10, 10]] = 1.0;
    dirty[[0, 50, 50]] = 0.3;
    let mean_dirty = dirty.slice(ndarray::s![0, .., ..]).to_owned();

    let (k, scale) = mm
        .do_minor_loop(&mut dirty, &mean_dirty, &[1.0], 1.0, 0.01)
        .unwrap();

    assert_eq!(scale, 0);
    assert!(k >= 1, "expected the stronger source to be picked at least once");
    assert!(mm.model.get(0, 10, 10).is_some());
    assert!(
        mm.model.get(0, 50, 50).is_none(),
        "the below-threshold source must not enter the model dictionary"
    );
    assert!(
        (dirty[[0, 50, 50]] - 0.3).abs() < 1e-6,
        "the below-threshold source must be left untouched"
    );
}

/// Scenario: idempotence — NSubMinorIter=0 leaves D and the model dictionary
/// untouched and returns (0, 0), regardless of what's in the dirty cube.
#[test]
fn zero_iteration_cap_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let n = 21;
    let mut mm = build_machine(n, 1, 1.0, 0, AutoMaskPolicy::Disabled, dir.path());

    let mut dirty = Array3::<f32>::zeros((1, n, n));
    dirty[[0, 10, 10]] = 1.0;
    let original = dirty.clone();
    let mean_dirty = dirty.slice(ndarray::s![0, .., ..]).to_owned();

    let (k, scale) = mm
        .do_minor_loop(&mut dirty, &mean_dirty, &[1.0], 1.0, 0.01)
        .unwrap();

    assert_eq!((k, scale), (0, 0));
    assert_eq!(dirty, original);
    assert!(mm.model.is_empty());
}

/// Boundary behavior (spec §8): a peak sitting at the image edge subtracts
/// without panicking or corrupting memory, via symmetric window clipping.
#[test]
fn edge_peak_subtracts_without_out_of_bounds_access() {
    let dir = tempfile::tempdir().unwrap();
    let n = 21;
    let mut mm = build_machine(n, 1, 1.0, 10, AutoMaskPolicy::Disabled, dir.path());

    let mut dirty = Array3::<f32>::zeros((1, n, n));
    dirty[[0, 0, 0]] = 1.0;
    let mean_dirty = dirty.slice(ndarray::s![0, .., ..]).to_owned();

    let (k, scale) = mm
        .do_minor_loop(&mut dirty, &mean_dirty, &[1.0], 1.0, 0.01)
        .unwrap();

    assert_eq!((k, scale), (1, 0));
    assert!(mm.model.get(0, 0, 0).is_some());
}

/// Scenario using a multi-scale auto-derived set (spec §8 "biased scale
/// pick" in spirit): a broad source should still drive at least one
/// accepted component through the full machine, exercising the derived
/// scale set end to end rather than the two-scale fixture used elsewhere.
#[test]
fn derived_scale_set_cleans_a_broad_source() {
    let dir = tempfile::tempdir().unwrap();
    let scales = derive_scale_set(8.0, 64.0);
    assert!(scales.len() > 1, "expected more than the delta scale to be derived");

    let n = 41;
    let mut mm = build_machine(n, 1, 0.5, 20, AutoMaskPolicy::Disabled, dir.path());
    mm.scale_machine.scales = scales.clone();
    mm.scale_machine.bias = scale_bias(&scales, 0.6);

    let mut dirty = Array3::<f32>::zeros((1, n, n));
    dirty[[0, 20, 20]] = 1.0;
    let mean_dirty = dirty.slice(ndarray::s![0, .., ..]).to_owned();

    let (k, _scale) = mm
        .do_minor_loop(&mut dirty, &mean_dirty, &[1.0], 1.0, 0.01)
        .unwrap();
    assert!(k >= 1);
}

/// Scenario 3 (spec §8 "biased scale pick"): a broad Gaussian source, wide
/// enough relative to the beam that the bias-weighted scale search must
/// prefer a non-zero scale over the delta scale at the source's peak pixel.
#[test]
fn broad_source_biases_the_scale_pick_away_from_the_delta_scale() {
    let dir = tempfile::tempdir().unwrap();
    let n = 81;
    let scales = vec![0.0, 2.0, 4.0, 8.0];
    let bias = scale_bias(&scales, 0.6);
    let scale_machine =
        ScaleMachine::new(scales, bias, 1.0, (n, n), (n, n), 1, dir.path(), 8).unwrap();

    let freqs = vec![1.0e9];
    let freq_machine = FrequencyMachine::new(freqs.clone(), freqs[0], 1, Basis::Polynomial);

    let mut mm = ModelMachine::new(
        scale_machine,
        freq_machine,
        single_facet_server(n, 1),
        UnitJonesNorm,
        0.75,
        10,
        false,
        AutoMaskPolicy::Disabled,
        (n, n),
    );

    // A broad Gaussian blob (sigma = 6 px), much wider than the delta scale.
    let mut mean_dirty = Array2::<f32>::zeros((n, n));
    let (cy, cx) = (n / 2, n / 2);
    let sigma = 6.0_f64;
    for y in 0..n {
        for x in 0..n {
            let dy = (y as isize - cy as isize) as f64;
            let dx = (x as isize - cx as isize) as f64;
            let r2 = dx * dx + dy * dy;
            mean_dirty[[y, x]] = (-r2 / (2.0 * sigma * sigma)).exp() as f32;
        }
    }
    let mut dirty = Array3::<f32>::zeros((1, n, n));
    dirty.slice_mut(ndarray::s![0, .., ..]).assign(&mean_dirty);

    let (k, scale) = mm
        .do_minor_loop(&mut dirty, &mean_dirty, &[1.0], 1.0, 0.01)
        .unwrap();

    assert!(k >= 1, "expected the broad source to be picked at least once");
    assert_ne!(
        scale, 0,
        "a sufficiently broad source must bias the scale search away from the delta scale"
    );
}

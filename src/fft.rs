//! Pre-planned, thread-parallel 2D real<->complex FFTs over batched cubes.
//!
//! A 2D real-to-complex transform is built from two 1D passes: a real FFT
//! along the fast (x) axis producing a half-spectrum, followed by a complex
//! FFT along the slow (y) axis. This mirrors the batched convolution engine
//! this crate is descended from, generalized from a single 1D trace to a
//! batch of 2D planes (channel/scale on the batch axis).

use ndarray::{s, Array3};
use rayon::prelude::*;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// One batched real/complex buffer pair: `batch` independent `ny * nx` planes.
///
/// The real plane and its half-spectrum are logically one storage location —
/// callers write into `real`, call a transform, then read `spectrum` (or vice
/// versa) without needing to track aliasing themselves.
pub struct FftBatch {
    pub batch: usize,
    pub ny: usize,
    pub nx: usize,
    pub nx_half: usize,
    pub real: Array3<f32>,
    pub spectrum: Array3<Complex<f32>>,
}

impl FftBatch {
    pub fn zeros(batch: usize, ny: usize, nx: usize) -> Self {
        let nx_half = nx / 2 + 1;
        FftBatch {
            batch,
            ny,
            nx,
            nx_half,
            real: Array3::zeros((batch, ny, nx)),
            spectrum: Array3::from_elem((batch, ny, nx_half), Complex::new(0.0, 0.0)),
        }
    }
}

/// A pre-planned transform pair for a fixed (ny, nx) shape, reused across
/// every batch that shares that shape (image-sized, PSF-sized, scale-sized).
pub struct Fft2DPlan {
    ny: usize,
    nx: usize,
    nx_half: usize,
    row_fwd: Arc<dyn RealToComplex<f32>>,
    row_inv: Arc<dyn ComplexToReal<f32>>,
    col_fft: Arc<dyn Fft<f32>>,
    col_ifft: Arc<dyn Fft<f32>>,
    pool: rayon::ThreadPool,
}

impl Fft2DPlan {
    pub fn new(ny: usize, nx: usize, threads: usize) -> Self {
        let mut real_planner = RealFftPlanner::<f32>::new();
        let row_fwd = real_planner.plan_fft_forward(nx);
        let row_inv = real_planner.plan_fft_inverse(nx);

        let mut complex_planner = FftPlanner::<f32>::new();
        let col_fft = complex_planner.plan_fft_forward(ny);
        let col_ifft = complex_planner.plan_fft_inverse(ny);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .expect("failed to build FFT thread pool");

        Fft2DPlan {
            ny,
            nx,
            nx_half: nx / 2 + 1,
            row_fwd,
            row_inv,
            col_fft,
            col_ifft,
            pool,
        }
    }

    pub fn new_batch(&self, batch: usize) -> FftBatch {
        FftBatch::zeros(batch, self.ny, self.nx)
    }

    /// Forward real-to-complex transform: `buf.real` -> `buf.spectrum`, batch-parallel.
    pub fn forward(&self, buf: &mut FftBatch) {
        assert_eq!((buf.ny, buf.nx), (self.ny, self.nx));
        let ny = self.ny;
        let nx_half = self.nx_half;
        let row_fwd = self.row_fwd.clone();
        let col_fft = self.col_fft.clone();

        self.pool.install(|| {
            buf.real
                .outer_iter_mut()
                .into_par_iter()
                .zip(buf.spectrum.outer_iter_mut().into_par_iter())
                .for_each(|(mut real_plane, mut spec_plane)| {
                    let mut row_scratch = row_fwd.make_scratch_vec();
                    // Row pass: real FFT along x, one row at a time.
                    for y in 0..ny {
                        let mut row_in = real_plane.row_mut(y).to_owned().into_raw_vec();
                        let mut row_out = vec![Complex::new(0.0, 0.0); nx_half];
                        row_fwd
                            .process_with_scratch(&mut row_in, &mut row_out, &mut row_scratch)
                            .expect("row forward FFT failed");
                        spec_plane.row_mut(y).assign(&ndarray::Array1::from(row_out));
                    }
                    // Column pass: complex FFT along y, one column at a time.
                    let mut col_scratch =
                        vec![Complex::new(0.0, 0.0); col_fft.get_inplace_scratch_len()];
                    for x in 0..nx_half {
                        let mut col: Vec<Complex<f32>> =
                            (0..ny).map(|y| spec_plane[[y, x]]).collect();
                        col_fft.process_with_scratch(&mut col, &mut col_scratch);
                        for y in 0..ny {
                            spec_plane[[y, x]] = col[y];
                        }
                    }
                });
        });
    }

    /// Inverse complex-to-real transform: `buf.spectrum` -> `buf.real`, batch-parallel.
    /// Normalizes by `1/(ny*nx)` so forward+inverse round-trips to the input.
    pub fn inverse(&self, buf: &mut FftBatch) {
        assert_eq!((buf.ny, buf.nx), (self.ny, self.nx));
        let ny = self.ny;
        let nx = self.nx;
        let nx_half = self.nx_half;
        let row_inv = self.row_inv.clone();
        let col_ifft = self.col_ifft.clone();
        let scale = 1.0 / (ny * nx) as f32;

        self.pool.install(|| {
            buf.spectrum
                .outer_iter_mut()
                .into_par_iter()
                .zip(buf.real.outer_iter_mut().into_par_iter())
                .for_each(|(mut spec_plane, mut real_plane)| {
                    // Inverse column pass first.
                    let mut col_scratch =
                        vec![Complex::new(0.0, 0.0); col_ifft.get_inplace_scratch_len()];
                    for x in 0..nx_half {
                        let mut col: Vec<Complex<f32>> =
                            (0..ny).map(|y| spec_plane[[y, x]]).collect();
                        col_ifft.process_with_scratch(&mut col, &mut col_scratch);
                        for y in 0..ny {
                            spec_plane[[y, x]] = col[y];
                        }
                    }
                    // Inverse row pass.
                    let mut row_scratch = row_inv.make_scratch_vec();
                    for y in 0..ny {
                        let mut row_in: Vec<Complex<f32>> =
                            (0..nx_half).map(|x| spec_plane[[y, x]]).collect();
                        // The DC (and, for even nx, Nyquist) bin must be purely
                        // real for any real-valued signal; clear accumulated
                        // floating-point roundoff rather than let realfft's
                        // exact-zero check reject it.
                        row_in[0].im = 0.0;
                        if nx.is_multiple_of(2) {
                            let last = row_in.len() - 1;
                            row_in[last].im = 0.0;
                        }
                        let mut row_out = vec![0.0_f32; nx];
                        row_inv
                            .process_with_scratch(&mut row_in, &mut row_out, &mut row_scratch)
                            .expect("row inverse FFT failed");
                        for x in 0..nx {
                            real_plane[[y, x]] = row_out[x] * scale;
                        }
                    }
                });
        });
    }
}

/// Owns the three batched transform pairs the engine needs: image-sized
/// (channels * pols, Y_pad, X_pad), PSF-sized (channels * pols, Y_p_pad,
/// X_p_pad) and scale-sized (scales, Y_pad, X_pad).
pub struct FftManager {
    pub image_plan: Fft2DPlan,
    pub psf_plan: Fft2DPlan,
    pub scale_plan: Fft2DPlan,
}

impl FftManager {
    pub fn new(
        image_shape: (usize, usize),
        psf_shape: (usize, usize),
        threads: usize,
    ) -> Self {
        FftManager {
            image_plan: Fft2DPlan::new(image_shape.0, image_shape.1, threads),
            psf_plan: Fft2DPlan::new(psf_shape.0, psf_shape.1, threads),
            // The scale-sized batch shares the image grid: one plane per scale.
            scale_plan: Fft2DPlan::new(image_shape.0, image_shape.1, threads),
        }
    }
}

/// Convenience: pad an odd-centered 2D array up to `(target_ny, target_nx)`
/// with zeros, keeping the original content anchored at the top-left. Used
/// before handing image/PSF planes to a `Fft2DPlan` whose shape is the padded
/// grid.
pub fn pad_to(src: &ndarray::ArrayView2<f32>, target_ny: usize, target_nx: usize) -> ndarray::Array2<f32> {
    let mut out = ndarray::Array2::zeros((target_ny, target_nx));
    let (ny, nx) = src.dim();
    out.slice_mut(s![0..ny, 0..nx]).assign(src);
    out
}

/// Shifts the zero-frequency (DC) component of a periodic array from index 0
/// to the center of the grid, the way an inverse-FFT'd kernel needs to be
/// re-centered before it can be used as a spatial convolution stamp.
pub fn fftshift(plane: &ndarray::Array2<f32>) -> ndarray::Array2<f32> {
    let (ny, nx) = plane.dim();
    let sy = ny / 2;
    let sx = nx / 2;
    let mut out = ndarray::Array2::zeros((ny, nx));
    for y in 0..ny {
        let ty = (y + sy) % ny;
        for x in 0..nx {
            let tx = (x + sx) % nx;
            out[[ty, tx]] = plane[[y, x]];
        }
    }
    out
}

/// Round a dimension up to the nearest odd padded size: `ceil(dim * factor)`,
/// bumped to the next odd value.
pub fn odd_padded_size(dim: usize, factor: f64) -> usize {
    let padded = ((dim as f64) * factor).ceil() as usize;
    if padded.is_multiple_of(2) {
        padded + 1
    } else {
        padded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_recovers_input() {
        let ny = 8;
        let nx = 8;
        let plan = Fft2DPlan::new(ny, nx, 1);
        let mut buf = plan.new_batch(2);

        for b in 0..2 {
            for y in 0..ny {
                for x in 0..nx {
                    buf.real[[b, y, x]] = ((b + 1) * (y + 1) * (x + 1)) as f32 * 0.01;
                }
            }
        }
        let original = buf.real.clone();

        plan.forward(&mut buf);
        plan.inverse(&mut buf);

        for b in 0..2 {
            for y in 0..ny {
                for x in 0..nx {
                    let diff = (buf.real[[b, y, x]] - original[[b, y, x]]).abs();
                    assert!(diff < 1e-4, "mismatch at ({b},{y},{x}): diff={diff}");
                }
            }
        }
    }

    #[test]
    fn impulse_has_flat_spectrum_magnitude() {
        let ny = 4;
        let nx = 4;
        let plan = Fft2DPlan::new(ny, nx, 1);
        let mut buf = plan.new_batch(1);
        buf.real[[0, 0, 0]] = 1.0;

        plan.forward(&mut buf);

        for y in 0..ny {
            for x in 0..buf.nx_half {
                let mag = buf.spectrum[[0, y, x]].norm();
                assert!((mag - 1.0).abs() < 1e-4, "magnitude at ({y},{x}) = {mag}");
            }
        }
    }

    #[test]
    fn odd_padded_size_is_always_odd() {
        assert_eq!(odd_padded_size(10, 1.5), 15);
        assert_eq!(odd_padded_size(10, 1.0), 11);
        assert_eq!(odd_padded_size(9, 1.0), 9);
    }
}

//! Narrow trait boundary onto the external PSF Server collaborator (out of
//! scope here — this crate only consumes it).

use ndarray::{Array2, Array3};

/// The (P, P̄) pair returned by `PsfServer::give_psf` for the current facet.
#[derive(Debug, Clone)]
pub struct FacetPsf {
    /// Full per-channel PSF cube, shape (channels, Y_p, X_p).
    pub psf_cube: Array3<f32>,
    /// Mean (channel-weighted-summed) PSF, shape (Y_p, X_p).
    pub mean_psf: Array2<f32>,
}

/// Padding applied before FFTs, per `Facets.Padding`.
#[derive(Debug, Clone, Copy)]
pub struct PaddedPsfInfo {
    pub padded_shape: (usize, usize),
    pub padding_factor: f64,
}

/// `DicoVariablePSF` fields this crate actually consumes.
#[derive(Debug, Clone, Copy)]
pub struct VariablePsfInfo {
    /// Average beam FWHM estimate, in pixels.
    pub estimates_avg_psf: f64,
    /// Beam FWHM (major, minor), in pixels.
    pub fwhm_beam: (f64, f64),
    pub padded_psf_info: PaddedPsfInfo,
}

/// Narrow interface onto the PSF Server: facet selection, PSF retrieval, and
/// the handful of attributes the Scale/Model Machines need.
pub trait PsfServer {
    fn set_facet(&mut self, facet_id: usize);
    /// Selects the facet containing (x, y) and returns its id.
    fn set_location(&mut self, x: usize, y: usize) -> usize;
    fn give_psf(&self) -> FacetPsf;
    fn image_shape(&self) -> (usize, usize);
    fn n_psf(&self) -> usize;
    fn variable_psf_info(&self) -> VariablePsfInfo;
}

/// In-memory fake `PsfServer` used by tests: a single facet covering the
/// whole image.
#[cfg(any(test, feature = "test-support"))]
pub struct SingleFacetPsfServer {
    pub psf: FacetPsf,
    pub info: VariablePsfInfo,
    pub image_shape: (usize, usize),
}

#[cfg(any(test, feature = "test-support"))]
impl PsfServer for SingleFacetPsfServer {
    fn set_facet(&mut self, _facet_id: usize) {}
    fn set_location(&mut self, _x: usize, _y: usize) -> usize {
        0
    }
    fn give_psf(&self) -> FacetPsf {
        self.psf.clone()
    }
    fn image_shape(&self) -> (usize, usize) {
        self.image_shape
    }
    fn n_psf(&self) -> usize {
        1
    }
    fn variable_psf_info(&self) -> VariablePsfInfo {
        self.info
    }
}

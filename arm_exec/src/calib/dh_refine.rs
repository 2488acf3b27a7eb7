//! DH parameter refinement by nonlinear least squares

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use comms_if::eqpt::vision::MeasuredPoint;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use log::{debug, info, warn};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn, Vector3};
use serde::{Deserialize, Serialize};

use super::CalibError;
use crate::kin::{tcp_position, DhSet, JointVector, NUM_JOINTS};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Fewest samples a DH refinement is attempted with.
pub const MIN_DH_SAMPLES: usize = 10;

/// Refined parameters per joint: `a`, `d` and `alpha`.
const PARAMS_PER_JOINT: usize = 3;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// One observation of the tool position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibSample {
    /// Joint positions the arm was at
    ///
    /// Units: radians
    pub joints: JointVector,

    /// Tool position predicted by the model in use when the sample was taken
    ///
    /// Units: millimetres
    pub theoretical_position_mm: [f64; 3],

    /// Tool position measured by the metrology
    ///
    /// Units: millimetres
    pub measured_position_mm: [f64; 3],
}

/// Solver settings of the refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhRefineParams {
    /// Relative reduction of the cost below which the solver stops
    pub ftol: f64,

    /// Relative change of the parameters below which the solver stops
    pub xtol: f64,

    /// Orthogonality of the residuals and the Jacobian below which the
    /// solver stops
    pub gtol: f64,

    /// Function evaluations allowed, as a multiple of the parameter count
    pub patience: usize,

    /// A solution whose RMS error is below this is accepted even if the
    /// solver did not report convergence.
    ///
    /// Units: millimetres
    pub accept_rms_mm: f64,

    /// Relative step of the central differences used for the Jacobian
    pub fd_step: f64,
}

/// Outcome of a successful refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhRefinement {
    /// The refined set, the `theta` offsets are those of the initial set
    pub dh: DhSet,

    /// Mean Euclidean error of the initial set over the samples
    ///
    /// Units: millimetres
    pub initial_mean_error_mm: f64,

    /// Mean Euclidean error of the refined set over the samples
    ///
    /// Units: millimetres
    pub mean_error_mm: f64,

    /// RMS of the Euclidean errors of the refined set
    ///
    /// Units: millimetres
    pub rms_error_mm: f64,

    pub num_evaluations: usize,
}

/// The least squares problem handed to the solver.
struct DhProblem<'a> {
    initial: &'a DhSet,
    tool_offset: &'a Vector3<f64>,
    samples: &'a [CalibSample],
    fd_step: f64,

    params: DVector<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl CalibSample {
    pub fn new(joints: JointVector, theoretical: &Vector3<f64>, measured: &MeasuredPoint) -> Self {
        Self {
            joints,
            theoretical_position_mm: [theoretical.x, theoretical.y, theoretical.z],
            measured_position_mm: measured.to_array(),
        }
    }

    fn measured(&self) -> Vector3<f64> {
        Vector3::from(self.measured_position_mm)
    }
}

impl Default for DhRefineParams {
    fn default() -> Self {
        Self {
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-12,
            patience: 200,
            accept_rms_mm: 0.5,
            fd_step: 1e-6,
        }
    }
}

impl<'a> DhProblem<'a> {
    fn dh(&self, params: &DVector<f64>) -> DhSet {
        unpack(self.initial, params)
    }

    fn residuals_at(&self, params: &DVector<f64>) -> DVector<f64> {
        let dh = self.dh(params);
        let mut r = DVector::zeros(3 * self.samples.len());

        for (i, s) in self.samples.iter().enumerate() {
            let err = tcp_position(&dh, self.tool_offset, &s.joints) - s.measured();
            r.fixed_rows_mut::<3>(3 * i).copy_from(&err);
        }

        r
    }
}

impl<'a> LeastSquaresProblem<f64, Dyn, Dyn> for DhProblem<'a> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.params.clone_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jac = DMatrix::zeros(3 * self.samples.len(), self.params.len());
        let mut x = self.params.clone();

        for k in 0..self.params.len() {
            let h = self.fd_step * self.params[k].abs().max(1.0);

            x[k] = self.params[k] + h;
            let plus = self.residuals_at(&x);
            x[k] = self.params[k] - h;
            let minus = self.residuals_at(&x);
            x[k] = self.params[k];

            jac.set_column(k, &((plus - minus) / (2.0 * h)));
        }

        Some(jac)
    }
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Refine the `a`, `d` and `alpha` parameters of every joint so the tool
/// positions predicted for the sampled joints best match the measured ones.
///
/// The solver is seeded with `initial`. An error is returned, and nothing is
/// to be installed, when there are fewer than [`MIN_DH_SAMPLES`] samples, the
/// solver did not converge or the refined set fits the samples worse than the
/// initial one.
pub fn refine_dh(
    initial: &DhSet,
    tool_offset: &Vector3<f64>,
    samples: &[CalibSample],
    params: &DhRefineParams,
) -> Result<DhRefinement, CalibError> {
    if samples.len() < MIN_DH_SAMPLES {
        return Err(CalibError::InsufficientData {
            required: MIN_DH_SAMPLES,
            provided: samples.len(),
        });
    }

    let (initial_mean_error_mm, initial_rms_mm) = position_errors(initial, tool_offset, samples);
    info!(
        "Refining DH parameters over {} samples, initial mean error {:.3} mm (RMS {:.3} mm)",
        samples.len(),
        initial_mean_error_mm,
        initial_rms_mm
    );

    let problem = DhProblem {
        initial,
        tool_offset,
        samples,
        fd_step: params.fd_step,
        params: pack(initial),
    };

    let (problem, report) = LevenbergMarquardt::new()
        .with_ftol(params.ftol)
        .with_xtol(params.xtol)
        .with_gtol(params.gtol)
        .with_patience(params.patience.max(1))
        .minimize(problem);

    let dh = problem.dh(&problem.params);
    let (mean_error_mm, rms_error_mm) = position_errors(&dh, tool_offset, samples);

    debug!(
        "Solver stopped after {} evaluations: {:?}, cost {:e}",
        report.number_of_evaluations, report.termination, report.objective_function
    );

    if !dh.iter().all(|p| p.is_finite()) || !rms_error_mm.is_finite() {
        warn!("DH refinement produced non-finite parameters");
        return Err(CalibError::Divergence(format!(
            "solver terminated with {:?} and non-finite parameters",
            report.termination
        )));
    }

    if !report.termination.was_successful() && rms_error_mm > params.accept_rms_mm {
        warn!(
            "DH refinement did not converge ({:?}), RMS error {:.3} mm",
            report.termination, rms_error_mm
        );
        return Err(CalibError::Divergence(format!(
            "solver terminated with {:?}, RMS error {:.3} mm",
            report.termination, rms_error_mm
        )));
    }

    if mean_error_mm > initial_mean_error_mm {
        warn!(
            "Refined DH parameters are worse than the initial ones ({:.3} mm > {:.3} mm)",
            mean_error_mm, initial_mean_error_mm
        );
        return Err(CalibError::Divergence(format!(
            "mean error increased from {:.3} mm to {:.3} mm",
            initial_mean_error_mm, mean_error_mm
        )));
    }

    info!(
        "DH refinement converged, mean error {:.3} mm -> {:.3} mm",
        initial_mean_error_mm, mean_error_mm
    );

    Ok(DhRefinement {
        dh,
        initial_mean_error_mm,
        mean_error_mm,
        rms_error_mm,
        num_evaluations: report.number_of_evaluations,
    })
}

/// Mean and RMS of the Euclidean tool position errors over the samples.
pub fn position_errors(
    dh: &DhSet,
    tool_offset: &Vector3<f64>,
    samples: &[CalibSample],
) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }

    let n = samples.len() as f64;
    let (sum, sum_sq) = samples
        .iter()
        .map(|s| (tcp_position(dh, tool_offset, &s.joints) - s.measured()).norm())
        .fold((0.0, 0.0), |(sum, sum_sq), e| (sum + e, sum_sq + e * e));

    (sum / n, (sum_sq / n).sqrt())
}

fn pack(dh: &DhSet) -> DVector<f64> {
    DVector::from_iterator(
        NUM_JOINTS * PARAMS_PER_JOINT,
        dh.iter().flat_map(|p| [p.a, p.d, p.alpha]),
    )
}

fn unpack(initial: &DhSet, params: &DVector<f64>) -> DhSet {
    let mut dh = *initial;

    for (i, p) in dh.iter_mut().enumerate() {
        p.a = params[PARAMS_PER_JOINT * i];
        p.d = params[PARAMS_PER_JOINT * i + 1];
        p.alpha = params[PARAMS_PER_JOINT * i + 2];
    }

    dh
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

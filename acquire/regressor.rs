//! # Uncertainty-Aware Regressors
//!
//! The acquisition loop only needs a model that can be refitted on the
//! observed pool and that reports a predictive variance alongside every
//! prediction. `Regressor` is that seam. Two closed-form models implement it:
//!
//! - `GaussianProcess`: exact GP regression with a squared-exponential kernel.
//!   Training factorises the kernel matrix once; prediction evaluates the
//!   cross-kernel in row chunks on the rayon pool.
//! - `BayesianRidge`: Bayesian linear regression with a Gaussian prior on the
//!   weights and fixed noise. Cheap enough for large observed pools.
//!
//! Both return the variance of the latent function at each input row.

use crate::types::Prediction;
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, Diag, Inverse, SolveTriangular, UPLO};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Rows of the test matrix handled per parallel work item during GP prediction.
const GP_PREDICT_CHUNK_ROWS: usize = 512;
/// Diagonal jitter added, and multiplied by ten on each retry, when the kernel
/// matrix is numerically not positive definite.
const GP_INITIAL_JITTER: f64 = 1e-8;
const GP_MAX_JITTER_ATTEMPTS: usize = 4;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("The model must be fitted before it can predict.")]
    NotFitted,
    #[error("Cannot fit a model on an empty training set.")]
    EmptyTrainingSet,
    #[error("The training pool carries no affinity labels.")]
    MissingTargets,
    #[error("Training matrix has {rows} rows but {targets} targets were supplied.")]
    TargetLengthMismatch { rows: usize, targets: usize },
    #[error("Model was fitted on {expected} features but received {found}.")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("Invalid hyperparameter '{name}': {value} (must be finite and positive).")]
    InvalidHyperparameter { name: &'static str, value: f64 },
    #[error("Non-finite value found in the training {0}.")]
    NonFiniteTrainingData(&'static str),
    #[error("A linear algebra routine failed: {0}")]
    Linalg(#[from] LinalgError),
    #[error("Failed to assemble prediction chunks: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// A model that can be refitted each round and predicts with uncertainty.
pub trait Regressor: Send + Sync {
    /// Short name used in logs and output files.
    fn name(&self) -> &'static str;

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError>;

    /// Predicted values and variances for every row of `x`, in row order.
    fn predict(&self, x: ArrayView2<f64>) -> Result<Prediction, ModelError>;
}

/// The regressor families selectable from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegressorKind {
    Gp,
    Ridge,
}

impl RegressorKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Gp => "gp",
            Self::Ridge => "ridge",
        }
    }

    pub fn build(self, gp: &GpConfig, ridge: &RidgeConfig) -> Box<dyn Regressor> {
        match self {
            Self::Gp => Box::new(GaussianProcess::new(gp.clone())),
            Self::Ridge => Box::new(BayesianRidge::new(ridge.clone())),
        }
    }
}

impl fmt::Display for RegressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RegressorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gp" => Ok(Self::Gp),
            "ridge" | "bayesridge" => Ok(Self::Ridge),
            other => Err(format!(
                "unknown regressor type '{other}' (expected one of: gp, ridge)"
            )),
        }
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<(), ModelError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ModelError::InvalidHyperparameter { name, value })
    }
}

fn check_training_data(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
    if x.nrows() == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }
    if x.nrows() != y.len() {
        return Err(ModelError::TargetLengthMismatch {
            rows: x.nrows(),
            targets: y.len(),
        });
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::NonFiniteTrainingData("features"));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(ModelError::NonFiniteTrainingData("targets"));
    }
    Ok(())
}

// ========================================================================================
//                                  Gaussian process
// ========================================================================================

/// Squared-exponential kernel hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpConfig {
    pub length_scale: f64,
    pub signal_variance: f64,
    pub noise_variance: f64,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            length_scale: 1.0,
            signal_variance: 1.0,
            noise_variance: 0.1,
        }
    }
}

impl GpConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        check_positive("length_scale", self.length_scale)?;
        check_positive("signal_variance", self.signal_variance)?;
        check_positive("noise_variance", self.noise_variance)
    }
}

#[derive(Debug, Clone)]
struct GpFit {
    x_train: Array2<f64>,
    /// Lower Cholesky factor of the noisy training kernel.
    chol: Array2<f64>,
    alpha: Array1<f64>,
    y_mean: f64,
}

#[derive(Debug, Clone)]
pub struct GaussianProcess {
    config: GpConfig,
    fitted: Option<GpFit>,
}

impl GaussianProcess {
    pub fn new(config: GpConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    /// `k(a, b) = s^2 exp(-|a - b|^2 / (2 l^2))` for every pair of rows.
    fn kernel(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
        let a_sq: Array1<f64> = a.map_axis(Axis(1), |r| r.dot(&r));
        let b_sq: Array1<f64> = b.map_axis(Axis(1), |r| r.dot(&r));
        let cross = a.dot(&b.t());
        let scale = 2.0 * self.config.length_scale * self.config.length_scale;
        let signal = self.config.signal_variance;

        let mut k = cross;
        for ((i, j), value) in k.indexed_iter_mut() {
            let d2 = (a_sq[i] + b_sq[j] - 2.0 * *value).max(0.0);
            *value = signal * (-d2 / scale).exp();
        }
        k
    }

    fn factorize(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ModelError> {
        let mut k = self.kernel(x, x);
        let mut diagonal = k.diag_mut();
        diagonal += self.config.noise_variance;

        let mut jitter = 0.0;
        let mut attempt = 0;
        loop {
            let mut candidate = k.clone();
            if jitter > 0.0 {
                let mut diagonal = candidate.diag_mut();
                diagonal += jitter;
            }
            match candidate.cholesky(UPLO::Lower) {
                Ok(l) => return Ok(l),
                Err(e) if attempt < GP_MAX_JITTER_ATTEMPTS => {
                    jitter = if jitter == 0.0 {
                        GP_INITIAL_JITTER
                    } else {
                        jitter * 10.0
                    };
                    attempt += 1;
                    log::warn!(
                        "Cholesky of the GP kernel failed ({e}); retrying with diagonal jitter {jitter:.1e}"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Regressor for GaussianProcess {
    fn name(&self) -> &'static str {
        "gp"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        self.config.validate()?;
        check_training_data(x, y)?;

        log::info!(
            "Fitting Gaussian process on {} observations with {} features",
            x.nrows(),
            x.ncols()
        );

        let y_mean = y.mean().unwrap_or(0.0);
        let centered = y.mapv(|v| v - y_mean).insert_axis(Axis(1));

        let chol = self.factorize(x)?;
        let z = chol.solve_triangular(UPLO::Lower, Diag::NonUnit, &centered)?;
        let alpha = chol
            .t()
            .solve_triangular(UPLO::Upper, Diag::NonUnit, &z)?
            .column(0)
            .to_owned();

        self.fitted = Some(GpFit {
            x_train: x.to_owned(),
            chol,
            alpha,
            y_mean,
        });
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Prediction, ModelError> {
        let fit = self.fitted.as_ref().ok_or(ModelError::NotFitted)?;
        if x.ncols() != fit.x_train.ncols() {
            return Err(ModelError::FeatureCountMismatch {
                expected: fit.x_train.ncols(),
                found: x.ncols(),
            });
        }
        if x.nrows() == 0 {
            return Ok(Prediction::new(Array1::zeros(0), Array1::zeros(0)));
        }

        let chunks: Vec<Result<(Array1<f64>, Array1<f64>), ModelError>> = x
            .axis_chunks_iter(Axis(0), GP_PREDICT_CHUNK_ROWS)
            .into_par_iter()
            .map(|chunk| {
                let k_star = self.kernel(chunk, fit.x_train.view());
                let mean = k_star.dot(&fit.alpha) + fit.y_mean;
                let v = fit
                    .chol
                    .solve_triangular(UPLO::Lower, Diag::NonUnit, &k_star.t().to_owned())?;
                let explained = v.map_axis(Axis(0), |col| col.dot(&col));
                let variance = explained.mapv(|e| (self.config.signal_variance - e).max(0.0));
                Ok((mean, variance))
            })
            .collect();

        let mut means = Vec::with_capacity(chunks.len());
        let mut variances = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let (m, v) = chunk?;
            means.push(m);
            variances.push(v);
        }
        let mean_views: Vec<ArrayView1<f64>> = means.iter().map(|m| m.view()).collect();
        let variance_views: Vec<ArrayView1<f64>> = variances.iter().map(|v| v.view()).collect();

        Ok(Prediction::new(
            concatenate(Axis(0), &mean_views)?,
            concatenate(Axis(0), &variance_views)?,
        ))
    }
}

// ========================================================================================
//                                  Bayesian ridge
// ========================================================================================

/// Prior precision on the weights and fixed observation noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RidgeConfig {
    pub alpha: f64,
    pub noise_variance: f64,
}

impl Default for RidgeConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            noise_variance: 1.0,
        }
    }
}

impl RidgeConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        check_positive("alpha", self.alpha)?;
        check_positive("noise_variance", self.noise_variance)
    }
}

#[derive(Debug, Clone)]
struct RidgeFit {
    x_mean: Array1<f64>,
    y_mean: f64,
    weights: Array1<f64>,
    /// Posterior covariance of the weights.
    covariance: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct BayesianRidge {
    config: RidgeConfig,
    fitted: Option<RidgeFit>,
}

impl BayesianRidge {
    pub fn new(config: RidgeConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }
}

impl Regressor for BayesianRidge {
    fn name(&self) -> &'static str {
        "ridge"
    }

    fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), ModelError> {
        self.config.validate()?;
        check_training_data(x, y)?;

        log::info!(
            "Fitting Bayesian ridge on {} observations with {} features",
            x.nrows(),
            x.ncols()
        );

        let x_mean = x
            .mean_axis(Axis(0))
            .ok_or(ModelError::EmptyTrainingSet)?;
        let y_mean = y.mean().unwrap_or(0.0);
        let xc = &x - &x_mean;
        let yc = y.mapv(|v| v - y_mean);

        let noise = self.config.noise_variance;
        let mut precision = xc.t().dot(&xc) / noise;
        let mut diagonal = precision.diag_mut();
        diagonal += self.config.alpha;

        let covariance = precision.inv()?;
        let weights = covariance.dot(&xc.t().dot(&yc)) / noise;

        self.fitted = Some(RidgeFit {
            x_mean,
            y_mean,
            weights,
            covariance,
        });
        Ok(())
    }

    fn predict(&self, x: ArrayView2<f64>) -> Result<Prediction, ModelError> {
        let fit = self.fitted.as_ref().ok_or(ModelError::NotFitted)?;
        if x.ncols() != fit.x_mean.len() {
            return Err(ModelError::FeatureCountMismatch {
                expected: fit.x_mean.len(),
                found: x.ncols(),
            });
        }

        let xc = &x - &fit.x_mean;
        let values = xc.dot(&fit.weights) + fit.y_mean;
        let projected = xc.dot(&fit.covariance);
        let variances = (&projected * &xc).sum_axis(Axis(1));

        Ok(Prediction::new(values, variances))
    }
}

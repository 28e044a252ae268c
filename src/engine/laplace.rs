//! Laplace-approximation engine.
//!
//! Finds the posterior mode of the hierarchical logistic model with Newton
//! iterations (dense `nalgebra` Cholesky with ridge escalation), then draws
//! from the Gaussian N(mode, H⁻¹) with one seeded RNG per chain.
//!
//! Parameter layout: `[β (F) | γ (C) | z (P)]`, where z are the participant
//! random effects.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;
use tracing::debug;

use crate::metrics::logistic as sigmoid;

use super::{
    split_rhat, Diagnostics, EngineError, InferenceData, InferenceEngine, Posterior,
    SamplerSettings, SamplingStrategy,
};

/// Step halvings tried before a line search gives up on a direction.
const MAX_HALVINGS: usize = 30;

/// Ridge escalations after the base ridge.
const RIDGE_STEPS: usize = 4;

/// Per-chain seed offset.
const CHAIN_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone)]
pub struct LaplaceEngine {
    /// Ridge added to the negative Hessian before the first factorization.
    pub base_ridge: f64,
}

impl Default for LaplaceEngine {
    fn default() -> Self {
        Self { base_ridge: 0.0 }
    }
}

impl LaplaceEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InferenceEngine for LaplaceEngine {
    fn name(&self) -> &'static str {
        "laplace"
    }

    fn sample(
        &self,
        data: &InferenceData,
        settings: &SamplerSettings,
        strategy: SamplingStrategy,
    ) -> Result<Posterior, EngineError> {
        data.validate()?;
        if settings.chains == 0 || settings.draws_per_chain == 0 {
            return Err(EngineError::InvalidData("no draws requested".into()));
        }
        let problem = Problem::new(data);
        let (mode, iterations) = self.find_mode(&problem, settings, strategy)?;
        let (hessian, _) = problem.gradient_hessian(&mode);
        let (chol, _) = self.factor(hessian)?;
        let upper = chol.l().transpose();

        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| EngineError::InvalidData(format!("standard normal: {e}")))?;
        let f = data.n_features;
        let c = data.n_controls;
        let dim = problem.dim();
        let total = settings.chains * settings.draws_per_chain;
        let mut beta = DMatrix::<f64>::zeros(total, f);
        let mut gamma = DMatrix::<f64>::zeros(total, c);
        let mut divergences = 0;

        for chain in 0..settings.chains {
            let seed = settings
                .seed
                .wrapping_add((chain as u64).wrapping_mul(CHAIN_SEED_STRIDE));
            let mut rng = StdRng::seed_from_u64(seed);
            for draw in 0..settings.draws_per_chain {
                let eps = DVector::<f64>::from_fn(dim, |_, _| normal.sample(&mut rng));
                let offset = upper
                    .solve_upper_triangular(&eps)
                    .ok_or(EngineError::Singular {
                        ridge: self.base_ridge,
                    })?;
                let theta = &mode + offset;
                if !problem.log_posterior(&theta).is_finite() {
                    divergences += 1;
                }
                let row = chain * settings.draws_per_chain + draw;
                for j in 0..f {
                    beta[(row, j)] = theta[j];
                }
                for k in 0..c {
                    gamma[(row, k)] = theta[f + k];
                }
            }
        }

        let mut rhat = Vec::with_capacity(f + c);
        for (matrix, cols) in [(&beta, f), (&gamma, c)] {
            for col in 0..cols {
                let chains: Vec<Vec<f64>> = (0..settings.chains)
                    .map(|ch| {
                        let start = ch * settings.draws_per_chain;
                        (start..start + settings.draws_per_chain)
                            .map(|row| matrix[(row, col)])
                            .collect()
                    })
                    .collect();
                rhat.push(split_rhat(&chains));
            }
        }

        debug!(
            engine = self.name(),
            ?strategy,
            iterations,
            draws = total,
            divergences,
            "posterior sampled"
        );
        Ok(Posterior {
            beta,
            gamma,
            diagnostics: Diagnostics {
                strategy,
                chains: settings.chains,
                draws_per_chain: settings.draws_per_chain,
                iterations,
                divergences,
                rhat,
            },
        })
    }
}

impl LaplaceEngine {
    fn find_mode(
        &self,
        problem: &Problem<'_>,
        settings: &SamplerSettings,
        strategy: SamplingStrategy,
    ) -> Result<(DVector<f64>, usize), EngineError> {
        let mut theta = DVector::<f64>::zeros(problem.dim());
        let mut lp = problem.log_posterior(&theta);
        if !lp.is_finite() {
            return Err(EngineError::NonFinite(0));
        }
        let mut last_step = f64::INFINITY;

        for iter in 1..=settings.max_iterations {
            let (hessian, gradient) = problem.gradient_hessian(&theta);
            let (chol, _) = self.factor(hessian)?;
            let direction = chol.solve(&gradient);

            let (next, next_lp, scale) = match strategy {
                SamplingStrategy::Newton => {
                    let next = &theta + &direction;
                    let next_lp = problem.log_posterior(&next);
                    if !next_lp.is_finite() {
                        return Err(EngineError::NonFinite(iter));
                    }
                    (next, next_lp, 1.0)
                }
                SamplingStrategy::LineSearch => {
                    let mut scale = 1.0;
                    let mut accepted = None;
                    for _ in 0..MAX_HALVINGS {
                        let candidate = &theta + &direction * scale;
                        let candidate_lp = problem.log_posterior(&candidate);
                        if candidate_lp.is_finite() && candidate_lp >= lp - 1e-12 {
                            accepted = Some((candidate, candidate_lp));
                            break;
                        }
                        scale *= 0.5;
                    }
                    match accepted {
                        Some((next, next_lp)) => (next, next_lp, scale),
                        // No improving step along the Newton direction: at the mode.
                        None => return Ok((theta, iter)),
                    }
                }
            };

            last_step = direction.amax() * scale;
            theta = next;
            lp = next_lp;
            if last_step < settings.tolerance {
                return Ok((theta, iter));
            }
        }

        Err(EngineError::NotConverged {
            iterations: settings.max_iterations,
            last_step,
        })
    }

    /// Cholesky of a symmetric positive-definite matrix, escalating the ridge
    /// until the factorization succeeds.
    fn factor(&self, matrix: DMatrix<f64>) -> Result<(Cholesky<f64, Dyn>, f64), EngineError> {
        let base = self.base_ridge.max(0.0);
        let mut candidates = vec![base];
        let mut ridge = if base > 0.0 { base } else { 1e-9 };
        for _ in 0..RIDGE_STEPS {
            ridge *= 10.0;
            candidates.push(ridge);
        }

        let dim = matrix.nrows();
        for &ridge in &candidates {
            let mut m = matrix.clone();
            if ridge > 0.0 {
                for d in 0..dim {
                    m[(d, d)] += ridge;
                }
            }
            if let Some(chol) = Cholesky::new(m) {
                return Ok((chol, ridge));
            }
        }
        Err(EngineError::Singular {
            ridge: candidates.last().copied().unwrap_or(base),
        })
    }
}

// ---------------------------------------------------------------------
//  Log posterior
// ---------------------------------------------------------------------

struct Problem<'a> {
    /// Row n: [x1 − x2 | c1 − c2 | one-hot participant].
    design: DMatrix<f64>,
    y: &'a [u8],
    /// Diagonal prior precision per parameter.
    precision: DVector<f64>,
}

impl<'a> Problem<'a> {
    fn new(data: &'a InferenceData) -> Self {
        let f = data.n_features;
        let c = data.n_controls;
        let p = data.n_participants;
        let n = data.n_preferences;

        let mut design = DMatrix::<f64>::zeros(n, f + c + p);
        for row in 0..n {
            for j in 0..f {
                design[(row, j)] = data.x1[(row, j)] - data.x2[(row, j)];
            }
            for k in 0..c {
                design[(row, f + k)] = data.control1[(row, k)] - data.control2[(row, k)];
            }
            design[(row, f + c + data.participant[row] - 1)] = 1.0;
        }

        let weight_precision = 1.0 / (data.feature_scale * data.feature_scale);
        let participant_precision = 1.0 / (data.participant_scale * data.participant_scale);
        let precision = DVector::from_fn(f + c + p, |d, _| {
            if d < f + c {
                weight_precision
            } else {
                participant_precision
            }
        });

        Self {
            design,
            y: &data.y,
            precision,
        }
    }

    fn dim(&self) -> usize {
        self.design.ncols()
    }

    fn log_posterior(&self, theta: &DVector<f64>) -> f64 {
        let eta = &self.design * theta;
        let likelihood: f64 = eta
            .iter()
            .zip(self.y)
            .map(|(&e, &y)| f64::from(y) * e - log1p_exp(e))
            .sum();
        let prior: f64 = theta
            .iter()
            .zip(self.precision.iter())
            .map(|(t, prec)| prec * t * t)
            .sum();
        likelihood - 0.5 * prior
    }

    /// Negative Hessian and gradient of the log posterior at `theta`.
    fn gradient_hessian(&self, theta: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
        let eta = &self.design * theta;
        let n = eta.len();
        let mut residual = DVector::<f64>::zeros(n);
        let mut weighted = self.design.clone();
        for row in 0..n {
            let p = sigmoid(eta[row]);
            residual[row] = f64::from(self.y[row]) - p;
            let w = p * (1.0 - p);
            for col in 0..weighted.ncols() {
                weighted[(row, col)] *= w;
            }
        }

        let mut gradient = self.design.transpose() * residual;
        let mut hessian = self.design.transpose() * weighted;
        for d in 0..self.dim() {
            gradient[d] -= self.precision[d] * theta[d];
            hessian[(d, d)] += self.precision[d];
        }
        (hessian, gradient)
    }
}

fn log1p_exp(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

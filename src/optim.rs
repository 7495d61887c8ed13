use anyhow::{ensure, Result};
use ndarray::{Array4, Zip};
use std::collections::VecDeque;

/// Update families.
///
/// Resolved at construction so callers branch on data instead of probing the
/// optimizer type at runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Family {
    /// One gradient evaluation per step, applied in place.
    StatelessStep,
    /// The optimizer drives the loss closure itself, evaluating it as many
    /// times as its line search requires.
    ClosureLineSearch,
}

/// Unknown optimizer id.
#[derive(Debug, thiserror::Error)]
#[error("unknown optimizer {0:?}, expected one of {OPTIMIZERS:?}")]
pub struct UnknownOptimizer(pub String);

/// The optimizer ids accepted by [`Optimizer::build`].
pub const OPTIMIZERS: [&str; 3] = ["SGD", "Adam", "LBFGS"];

/// Optimizer options, typically deserialized from a run config.
///
/// Unset fields use each optimizer's defaults; fields an optimizer does not
/// know are ignored.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerOptions {
    /// Learning rate.
    pub learning_rate: Option<f32>,
    /// Momentum (SGD).
    pub momentum: Option<f32>,
    /// Correction-pair history size (LBFGS).
    pub history_size: Option<usize>,
    /// Line search evaluation limit per step (LBFGS).
    pub max_evaluations: Option<usize>,
}

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`SGD`].
    pub struct SGDBuilder {
        learning_rate: f32,
        momentum: Option<f32>,
    }

    impl SGDBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 0.01,
                momentum: None,
            }
        }
        /// Learning rate. Default is 0.01.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Momentum. Default is 0.
        ///
        /// If `momentum` is greater than 0, a velocity tensor is kept across
        /// steps.
        pub fn momentum(self, momentum: f32) -> Self {
            Self {
                momentum: Some(momentum),
                ..self
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> SGD {
            let Self {
                learning_rate,
                momentum,
            } = self;
            SGD {
                learning_rate,
                momentum,
                velocity: None,
            }
        }
    }

    /// Builder for creating an [`Adam`].
    pub struct AdamBuilder {
        learning_rate: f32,
        betas: [f32; 2],
        epsilon: f32,
    }

    impl AdamBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 1e-3,
                betas: [0.9, 0.999],
                epsilon: 1e-8,
            }
        }
        /// Learning rate. Default is 0.001.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Moment decay rates. Default is `[0.9, 0.999]`.
        pub fn betas(self, betas: [f32; 2]) -> Self {
            Self { betas, ..self }
        }
        /// Builds the optimizer.
        pub fn build(self) -> Adam {
            let Self {
                learning_rate,
                betas,
                epsilon,
            } = self;
            Adam {
                learning_rate,
                betas,
                epsilon,
                step: 0,
                moment1: None,
                moment2: None,
            }
        }
    }

    /// Builder for creating a [`LBFGS`].
    pub struct LBFGSBuilder {
        learning_rate: f32,
        history_size: usize,
        max_evaluations: usize,
    }

    impl LBFGSBuilder {
        pub(super) fn new() -> Self {
            Self {
                learning_rate: 1.,
                history_size: 10,
                max_evaluations: 20,
            }
        }
        /// Scale of the first step, before any curvature history exists.
        /// Default is 1.
        pub fn learning_rate(self, learning_rate: f32) -> Self {
            Self {
                learning_rate,
                ..self
            }
        }
        /// Number of correction pairs kept. Default is 10.
        pub fn history_size(self, history_size: usize) -> Self {
            Self {
                history_size,
                ..self
            }
        }
        /// Line search evaluation limit per step. Default is 20.
        pub fn max_evaluations(self, max_evaluations: usize) -> Self {
            Self {
                max_evaluations,
                ..self
            }
        }
        /// Builds the optimizer.
        pub fn build(self) -> LBFGS {
            let Self {
                learning_rate,
                history_size,
                max_evaluations,
            } = self;
            LBFGS {
                learning_rate,
                history_size,
                max_evaluations,
                s_history: VecDeque::with_capacity(history_size),
                y_history: VecDeque::with_capacity(history_size),
            }
        }
    }
}
use builder::*;

/// Stochastic gradient descent with optional momentum.
#[derive(Debug)]
pub struct SGD {
    learning_rate: f32,
    momentum: Option<f32>,
    velocity: Option<Array4<f32>>,
}

impl SGD {
    /// An SGD builder.
    pub fn builder() -> SGDBuilder {
        SGDBuilder::new()
    }
    /// Applies one update in place.
    pub fn update(&mut self, value: &mut Array4<f32>, grad: &Array4<f32>) {
        if let Some(momentum) = self.momentum {
            let velocity = self
                .velocity
                .get_or_insert_with(|| Array4::zeros(value.raw_dim()));
            let learning_rate = self.learning_rate;
            Zip::from(value)
                .and(grad)
                .and(velocity)
                .for_each(|w, dw, v| sgd_update_with_momentum(w, *dw, learning_rate, momentum, v));
        } else {
            value.scaled_add(-self.learning_rate, grad);
        }
    }
}

fn sgd_update_with_momentum(w: &mut f32, dw: f32, lr: f32, m: f32, v: &mut f32) {
    *v = m * *v + dw;
    *w -= lr * *v;
}

/// Adam (Kingma & Ba 2015).
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    betas: [f32; 2],
    epsilon: f32,
    step: u32,
    moment1: Option<Array4<f32>>,
    moment2: Option<Array4<f32>>,
}

impl Adam {
    /// An Adam builder.
    pub fn builder() -> AdamBuilder {
        AdamBuilder::new()
    }
    /// Applies one bias-corrected update in place.
    pub fn update(&mut self, value: &mut Array4<f32>, grad: &Array4<f32>) {
        let [beta1, beta2] = self.betas;
        self.step += 1;
        let correction1 = 1. - beta1.powi(self.step as i32);
        let correction2 = 1. - beta2.powi(self.step as i32);
        let moment1 = self
            .moment1
            .get_or_insert_with(|| Array4::zeros(value.raw_dim()));
        let moment2 = self
            .moment2
            .get_or_insert_with(|| Array4::zeros(value.raw_dim()));
        let learning_rate = self.learning_rate;
        let epsilon = self.epsilon;
        Zip::from(value)
            .and(grad)
            .and(moment1)
            .and(moment2)
            .for_each(|w, dw, m, v| {
                *m = beta1 * *m + (1. - beta1) * dw;
                *v = beta2 * *v + (1. - beta2) * dw * dw;
                let m_hat = *m / correction1;
                let v_hat = *v / correction2;
                *w -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            });
    }
}

/// The outcome of one [`LBFGS::step`].
#[derive(Clone, Copy, Debug)]
pub struct StepReport {
    /// Loss at the accepted point.
    pub loss: f32,
    /// Closure evaluations performed, at least 1.
    pub evaluations: usize,
}

// Wolfe constants per Nocedal & Wright.
const WOLFE_C1: f32 = 1e-4;
const WOLFE_C2: f32 = 0.9;
const CURVATURE_MIN: f32 = 1e-10;
const STALL_ALPHA: f32 = 1e-12;

/// Limited-memory BFGS with strong-Wolfe line search.
///
/// Unlike [`SGD`] and [`Adam`], a step is driven by a loss-and-gradient
/// closure: the search direction comes from two-loop recursion over the
/// correction-pair history, and the line search evaluates the closure until
/// the Wolfe conditions hold or the evaluation limit is reached.
#[derive(Debug)]
pub struct LBFGS {
    learning_rate: f32,
    history_size: usize,
    max_evaluations: usize,
    s_history: VecDeque<Vec<f32>>,
    y_history: VecDeque<Vec<f32>>,
}

impl LBFGS {
    /// An LBFGS builder.
    pub fn builder() -> LBFGSBuilder {
        LBFGSBuilder::new()
    }
    /// Performs one outer step, moving `value` in place.
    ///
    /// `evaluate` returns the loss and gradient at a candidate point. If the
    /// line search cannot find an acceptable step the value is left unchanged
    /// and the loss at the current point is reported.
    ///
    /// **Errors**
    ///
    /// Returns an error if `evaluate` fails or produces a non-finite loss.
    pub fn step<F>(&mut self, value: &mut Array4<f32>, mut evaluate: F) -> Result<StepReport>
    where
        F: FnMut(&Array4<f32>) -> Result<(f32, Array4<f32>)>,
    {
        let dim = value.raw_dim();
        let (fx, grad) = evaluate(value)?;
        let mut evaluations = 1;
        ensure!(fx.is_finite(), "non-finite loss {fx}");
        let g: Vec<f32> = grad.iter().copied().collect();
        let mut d = self.direction(&g);
        let mut dir_deriv = dot(&g, &d);
        if dir_deriv >= 0. {
            // Stale curvature produced an ascent direction, fall back to
            // steepest descent.
            self.s_history.clear();
            self.y_history.clear();
            d = g.iter().map(|g| -g).collect();
            dir_deriv = dot(&g, &d);
        }
        if dir_deriv == 0. {
            return Ok(StepReport {
                loss: fx,
                evaluations,
            });
        }
        let x0: Vec<f32> = value.iter().copied().collect();
        let mut alpha = if self.s_history.is_empty() {
            let l1: f32 = g.iter().map(|g| g.abs()).sum();
            1f32.min(1. / l1) * self.learning_rate
        } else {
            1.
        };
        let mut alpha_lo = 0f32;
        let mut alpha_hi = f32::INFINITY;
        // Last point satisfying the Armijo condition; used if the curvature
        // condition is never met within the evaluation limit.
        let mut accepted: Option<(f32, f32, Vec<f32>)> = None;
        while evaluations < self.max_evaluations {
            let candidate = offset(&x0, alpha, &d, dim);
            let (fx_new, grad_new) = evaluate(&candidate)?;
            evaluations += 1;
            ensure!(fx_new.is_finite(), "non-finite loss {fx_new}");
            let g_new: Vec<f32> = grad_new.iter().copied().collect();
            let dir_deriv_new = dot(&g_new, &d);
            if fx_new > fx + WOLFE_C1 * alpha * dir_deriv {
                alpha_hi = alpha;
                alpha = (alpha_lo + alpha_hi) / 2.;
                continue;
            }
            accepted = Some((alpha, fx_new, g_new));
            if dir_deriv_new.abs() <= WOLFE_C2 * dir_deriv.abs() {
                break;
            }
            if dir_deriv_new > 0. {
                alpha_hi = alpha;
            } else {
                alpha_lo = alpha;
            }
            alpha = if alpha_hi.is_finite() {
                (alpha_lo + alpha_hi) / 2.
            } else {
                alpha * 2.
            };
        }
        let Some((alpha, fx_new, g_new)) = accepted else {
            tracing::trace!(alpha, "line search stalled");
            return Ok(StepReport {
                loss: fx,
                evaluations,
            });
        };
        if alpha < STALL_ALPHA {
            return Ok(StepReport {
                loss: fx,
                evaluations,
            });
        }
        let x_new: Vec<f32> = x0.iter().zip(&d).map(|(x, d)| x + alpha * d).collect();
        let s: Vec<f32> = x_new.iter().zip(&x0).map(|(a, b)| a - b).collect();
        let y: Vec<f32> = g_new.iter().zip(&g).map(|(a, b)| a - b).collect();
        if dot(&y, &s) > CURVATURE_MIN {
            if self.s_history.len() >= self.history_size {
                self.s_history.pop_front();
                self.y_history.pop_front();
            }
            self.s_history.push_back(s);
            self.y_history.push_back(y);
        }
        if let Some(value) = value.as_slice_mut() {
            value.copy_from_slice(&x_new);
        } else {
            *value = Array4::from_shape_vec(dim, x_new).expect("shape preserved");
        }
        Ok(StepReport {
            loss: fx_new,
            evaluations,
        })
    }
    // Two-loop recursion: approximates -H⁻¹·g from the correction pairs.
    fn direction(&self, g: &[f32]) -> Vec<f32> {
        let k = self.s_history.len();
        let mut q: Vec<f32> = g.iter().map(|g| -g).collect();
        if k == 0 {
            return q;
        }
        let mut alpha = vec![0f32; k];
        let mut rho = vec![0f32; k];
        for i in (0..k).rev() {
            let s = &self.s_history[i];
            let y = &self.y_history[i];
            rho[i] = 1. / dot(y, s);
            alpha[i] = rho[i] * dot(s, &q);
            for (q, y) in q.iter_mut().zip(y) {
                *q -= alpha[i] * y;
            }
        }
        let s_last = &self.s_history[k - 1];
        let y_last = &self.y_history[k - 1];
        let gamma = dot(s_last, y_last) / dot(y_last, y_last);
        for q in q.iter_mut() {
            *q *= gamma;
        }
        for i in 0..k {
            let s = &self.s_history[i];
            let y = &self.y_history[i];
            let beta = rho[i] * dot(y, &q);
            for (q, s) in q.iter_mut().zip(s) {
                *q += s * (alpha[i] - beta);
            }
        }
        q
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

fn offset(x: &[f32], alpha: f32, d: &[f32], dim: ndarray::Ix4) -> Array4<f32> {
    let data: Vec<f32> = x.iter().zip(d).map(|(x, d)| x + alpha * d).collect();
    Array4::from_shape_vec(dim, data).expect("shape preserved")
}

/// The closed optimizer registry.
#[derive(Debug)]
pub enum Optimizer {
    /// See [`SGD`].
    SGD(SGD),
    /// See [`Adam`].
    Adam(Adam),
    /// See [`LBFGS`].
    LBFGS(LBFGS),
}

impl Optimizer {
    /// Builds an optimizer by id with `options`.
    ///
    /// **Errors**
    ///
    /// Fails if `id` is not one of [`OPTIMIZERS`].
    pub fn build(id: &str, options: &OptimizerOptions) -> Result<Self, UnknownOptimizer> {
        match id {
            "SGD" => {
                let mut builder = SGD::builder();
                if let Some(learning_rate) = options.learning_rate {
                    builder = builder.learning_rate(learning_rate);
                }
                if let Some(momentum) = options.momentum {
                    builder = builder.momentum(momentum);
                }
                Ok(Self::SGD(builder.build()))
            }
            "Adam" => {
                let mut builder = Adam::builder();
                if let Some(learning_rate) = options.learning_rate {
                    builder = builder.learning_rate(learning_rate);
                }
                Ok(Self::Adam(builder.build()))
            }
            "LBFGS" => {
                let mut builder = LBFGS::builder();
                if let Some(learning_rate) = options.learning_rate {
                    builder = builder.learning_rate(learning_rate);
                }
                if let Some(history_size) = options.history_size {
                    builder = builder.history_size(history_size);
                }
                if let Some(max_evaluations) = options.max_evaluations {
                    builder = builder.max_evaluations(max_evaluations);
                }
                Ok(Self::LBFGS(builder.build()))
            }
            _ => Err(UnknownOptimizer(id.to_string())),
        }
    }
    /// The update family, fixed at construction.
    pub fn family(&self) -> Family {
        match self {
            Self::SGD(_) | Self::Adam(_) => Family::StatelessStep,
            Self::LBFGS(_) => Family::ClosureLineSearch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(w) = Σ (w - 3)², ∇f = 2(w - 3)
    fn quadratic(value: &Array4<f32>) -> (f32, Array4<f32>) {
        let loss = value.iter().map(|w| (w - 3.) * (w - 3.)).sum();
        (loss, value.mapv(|w| 2. * (w - 3.)))
    }

    #[test]
    fn sgd_reduces_quadratic() {
        let mut optimizer = SGD::builder().learning_rate(0.1).build();
        let mut value = Array4::zeros((1, 1, 2, 2));
        for _ in 0..100 {
            let (_, grad) = quadratic(&value);
            optimizer.update(&mut value, &grad);
        }
        for w in value.iter() {
            assert_relative_eq!(*w, 3.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn sgd_momentum_update() {
        let mut optimizer = SGD::builder().learning_rate(0.1).momentum(0.9).build();
        let mut value = Array4::from_elem((1, 1, 1, 1), 1f32);
        let grad = Array4::from_elem((1, 1, 1, 1), 2f32);
        // v = 0.9·0 + 2, w = 1 - 0.1·2
        optimizer.update(&mut value, &grad);
        assert_relative_eq!(value[(0, 0, 0, 0)], 0.8);
        // v = 0.9·2 + 2 = 3.8, w = 0.8 - 0.38
        optimizer.update(&mut value, &grad);
        assert_relative_eq!(value[(0, 0, 0, 0)], 0.42);
    }

    #[test]
    fn adam_reduces_quadratic() {
        let mut optimizer = Adam::builder().learning_rate(0.1).build();
        let mut value = Array4::zeros((1, 1, 2, 2));
        for _ in 0..500 {
            let (_, grad) = quadratic(&value);
            optimizer.update(&mut value, &grad);
        }
        for w in value.iter() {
            assert_relative_eq!(*w, 3.0, epsilon = 1e-2);
        }
    }

    #[test]
    fn lbfgs_converges_on_quadratic() -> Result<()> {
        let mut optimizer = LBFGS::builder().build();
        let mut value = Array4::zeros((1, 1, 1, 1));
        let mut last = f32::INFINITY;
        for _ in 0..20 {
            let report = optimizer.step(&mut value, |value| Ok(quadratic(value)))?;
            assert!(report.evaluations >= 1);
            assert!(report.loss <= last);
            last = report.loss;
        }
        assert_relative_eq!(value[(0, 0, 0, 0)], 3.0, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn lbfgs_converges_on_rosenbrock() -> Result<()> {
        let mut optimizer = LBFGS::builder().max_evaluations(50).build();
        let mut value = Array4::zeros((1, 1, 1, 2));
        for _ in 0..200 {
            optimizer.step(&mut value, |value| {
                let a = value[(0, 0, 0, 0)];
                let b = value[(0, 0, 0, 1)];
                let loss = (1. - a).powi(2) + 100. * (b - a * a).powi(2);
                let mut grad = Array4::zeros((1, 1, 1, 2));
                grad[(0, 0, 0, 0)] = -2. * (1. - a) - 400. * a * (b - a * a);
                grad[(0, 0, 0, 1)] = 200. * (b - a * a);
                Ok((loss, grad))
            })?;
        }
        assert_relative_eq!(value[(0, 0, 0, 0)], 1.0, epsilon = 1e-2);
        assert_relative_eq!(value[(0, 0, 0, 1)], 1.0, epsilon = 1e-2);
        Ok(())
    }

    #[test]
    fn lbfgs_history_is_capped() -> Result<()> {
        let mut optimizer = LBFGS::builder().history_size(2).build();
        let mut value = Array4::from_elem((1, 1, 1, 3), 10f32);
        for _ in 0..10 {
            optimizer.step(&mut value, |value| Ok(quadratic(value)))?;
        }
        assert!(optimizer.s_history.len() <= 2);
        Ok(())
    }

    #[test]
    fn lbfgs_rejects_non_finite_loss() {
        let mut optimizer = LBFGS::builder().build();
        let mut value = Array4::zeros((1, 1, 1, 1));
        let result = optimizer.step(&mut value, |value| {
            Ok((f32::NAN, Array4::zeros(value.raw_dim())))
        });
        assert!(result.is_err());
    }

    #[test]
    fn registry_families() {
        let options = OptimizerOptions::default();
        for (id, family) in [
            ("SGD", Family::StatelessStep),
            ("Adam", Family::StatelessStep),
            ("LBFGS", Family::ClosureLineSearch),
        ] {
            assert_eq!(Optimizer::build(id, &options).unwrap().family(), family);
        }
        assert!(Optimizer::build("Adagrad", &options).is_err());
    }
}

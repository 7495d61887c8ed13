use crate::autograd::{weighted_sum, ArcTensor0, ArcTensor3, Variable0, Variable3, Variable4};
use anyhow::{ensure, Result};
use ndarray::{arr0, Array1, Array3, ArrayView3, Axis};
use std::str::FromStr;

/// Gram matrix variants.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum GramKind {
    /// `G = F·Fᵀ / (h·w)` per Gatys et al. 2015.
    #[default]
    Gram,
    /// As [`Gram`](Self::Gram), with the features first divided channel-wise
    /// by their standard deviation. Converges noticeably faster on deep
    /// networks where activation magnitudes differ by orders of magnitude
    /// between layers.
    NormalizedGram,
}

/// Unknown gram kind id.
#[derive(Debug, thiserror::Error)]
#[error("unknown gram kind {0:?}, expected one of {GRAM_KINDS:?}")]
pub struct UnknownGramKind(pub String);

/// The gram kind ids accepted by [`GramKind::from_str`].
pub const GRAM_KINDS: [&str; 2] = ["GramMatrix", "NormalizedGramMatrix"];

impl FromStr for GramKind {
    type Err = UnknownGramKind;
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "GramMatrix" => Ok(Self::Gram),
            "NormalizedGramMatrix" => Ok(Self::NormalizedGram),
            _ => Err(UnknownGramKind(input.to_string())),
        }
    }
}

impl std::fmt::Display for GramKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gram => f.write_str("GramMatrix"),
            Self::NormalizedGram => f.write_str("NormalizedGramMatrix"),
        }
    }
}

/// Batched Gram matrix of a `[b, c, h, w]` activation, shape `[b, c, c]`.
///
/// The backward pass treats the stddev of [`GramKind::NormalizedGram`] as a
/// constant scale rather than differentiating through the statistic.
pub fn gram(input: &Variable4, kind: GramKind) -> Variable3 {
    let (b, c, h, w) = input.dim();
    let hw = h * w;
    let mut f = input
        .value()
        .to_owned()
        .into_shape((b, c, hw))
        .expect("contiguous activation");
    let sigma = match kind {
        GramKind::Gram => None,
        GramKind::NormalizedGram => {
            let sigma = channel_stddev_host(f.view());
            f /= &sigma.view().into_shape((1, c, 1)).expect("channel stddev");
            Some(sigma)
        }
    };
    let value = gram_host(f.view());
    let mut builder = Variable3::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad: ArcTensor3| {
            let mut input_grad = gram_backward_host(output_grad.view(), f.view());
            if let Some(sigma) = sigma {
                input_grad /= &sigma.into_shape((1, c, 1)).expect("channel stddev");
            }
            Ok(input_grad
                .into_shape((b, c, h, w))
                .expect("contiguous gradient")
                .into_shared())
        });
    }
    builder.build(value.into_shared())
}

/// Mean squared error against a constant target.
///
/// **Errors**
///
/// Returns an error if the shapes differ.
pub fn mse(input: &Variable3, target: &ArcTensor3) -> Result<Variable0> {
    ensure!(
        input.shape() == target.shape(),
        "mse: input shape {:?} != target shape {:?}",
        input.shape(),
        target.shape(),
    );
    let diff = input.value().to_owned() - target;
    let n = diff.len().max(1) as f32;
    let value = diff.iter().map(|x| x * x).sum::<f32>() / n;
    let mut builder = Variable0::builder();
    if let Some(node) = input.node() {
        builder.edge(node, move |output_grad: ArcTensor0| {
            let scale = 2. * output_grad[()] / n;
            Ok(diff.mapv(|x| scale * x).into_shared())
        });
    }
    Ok(builder.build(arr0(value).into_shared()))
}

/// Per-layer style losses: MSE of each activation's Gram matrix against the
/// corresponding precomputed target.
///
/// **Errors**
///
/// Returns an error if the counts differ or any activation does not match its
/// target's channel count.
pub fn style_loss(
    activations: &[Variable4],
    targets: &[ArcTensor3],
    kind: GramKind,
) -> Result<Vec<Variable0>> {
    ensure!(
        activations.len() == targets.len(),
        "style_loss: {} activation(s) for {} target(s)",
        activations.len(),
        targets.len(),
    );
    activations
        .iter()
        .zip(targets)
        .map(|(activation, target)| mse(&gram(activation, kind), target))
        .collect()
}

/// Invalid loss arguments, rejected at construction.
#[derive(Debug, thiserror::Error)]
pub enum LossError {
    /// Content losses are not implemented.
    #[error("content losses are not implemented")]
    ContentUnimplemented,
    /// Some but not all of targets / weights / gram kind were provided.
    #[error("if providing any style arguments, you must provide all style arguments")]
    IncompleteStyle,
    /// Weight and target counts differ.
    #[error("{weights} style weight(s) for {targets} style target(s)")]
    WeightCountMismatch {
        /// Provided weights.
        weights: usize,
        /// Provided targets.
        targets: usize,
    },
    /// Alpha outside `[0, 1]`.
    #[error("alpha {0} out of range, expected 0..=1")]
    AlphaOutOfRange(f32),
}

/// Builders.
pub mod builder {
    use super::*;

    /// NstLossBuilder.
    #[derive(Default)]
    pub struct NstLossBuilder {
        pub(super) style_targets: Option<Vec<ArcTensor3>>,
        pub(super) style_weights: Option<Vec<f32>>,
        pub(super) style_gram: Option<GramKind>,
        pub(super) content: bool,
        pub(super) alpha: Option<f32>,
    }

    impl NstLossBuilder {
        /// Precomputed target Gram matrices, one per selected layer.
        pub fn style_targets(self, style_targets: Vec<ArcTensor3>) -> Self {
            Self {
                style_targets: Some(style_targets),
                ..self
            }
        }
        /// Positional per-layer weights.
        pub fn style_weights(self, style_weights: Vec<f32>) -> Self {
            Self {
                style_weights: Some(style_weights),
                ..self
            }
        }
        /// The Gram matrix variant, shared by targets and evaluation.
        pub fn style_gram(self, style_gram: GramKind) -> Self {
            Self {
                style_gram: Some(style_gram),
                ..self
            }
        }
        /// Content arguments. Accepted for interface completeness; `build`
        /// rejects them as unimplemented.
        pub fn content_targets(self, _content_targets: Vec<ArcTensor3>) -> Self {
            Self {
                content: true,
                ..self
            }
        }
        /// See [`content_targets`](Self::content_targets).
        pub fn content_weights(self, _content_weights: Vec<f32>) -> Self {
            Self {
                content: true,
                ..self
            }
        }
        /// Blend factor: `alpha · content + (1 - alpha) · style`.
        pub fn alpha(self, alpha: f32) -> Self {
            Self {
                alpha: Some(alpha),
                ..self
            }
        }
        /// Builds the loss.
        ///
        /// **Errors**
        ///
        /// See [`LossError`].
        pub fn build(self) -> Result<NstLoss, LossError> {
            if self.content {
                return Err(LossError::ContentUnimplemented);
            }
            let any_style = self.style_targets.is_some()
                || self.style_weights.is_some()
                || self.style_gram.is_some();
            let all_style = self.style_targets.is_some()
                && self.style_weights.is_some()
                && self.style_gram.is_some();
            if any_style && !all_style {
                return Err(LossError::IncompleteStyle);
            }
            let style_targets = self.style_targets.unwrap_or_default();
            let style_weights = self.style_weights.unwrap_or_default();
            let style_gram = self.style_gram.unwrap_or_default();
            if style_weights.len() != style_targets.len() {
                return Err(LossError::WeightCountMismatch {
                    weights: style_weights.len(),
                    targets: style_targets.len(),
                });
            }
            if let Some(alpha) = self.alpha {
                if !(0. ..=1.).contains(&alpha) {
                    return Err(LossError::AlphaOutOfRange(alpha));
                }
            }
            Ok(NstLoss {
                style_targets,
                style_weights,
                style_gram,
                alpha: self.alpha,
            })
        }
    }
}
use builder::NstLossBuilder;

/// Neural style transfer loss.
///
/// Holds the target Gram matrices so they are computed once per run, not per
/// evaluation. Content terms are part of the interface but unimplemented;
/// with `alpha` set the content contribution is therefore zero and the style
/// sum is scaled by `1 - alpha`.
#[derive(Debug)]
pub struct NstLoss {
    style_targets: Vec<ArcTensor3>,
    style_weights: Vec<f32>,
    style_gram: GramKind,
    alpha: Option<f32>,
}

impl NstLoss {
    /// An [`NstLossBuilder`].
    pub fn builder() -> NstLossBuilder {
        NstLossBuilder::default()
    }
    /// The Gram matrix variant.
    pub fn style_gram(&self) -> GramKind {
        self.style_gram
    }
    /// The number of style terms.
    pub fn style_len(&self) -> usize {
        self.style_targets.len()
    }
    /// Evaluates the weighted loss of the generated activations.
    ///
    /// An empty slice against an empty target list yields a constant zero.
    ///
    /// **Errors**
    ///
    /// Returns an error if the activation count or shapes do not match the
    /// targets.
    pub fn eval(&self, style_activations: &[Variable4]) -> Result<Variable0> {
        let losses = style_loss(style_activations, &self.style_targets, self.style_gram)?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            let per_layer: Vec<f32> = losses.iter().map(Variable0::item).collect();
            tracing::debug!(?per_layer, "style losses");
        }
        let terms: Vec<(f32, Variable0)> =
            self.style_weights.iter().copied().zip(losses).collect();
        let style = weighted_sum(&terms);
        match self.alpha {
            Some(alpha) => Ok(style.scale(1. - alpha)),
            None => Ok(style),
        }
    }
}

fn channel_stddev_host(f: ArrayView3<f32>) -> Array1<f32> {
    let (b, c, hw) = f.dim();
    let n = (b * hw) as f32;
    let mut sigma = Array1::zeros(c);
    for (ci, sigma) in sigma.iter_mut().enumerate() {
        let lane = f.index_axis(Axis(1), ci);
        let mean = lane.sum() / n;
        let ss: f32 = lane.iter().map(|x| (x - mean) * (x - mean)).sum();
        // unbiased, matching torch.std
        let var = if n > 1. { ss / (n - 1.) } else { 0. };
        *sigma = var.sqrt() + 1e-15;
    }
    sigma
}

fn gram_host(f: ArrayView3<f32>) -> Array3<f32> {
    let (b, c, hw) = f.dim();
    let scale = 1. / hw.max(1) as f32;
    let mut g = Array3::zeros((b, c, c));
    for (f, mut g) in f.axis_iter(Axis(0)).zip(g.axis_iter_mut(Axis(0))) {
        g.assign(&f.dot(&f.t()));
        g *= scale;
    }
    g
}

// dL/dF = (dG + dGᵀ)·F / (h·w)
fn gram_backward_host(dg: ArrayView3<f32>, f: ArrayView3<f32>) -> Array3<f32> {
    let (b, c, hw) = f.dim();
    let scale = 1. / hw.max(1) as f32;
    let mut df = Array3::zeros((b, c, hw));
    for ((dg, f), mut df) in dg
        .axis_iter(Axis(0))
        .zip(f.axis_iter(Axis(0)))
        .zip(df.axis_iter_mut(Axis(0)))
    {
        let sym = &dg + &dg.t();
        df.assign(&sym.dot(&f));
        df *= scale;
    }
    df
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Variable;
    use approx::assert_relative_eq;
    use ndarray::{Array3, Array4};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn random_activation(rng: &mut StdRng, dim: (usize, usize, usize, usize)) -> Array4<f32> {
        let len = dim.0 * dim.1 * dim.2 * dim.3;
        let data = (0..len).map(|_| rng.gen_range(-1f32..1.)).collect();
        Array4::from_shape_vec(dim, data).unwrap()
    }

    fn random_target(rng: &mut StdRng, dim: (usize, usize, usize, usize)) -> ArcTensor3 {
        let (b, c, h, w) = dim;
        gram_host(
            random_activation(rng, dim)
                .into_shape((b, c, h * w))
                .unwrap()
                .view(),
        )
        .into_shared()
    }

    #[test]
    fn gram_kind_registry_round_trips() {
        for id in GRAM_KINDS {
            assert_eq!(GramKind::from_str(id).unwrap().to_string(), id);
        }
        assert!(GramKind::from_str("CovarianceMatrix").is_err());
    }

    #[test]
    fn gram_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = Variable::from(random_activation(&mut rng, (2, 3, 4, 5)));
        for kind in [GramKind::Gram, GramKind::NormalizedGram] {
            let g = gram(&x, kind);
            assert_eq!(g.shape(), [2, 3, 3]);
            let g = g.value();
            for b in 0..2 {
                for i in 0..3 {
                    for j in 0..3 {
                        assert_relative_eq!(g[(b, i, j)], g[(b, j, i)]);
                    }
                }
            }
        }
    }

    #[test]
    fn normalized_gram_is_scale_invariant() {
        let mut rng = StdRng::seed_from_u64(1);
        let x = random_activation(&mut rng, (1, 3, 4, 4));
        let g1 = gram(&Variable::from(x.clone()), GramKind::NormalizedGram);
        let g2 = gram(&Variable::from(x * 10.), GramKind::NormalizedGram);
        for (a, b) in g1.value().iter().zip(g2.value().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-4);
        }
    }

    #[test]
    fn mse_zero_iff_equal() {
        let mut rng = StdRng::seed_from_u64(2);
        let x = Variable::from(random_activation(&mut rng, (1, 2, 3, 3)));
        let g = gram(&x, GramKind::Gram);
        let target = g.value().clone();
        assert_relative_eq!(mse(&g, &target).unwrap().item(), 0.0);
        let shifted = target.mapv(|x| x + 1.).into_shared();
        assert!(mse(&g, &shifted).unwrap().item() > 0.);
    }

    #[test]
    fn mse_shape_mismatch_rejected() {
        let g = gram(
            &Variable::from(Array4::<f32>::zeros((1, 2, 2, 2))),
            GramKind::Gram,
        );
        let target = Array3::<f32>::zeros((1, 3, 3)).into_shared();
        assert!(mse(&g, &target).is_err());
    }

    // Central difference against the backward pass through gram + mse.
    #[test]
    fn gram_mse_gradient() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut x = random_activation(&mut rng, (1, 2, 3, 3));
        let target = random_target(&mut rng, (1, 2, 3, 3));
        let loss_at = |x: &Array4<f32>| {
            mse(&gram(&Variable::from(x.clone()), GramKind::Gram), &target)
                .unwrap()
                .item()
        };
        let input = Variable::with_grad(x.clone().into_shared());
        let loss = mse(&gram(&input, GramKind::Gram), &target).unwrap();
        loss.backward().unwrap();
        let analytic = input.grad().unwrap();
        let epsilon = 1e-2;
        for index in [(0, 0, 0, 0), (0, 1, 2, 1)] {
            let x0 = x[index];
            x[index] = x0 + epsilon;
            let up = loss_at(&x);
            x[index] = x0 - epsilon;
            let down = loss_at(&x);
            x[index] = x0;
            let numeric = (up - down) / (2. * epsilon);
            assert_relative_eq!(analytic[index], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn incomplete_style_arguments_rejected() {
        let result = NstLoss::builder()
            .style_targets(vec![Array3::zeros((1, 2, 2)).into_shared()])
            .build();
        assert!(matches!(result, Err(LossError::IncompleteStyle)));
    }

    #[test]
    fn weight_count_mismatch_rejected() {
        let result = NstLoss::builder()
            .style_targets(vec![Array3::zeros((1, 2, 2)).into_shared()])
            .style_weights(vec![1., 1.])
            .style_gram(GramKind::Gram)
            .build();
        assert!(matches!(
            result,
            Err(LossError::WeightCountMismatch {
                weights: 2,
                targets: 1,
            })
        ));
    }

    #[test]
    fn content_arguments_rejected() {
        let result = NstLoss::builder().content_weights(vec![1.]).build();
        assert!(matches!(result, Err(LossError::ContentUnimplemented)));
    }

    #[test]
    fn alpha_out_of_range_rejected() {
        let result = NstLoss::builder().alpha(1.5).build();
        assert!(matches!(result, Err(LossError::AlphaOutOfRange(_))));
    }

    fn fixed_activations() -> Vec<Variable4> {
        let mut rng = StdRng::seed_from_u64(4);
        (0..2)
            .map(|_| Variable::from(random_activation(&mut rng, (1, 2, 3, 3))))
            .collect()
    }

    fn fixed_targets() -> Vec<ArcTensor3> {
        let mut rng = StdRng::seed_from_u64(5);
        (0..2)
            .map(|_| random_target(&mut rng, (1, 2, 3, 3)))
            .collect()
    }

    fn build_loss(weights: Vec<f32>, alpha: Option<f32>) -> NstLoss {
        let mut builder = NstLoss::builder()
            .style_targets(fixed_targets())
            .style_weights(weights)
            .style_gram(GramKind::Gram);
        if let Some(alpha) = alpha {
            builder = builder.alpha(alpha);
        }
        builder.build().unwrap()
    }

    // Doubling one weight adds exactly that term's value again.
    #[test]
    fn aggregation_is_linear_in_weights() {
        let activations = fixed_activations();
        let base = build_loss(vec![1., 1.], None)
            .eval(&activations)
            .unwrap()
            .item();
        let doubled = build_loss(vec![2., 1.], None)
            .eval(&activations)
            .unwrap()
            .item();
        let first = style_loss(&activations, &fixed_targets(), GramKind::Gram).unwrap()[0].item();
        assert_relative_eq!(doubled - base, first, epsilon = 1e-5);
    }

    #[test]
    fn alpha_scales_style_sum() {
        let activations = fixed_activations();
        let total = build_loss(vec![1., 1.], None)
            .eval(&activations)
            .unwrap()
            .item();
        let blended = build_loss(vec![1., 1.], Some(0.25))
            .eval(&activations)
            .unwrap()
            .item();
        assert_relative_eq!(blended, 0.75 * total, epsilon = 1e-5);
        let zeroed = build_loss(vec![1., 1.], Some(1.0))
            .eval(&activations)
            .unwrap()
            .item();
        assert_relative_eq!(zeroed, 0.0);
    }

    #[test]
    fn empty_loss_is_zero() {
        let loss = NstLoss::builder().build().unwrap();
        assert_eq!(loss.eval(&[]).unwrap().item(), 0.0);
    }
}

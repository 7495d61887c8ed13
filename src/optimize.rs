use crate::{
    autograd::Variable,
    extract::FeatureExtractor,
    loss::NstLoss,
    optim::Optimizer,
};
use anyhow::Result;
use ndarray::Array4;

/// Summary of a finished optimization.
#[derive(Clone, Copy, Debug)]
pub struct Report {
    /// Outer steps performed.
    pub epochs: usize,
    /// Loss evaluations performed. Equal to `epochs` for stateless-step
    /// optimizers; at least `epochs` when a line search drives the closure.
    pub evaluations: usize,
    /// Loss at the last accepted point.
    pub final_loss: f32,
}

/// Optimizes `image` against `loss` for `epochs` outer steps.
///
/// Each evaluation wraps the current pixels in a fresh leaf variable, so the
/// gradient starts from zero, then runs forward, loss and backward. How often
/// that happens per epoch depends on the optimizer's
/// [`Family`](crate::optim::Family): stateless-step optimizers evaluate once
/// and apply the update; [`LBFGS`](crate::optim::LBFGS) receives the
/// evaluation closure and drives it through its line search.
///
/// **Errors**
///
/// Returns an error if a forward pass, loss evaluation, or backward pass
/// fails.
pub fn optimize(
    extractor: &FeatureExtractor,
    loss: &NstLoss,
    mut image: Array4<f32>,
    optimizer: &mut Optimizer,
    epochs: usize,
) -> Result<(Array4<f32>, Report)> {
    let mut evaluations = 0;
    let mut final_loss = 0f32;
    let mut evaluate = |candidate: &Array4<f32>| -> Result<(f32, Array4<f32>)> {
        let input = Variable::with_grad(candidate.clone().into_shared());
        let activations = extractor.extract(&input)?;
        let total = loss.eval(&activations)?;
        total.backward()?;
        let grad = input
            .grad()
            .map(|grad| grad.to_owned())
            .unwrap_or_else(|| Array4::zeros(candidate.raw_dim()));
        Ok((total.item(), grad))
    };
    for epoch in 0..epochs {
        match optimizer {
            Optimizer::SGD(sgd) => {
                let (loss_value, grad) = evaluate(&image)?;
                evaluations += 1;
                sgd.update(&mut image, &grad);
                final_loss = loss_value;
            }
            Optimizer::Adam(adam) => {
                let (loss_value, grad) = evaluate(&image)?;
                evaluations += 1;
                adam.update(&mut image, &grad);
                final_loss = loss_value;
            }
            Optimizer::LBFGS(lbfgs) => {
                let report = lbfgs.step(&mut image, &mut evaluate)?;
                evaluations += report.evaluations;
                final_loss = report.loss;
            }
        }
        tracing::debug!(epoch, loss = final_loss, "epoch complete");
    }
    tracing::info!(epochs, evaluations, final_loss, "optimization finished");
    Ok((
        image,
        Report {
            epochs,
            evaluations,
            final_loss,
        },
    ))
}

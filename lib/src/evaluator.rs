//! Loss and gradient evaluation for the optimizer.
//!
//! The optimizer always asks for the loss at a point and then for the
//! gradient at that same point. Both come out of a single forward and
//! backward pass, so the evaluator computes them together and hands the
//! gradient out on the second call.

use crate::{
    codec::ImageTensor,
    lbfgs::Objective,
    loss::{total_loss, LossWeights, StyleNorm},
    vgg::{BatchSlot, FeatureExtractor},
    Error,
};
use burn::tensor::{backend::AutodiffBackend, ElementConversion, Tensor};

enum EvalState {
    Ready,
    LossComputed { loss: f64, grads: Vec<f64> },
}

pub struct Evaluator<'a, B: AutodiffBackend> {
    extractor: &'a dyn FeatureExtractor<B>,
    content: Tensor<B, 4>,
    style: Tensor<B, 4>,
    size: u32,
    feature_layers: Vec<String>,
    content_layer: String,
    /// Everything the extractor is asked for: the feature layers plus the
    /// content layer
    requested: Vec<String>,
    weights: LossWeights,
    norm: StyleNorm,
    device: B::Device,
    evaluations: usize,
    state: EvalState,
}

impl<'a, B: AutodiffBackend> Evaluator<'a, B> {
    /// Creates an evaluator for a fixed content and style image. Both must be
    /// at the same working size, and every layer must be known to the
    /// extractor.
    pub fn new(
        extractor: &'a dyn FeatureExtractor<B>,
        content: &ImageTensor,
        style: &ImageTensor,
        feature_layers: Vec<String>,
        content_layer: String,
        weights: LossWeights,
        device: &B::Device,
    ) -> Result<Self, Error> {
        if content.size() != style.size() {
            return Err(Error::ShapeMismatch {
                expected: content.as_slice().len(),
                actual: style.as_slice().len(),
            });
        }

        if let Some(unknown) = feature_layers
            .iter()
            .chain(std::iter::once(&content_layer))
            .find(|layer| !extractor.has_layer(layer))
        {
            return Err(Error::UnknownLayer(unknown.clone()));
        }

        let mut requested = feature_layers.clone();
        if !requested.contains(&content_layer) {
            requested.push(content_layer.clone());
        }

        Ok(Self {
            extractor,
            content: content.to_tensor::<B>(device),
            style: style.to_tensor::<B>(device),
            size: content.size(),
            feature_layers,
            content_layer,
            requested,
            weights,
            norm: StyleNorm::for_image(content.size()),
            device: device.clone(),
            evaluations: 0,
            state: EvalState::Ready,
        })
    }

    /// Number of forward/backward passes run so far
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// True unless a loss has been computed whose gradient wasn't read yet
    pub fn is_ready(&self) -> bool {
        matches!(self.state, EvalState::Ready)
    }

    /// The loss whose gradient is waiting to be read, if any
    pub fn pending_loss(&self) -> Option<f64> {
        match self.state {
            EvalState::Ready => None,
            EvalState::LossComputed { loss, .. } => Some(loss),
        }
    }

    fn evaluate(&self, x: &[f64]) -> Result<(f64, Vec<f64>), Error> {
        let combination = ImageTensor::from_flat(x, self.size)?
            .to_tensor::<B>(&self.device)
            .require_grad();

        let batch = Tensor::cat(
            vec![
                self.content.clone(),
                self.style.clone(),
                combination.clone(),
            ],
            0,
        );

        let activations = self.extractor.extract(batch, &self.requested);
        let components = total_loss(
            &activations,
            combination.clone(),
            &self.feature_layers,
            &self.weights,
            self.norm,
        )?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let content: f64 = components.content.clone().into_scalar().elem();
            let style: f64 = components.style.clone().into_scalar().elem();
            let total_variation: f64 = components.total_variation.clone().into_scalar().elem();
            let content_layer_mean: f64 = activations
                .slot(&self.content_layer, BatchSlot::Combination)?
                .mean()
                .into_scalar()
                .elem();

            tracing::debug!(
                content,
                style,
                total_variation,
                content_layer = %self.content_layer,
                content_layer_mean,
                "loss terms"
            );
        }

        let total = components.total();
        let loss: f64 = total.clone().into_scalar().elem();

        let gradients = total.backward();
        let grads = combination
            .grad(&gradients)
            .ok_or_else(|| Error::TensorData("the combination image has no gradient".to_owned()))?
            .into_data()
            .to_vec::<f32>()?
            .into_iter()
            .map(f64::from)
            .collect();

        Ok((loss, grads))
    }
}

impl<B: AutodiffBackend> Objective for Evaluator<'_, B> {
    /// Runs one forward and backward pass at `x` and returns the loss.
    ///
    /// # Panics
    ///
    /// If the gradient of the previous evaluation was never read.
    fn loss(&mut self, x: &[f64]) -> Result<f64, Error> {
        assert!(
            self.is_ready(),
            "loss requested again before the gradient of the last evaluation was read"
        );

        let (loss, grads) = self.evaluate(x)?;
        self.evaluations += 1;
        self.state = EvalState::LossComputed { loss, grads };

        Ok(loss)
    }

    /// Returns the gradient computed by the preceding `loss` call. `x` is
    /// ignored, the gradient always belongs to the last point passed to
    /// `loss`.
    ///
    /// # Panics
    ///
    /// If `loss` wasn't called first.
    fn grads(&mut self, _x: &[f64]) -> Result<Vec<f64>, Error> {
        match std::mem::replace(&mut self.state, EvalState::Ready) {
            EvalState::LossComputed { grads, .. } => Ok(grads),
            EvalState::Ready => panic!("gradient requested before the loss was computed"),
        }
    }
}

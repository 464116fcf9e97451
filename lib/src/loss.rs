//! Assembles the scalar style transfer loss from named activations.
//!
//! Every function here is written in terms of tensor ops so the loss stays
//! differentiable with respect to the combination image.

use crate::{
    codec::CHANNELS,
    vgg::{Activations, BatchSlot},
    Error,
};
use burn::tensor::{backend::Backend, Tensor};

/// Keeps the content ratio finite where the content features are zero
pub const CONTENT_EPSILON: f64 = 1e-4;

/// Exponent applied to the summed squared neighbor differences
pub const TOTAL_VARIATION_EXPONENT: f64 = 1.25;

/// Weights of the individual loss terms
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossWeights {
    pub content_weight: f64,
    pub style_weight: f64,
    pub total_variation_weight: f64,
    /// Scales the accumulated style loss once, after the per layer weights
    pub gamma: f64,
    /// Lower clamp bound of the style/content feature ratio
    pub g_min: f64,
    /// Upper clamp bound of the style/content feature ratio
    pub g_max: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            content_weight: 0.5,
            style_weight: 0.5,
            total_variation_weight: 1e-5,
            gamma: 100.0,
            g_min: 0.7,
            g_max: 5.0,
        }
    }
}

/// Normalization of the Gram matrix difference: `4 * channels^2 * size^2`,
/// where `channels` is the image channel count and `size` the area of the
/// working resolution.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StyleNorm {
    channels: usize,
    size: usize,
}

impl StyleNorm {
    pub fn for_image(size: u32) -> Self {
        Self {
            channels: CHANNELS,
            size: size as usize * size as usize,
        }
    }

    pub fn denominator(&self) -> f64 {
        let channels = self.channels as f64;
        let size = self.size as f64;
        4.0 * channels * channels * size * size
    }
}

/// The weighted terms of the total loss
#[derive(Debug)]
pub struct LossComponents<B: Backend> {
    /// Weighted content loss, summed over the feature layers
    pub content: Tensor<B, 1>,
    /// Style loss after the per layer weights and gamma
    pub style: Tensor<B, 1>,
    /// Weighted total variation loss
    pub total_variation: Tensor<B, 1>,
}

impl<B: Backend> LossComponents<B> {
    pub fn total(&self) -> Tensor<B, 1> {
        self.content.clone() + self.style.clone() + self.total_variation.clone()
    }
}

fn square<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().mul(x)
}

/// Flattens the spatial dimensions of a `(channels, height, width)` feature
/// map and multiplies the result with its own transpose.
pub fn gram_matrix<B: Backend>(features: Tensor<B, 3>) -> Tensor<B, 2> {
    let [channels, height, width] = features.dims();
    let flat = features.reshape([channels, height * width]);
    flat.clone().matmul(flat.transpose())
}

pub fn style_loss<B: Backend>(
    style: Tensor<B, 3>,
    combination: Tensor<B, 3>,
    norm: StyleNorm,
) -> Tensor<B, 1> {
    let s = gram_matrix(style);
    let c = gram_matrix(combination);
    square(s - c).sum().div_scalar(norm.denominator())
}

/// Distance between the combination features and the content features
/// rescaled by the clamped style/content ratio:
///
/// ```text
/// G  = clamp(style / (base + 1e-4), g_min, g_max)
/// Fm = base * G
/// loss = sum((combination - Fm)^2)
/// ```
pub fn content_loss<B: Backend>(
    base: Tensor<B, 3>,
    style: Tensor<B, 3>,
    combination: Tensor<B, 3>,
    g_min: f64,
    g_max: f64,
) -> Tensor<B, 1> {
    let ratio = style
        .div(base.clone().add_scalar(CONTENT_EPSILON))
        .clamp(g_min, g_max);
    let target = base.mul(ratio);
    square(combination - target).sum()
}

/// Smoothness penalty of a `(1, channels, height, width)` image:
/// `sum((a + b)^1.25)` with `a` and `b` the squared differences to the pixel
/// below and to the right. Neighbors past the image edge contribute nothing.
pub fn total_variation_loss<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 1> {
    let [batch, channels, height, width] = x.dims();
    let device = x.device();

    let vertical = square(
        x.clone().slice([0..batch, 0..channels, 0..height - 1, 0..width])
            - x.clone().slice([0..batch, 0..channels, 1..height, 0..width]),
    );
    let vertical = Tensor::cat(
        vec![vertical, Tensor::zeros([batch, channels, 1, width], &device)],
        2,
    );

    let horizontal = square(
        x.clone().slice([0..batch, 0..channels, 0..height, 0..width - 1])
            - x.slice([0..batch, 0..channels, 0..height, 1..width]),
    );
    let horizontal = Tensor::cat(
        vec![horizontal, Tensor::zeros([batch, channels, height, 1], &device)],
        3,
    );

    (vertical + horizontal)
        .powf_scalar(TOTAL_VARIATION_EXPONENT)
        .sum()
}

/// Combines the three terms into the loss the optimizer minimizes.
///
/// The content term is added per layer. The style term is accumulated over
/// the layers with weight `style_weight / layers.len()` and then scaled by
/// `gamma` as a whole.
pub fn total_loss<B: Backend>(
    activations: &Activations<B>,
    combination: Tensor<B, 4>,
    layers: &[String],
    weights: &LossWeights,
    norm: StyleNorm,
) -> Result<LossComponents<B>, Error> {
    let device = combination.device();

    let mut content = Tensor::<B, 1>::zeros([1], &device);
    for layer in layers {
        let base = activations.slot(layer, BatchSlot::Content)?;
        let style = activations.slot(layer, BatchSlot::Style)?;
        let comb = activations.slot(layer, BatchSlot::Combination)?;

        content = content
            + content_loss(base, style, comb, weights.g_min, weights.g_max)
                .mul_scalar(weights.content_weight);
    }

    let layer_weight = weights.style_weight / layers.len() as f64;
    let mut style = Tensor::<B, 1>::zeros([1], &device);
    for layer in layers {
        let style_features = activations.slot(layer, BatchSlot::Style)?;
        let comb = activations.slot(layer, BatchSlot::Combination)?;

        style = style + style_loss(style_features, comb, norm).mul_scalar(layer_weight);
    }
    let style = style.mul_scalar(weights.gamma);

    let total_variation =
        total_variation_loss(combination).mul_scalar(weights.total_variation_weight);

    Ok(LossComponents {
        content,
        style,
        total_variation,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use burn::{
        backend::NdArray,
        tensor::{Distribution, TensorData},
    };

    type B = NdArray<f32>;

    fn scalar(t: Tensor<B, 1>) -> f32 {
        t.into_scalar()
    }

    fn random3(dims: [usize; 3]) -> Tensor<B, 3> {
        Tensor::random(dims, Distribution::Uniform(0.0, 4.0), &Default::default())
    }

    #[test]
    fn gram_matrix_is_symmetric() {
        let gram = gram_matrix(random3([5, 4, 3]));
        assert_eq!(gram.dims(), [5, 5]);

        let values = gram.into_data().to_vec::<f32>().unwrap();
        for i in 0..5 {
            for j in 0..5 {
                approx::assert_relative_eq!(
                    values[i * 5 + j],
                    values[j * 5 + i],
                    max_relative = 1e-5
                );
            }
        }
    }

    #[test]
    fn gram_matrix_values() {
        let device = Default::default();
        // two channels of a 1x2 map: [1, 2] and [3, 4]
        let features = Tensor::<B, 3>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [2, 1, 2]),
            &device,
        );

        let values = gram_matrix(features).into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![5.0, 11.0, 11.0, 25.0]);
    }

    #[test]
    fn identical_style_has_zero_loss() {
        let features = random3([8, 6, 6]);
        let loss = style_loss(features.clone(), features, StyleNorm::for_image(32));
        approx::assert_relative_eq!(scalar(loss), 0.0);
    }

    #[test]
    fn style_loss_is_normalized() {
        let device = Default::default();
        let ones = Tensor::<B, 3>::ones([1, 1, 2], &device);
        let zeros = Tensor::<B, 3>::zeros([1, 1, 2], &device);

        // gram of ones is [[2]], so the squared difference is 4
        let norm = StyleNorm::for_image(2);
        approx::assert_relative_eq!(norm.denominator(), 4.0 * 9.0 * 16.0);

        let loss = scalar(style_loss(ones, zeros, norm));
        approx::assert_relative_eq!(loss, (4.0 / 576.0) as f32, max_relative = 1e-6);
    }

    #[test]
    fn content_loss_is_non_negative() {
        for _ in 0..5 {
            let loss = content_loss(
                random3([4, 3, 3]),
                random3([4, 3, 3]),
                random3([4, 3, 3]),
                0.7,
                5.0,
            );
            assert!(scalar(loss) >= 0.0);
        }
    }

    #[test]
    fn equal_clamp_bounds_use_a_constant_ratio() {
        let base = random3([3, 4, 4]);
        let style = random3([3, 4, 4]);
        let combination = random3([3, 4, 4]);

        let clamped = content_loss(base.clone(), style, combination.clone(), 1.5, 1.5);
        let expected = square(combination - base.mul_scalar(1.5)).sum();

        approx::assert_relative_eq!(scalar(clamped), scalar(expected), max_relative = 1e-5);
    }

    #[test]
    fn content_loss_clamps_the_ratio() {
        let device = Default::default();
        let base = Tensor::<B, 3>::from_data(TensorData::new(vec![1.0f32, 2.0], [1, 1, 2]), &device);
        // ratios are 10 and 0.1, clamped to 5 and 0.7
        let style = Tensor::<B, 3>::from_data(TensorData::new(vec![10.0f32, 0.2], [1, 1, 2]), &device);
        let combination = Tensor::<B, 3>::zeros([1, 1, 2], &device);

        let loss = scalar(content_loss(base, style, combination, 0.7, 5.0));
        // (1 * 5)^2 + (2 * 0.7)^2
        approx::assert_relative_eq!(loss, 25.0 + 1.96, max_relative = 1e-3);
    }

    #[test]
    fn total_variation_of_constant_image_is_zero() {
        let flat = Tensor::<B, 4>::ones([1, 3, 6, 6], &Default::default()).mul_scalar(42.0);
        approx::assert_relative_eq!(scalar(total_variation_loss(flat)), 0.0);
    }

    #[test]
    fn total_variation_sees_every_neighbor_pair() {
        let size = 5;
        // differences in the last row and the last column must count too
        for (y, x) in [(0, 0), (2, 3), (4, 4), (4, 0), (0, 4)] {
            let mut pixels = vec![0.0f32; 3 * size * size];
            pixels[y * size + x] = 2.0;

            let img = Tensor::<B, 4>::from_data(
                TensorData::new(pixels, [1, 3, size, size]),
                &Default::default(),
            );
            let tv = scalar(total_variation_loss(img));
            assert!(tv > 0.0, "pixel ({}, {}) gave {}", x, y, tv);
        }
    }

    #[test]
    fn total_variation_exponent() {
        // a single step between two pixels of one channel: (2^2)^1.25
        let img = Tensor::<B, 4>::from_data(
            TensorData::new(vec![0.0f32, 2.0, 0.0, 2.0], [1, 1, 2, 2]),
            &Default::default(),
        );
        let expected = 2.0 * 4.0f32.powf(1.25);
        approx::assert_relative_eq!(scalar(total_variation_loss(img)), expected, max_relative = 1e-5);
    }

    #[test]
    fn total_loss_combines_terms() {
        let device = Default::default();
        let layers = vec!["a".to_owned(), "b".to_owned()];

        let mut activations = Activations::<B>::default();
        let maps: Vec<Tensor<B, 4>> = (0..2)
            .map(|_| Tensor::random([3, 4, 3, 3], Distribution::Uniform(0.0, 2.0), &device))
            .collect();
        for (layer, map) in layers.iter().zip(&maps) {
            activations.insert(layer.clone(), map.clone());
        }

        let combination = Tensor::<B, 4>::random([1, 3, 8, 8], Distribution::Uniform(-50.0, 50.0), &device);
        let weights = LossWeights {
            content_weight: 0.3,
            style_weight: 0.8,
            total_variation_weight: 1e-3,
            gamma: 50.0,
            g_min: 0.5,
            g_max: 2.0,
        };
        let norm = StyleNorm::for_image(8);

        let components = total_loss(&activations, combination.clone(), &layers, &weights, norm).unwrap();

        let mut content = 0.0;
        let mut style = 0.0;
        for map in &maps {
            let slot = |i: usize| map.clone().slice([i..i + 1]).squeeze::<3>(0);
            content += scalar(content_loss(slot(0), slot(1), slot(2), 0.5, 2.0)) * 0.3;
            style += scalar(style_loss(slot(1), slot(2), norm)) * 0.4;
        }
        let tv = scalar(total_variation_loss(combination)) * 1e-3;

        approx::assert_relative_eq!(scalar(components.content.clone()), content, max_relative = 1e-4);
        approx::assert_relative_eq!(scalar(components.style.clone()), style * 50.0, max_relative = 1e-4);
        approx::assert_relative_eq!(scalar(components.total_variation.clone()), tv, max_relative = 1e-4);
        approx::assert_relative_eq!(
            scalar(components.total()),
            content + style * 50.0 + tv,
            max_relative = 1e-4
        );
    }

    #[test]
    fn total_loss_needs_every_layer() {
        let device = Default::default();
        let mut activations = Activations::<B>::default();
        activations.insert("a", Tensor::zeros([3, 2, 2, 2], &device));

        let layers = vec!["a".to_owned(), "missing".to_owned()];
        let err = total_loss(
            &activations,
            Tensor::zeros([1, 3, 4, 4], &device),
            &layers,
            &LossWeights::default(),
            StyleNorm::for_image(4),
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingActivation(name) if name == "missing"));
    }
}

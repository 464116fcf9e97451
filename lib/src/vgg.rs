//! The convolutional feature extractor.
//!
//! The loss only depends on the `FeatureExtractor` trait; `Vgg16` is the
//! implementation sessions use by default.

use crate::Error;
use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2dConfig, MaxPool2dConfig},
        PaddingConfig2d,
    },
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{activation::relu, backend::Backend, Tensor},
};
use std::{collections::HashMap, fmt, path::Path, str::FromStr};

/// Names of the VGG16 convolution layers, in forward order
pub const LAYER_NAMES: [&str; 13] = [
    "conv1_1", "conv1_2", //
    "conv2_1", "conv2_2", //
    "conv3_1", "conv3_2", "conv3_3", //
    "conv4_1", "conv4_2", "conv4_3", //
    "conv5_1", "conv5_2", "conv5_3",
];

/// The layers followed by a pooling step. The pool after `conv5_3` never
/// feeds an activation we expose, so it is skipped.
const POOL_AFTER: [&str; 4] = ["conv1_2", "conv2_2", "conv3_3", "conv4_3"];

/// Position of an image in the batch fed to the extractor
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BatchSlot {
    Content = 0,
    Style = 1,
    Combination = 2,
}

/// Activations of a `(content, style, combination)` batch, keyed by layer name.
/// Every tensor has shape `(3, channels, height, width)`.
#[derive(Debug)]
pub struct Activations<B: Backend> {
    layers: HashMap<String, Tensor<B, 4>>,
}

impl<B: Backend> Default for Activations<B> {
    fn default() -> Self {
        Self {
            layers: HashMap::new(),
        }
    }
}

impl<B: Backend> Activations<B> {
    pub fn insert<S: Into<String>>(&mut self, layer: S, activation: Tensor<B, 4>) {
        self.layers.insert(layer.into(), activation);
    }

    pub fn get(&self, layer: &str) -> Result<&Tensor<B, 4>, Error> {
        self.layers
            .get(layer)
            .ok_or_else(|| Error::MissingActivation(layer.to_owned()))
    }

    /// The `(channels, height, width)` features of one image of the batch
    pub fn slot(&self, layer: &str, slot: BatchSlot) -> Result<Tensor<B, 3>, Error> {
        let index = slot as usize;
        Ok(self
            .get(layer)?
            .clone()
            .slice([index..index + 1])
            .squeeze::<3>(0))
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Maps a batch of three preprocessed images to named intermediate
/// activations. Implementations must be built from differentiable tensor ops
/// and must preserve the order of the batch.
pub trait FeatureExtractor<B: Backend> {
    /// Whether `layer` is a name this extractor can produce
    fn has_layer(&self, layer: &str) -> bool;

    /// Runs the batch through the network, returning (at least) the requested
    /// layers.
    fn extract(&self, batch: Tensor<B, 4>, layers: &[String]) -> Activations<B>;
}

/// The pooling used between the convolution blocks
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolType {
    Max,
    Average,
}

impl FromStr for PoolType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "max" => Ok(Self::Max),
            "ave" => Ok(Self::Average),
            other => Err(format!("pool type `{}` not one of: 'max', 'ave'", other)),
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Max => "max",
            Self::Average => "ave",
        })
    }
}

/// The learnable part of VGG16: thirteen 3x3 convolutions. Field names match
/// `LAYER_NAMES` so that weight records are keyed by layer name.
#[derive(Module, Debug)]
pub struct Vgg16Convs<B: Backend> {
    conv1_1: Conv2d<B>,
    conv1_2: Conv2d<B>,
    conv2_1: Conv2d<B>,
    conv2_2: Conv2d<B>,
    conv3_1: Conv2d<B>,
    conv3_2: Conv2d<B>,
    conv3_3: Conv2d<B>,
    conv4_1: Conv2d<B>,
    conv4_2: Conv2d<B>,
    conv4_3: Conv2d<B>,
    conv5_1: Conv2d<B>,
    conv5_2: Conv2d<B>,
    conv5_3: Conv2d<B>,
}

impl<B: Backend> Vgg16Convs<B> {
    /// Randomly initialized convolutions
    pub fn new(device: &B::Device) -> Self {
        let conv = |in_ch, out_ch| {
            Conv2dConfig::new([in_ch, out_ch], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Self {
            conv1_1: conv(3, 64),
            conv1_2: conv(64, 64),
            conv2_1: conv(64, 128),
            conv2_2: conv(128, 128),
            conv3_1: conv(128, 256),
            conv3_2: conv(256, 256),
            conv3_3: conv(256, 256),
            conv4_1: conv(256, 512),
            conv4_2: conv(512, 512),
            conv4_3: conv(512, 512),
            conv5_1: conv(512, 512),
            conv5_2: conv(512, 512),
            conv5_3: conv(512, 512),
        }
    }

    fn in_order(&self) -> [&Conv2d<B>; 13] {
        [
            &self.conv1_1,
            &self.conv1_2,
            &self.conv2_1,
            &self.conv2_2,
            &self.conv3_1,
            &self.conv3_2,
            &self.conv3_3,
            &self.conv4_1,
            &self.conv4_2,
            &self.conv4_3,
            &self.conv5_1,
            &self.conv5_2,
            &self.conv5_3,
        ]
    }
}

/// VGG16 convolutional feature extractor with a configurable pooling type.
///
/// The activation exposed under a layer name is the output of that
/// convolution after its ReLU.
#[derive(Debug)]
pub struct Vgg16<B: Backend> {
    convs: Vgg16Convs<B>,
    pool: PoolType,
}

impl<B: Backend> Vgg16<B> {
    /// Creates a VGG16 with random weights, which is only useful for testing
    pub fn new(pool: PoolType, device: &B::Device) -> Self {
        Self {
            convs: Vgg16Convs::new(device),
            pool,
        }
    }

    /// Loads pretrained weights from a burn named MessagePack record.
    pub fn load<P: AsRef<Path>>(path: P, pool: PoolType, device: &B::Device) -> Result<Self, Error> {
        let path = path.as_ref().with_extension("mpk");
        if !path.exists() {
            return Err(Error::MissingWeights(path));
        }

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let convs = Vgg16Convs::new(device).load_file(path.clone(), &recorder, device)?;
        tracing::info!(path = %path.display(), pool = %pool, "model loaded");

        Ok(Self { convs, pool })
    }

    pub fn from_convs(convs: Vgg16Convs<B>, pool: PoolType) -> Self {
        Self { convs, pool }
    }

    pub fn pool_type(&self) -> PoolType {
        self.pool
    }

    fn pool(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self.pool {
            PoolType::Max => MaxPool2dConfig::new([2, 2])
                .with_strides([2, 2])
                .init()
                .forward(x),
            PoolType::Average => AvgPool2dConfig::new([2, 2])
                .with_strides([2, 2])
                .init()
                .forward(x),
        }
    }
}

impl<B: Backend> FeatureExtractor<B> for Vgg16<B> {
    fn has_layer(&self, layer: &str) -> bool {
        LAYER_NAMES.contains(&layer)
    }

    fn extract(&self, batch: Tensor<B, 4>, layers: &[String]) -> Activations<B> {
        let mut activations = Activations::default();

        // No need to run the layers after the deepest one we were asked for
        let depth = LAYER_NAMES
            .iter()
            .rposition(|name| layers.iter().any(|l| l == name))
            .map_or(0, |last| last + 1);

        let mut x = batch;
        for (name, conv) in LAYER_NAMES.iter().zip(self.convs.in_order()).take(depth) {
            x = relu(conv.forward(x));

            if layers.iter().any(|l| l == name) {
                activations.insert(*name, x.clone());
            }

            if POOL_AFTER.contains(name) {
                x = self.pool(x);
            }
        }

        activations
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn layers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[test]
    fn activation_shapes() {
        let device = Default::default();
        let vgg = Vgg16::<B>::new(PoolType::Max, &device);

        let batch = Tensor::<B, 4>::zeros([3, 3, 32, 32], &device);
        let acts = vgg.extract(batch, &layers(&["conv1_1", "conv3_1", "conv4_2"]));

        assert_eq!(acts.len(), 3);
        assert_eq!(acts.get("conv1_1").unwrap().dims(), [3, 64, 32, 32]);
        assert_eq!(acts.get("conv3_1").unwrap().dims(), [3, 256, 8, 8]);
        assert_eq!(acts.get("conv4_2").unwrap().dims(), [3, 512, 4, 4]);
        assert!(matches!(
            acts.get("conv5_2"),
            Err(Error::MissingActivation(name)) if name == "conv5_2"
        ));
    }

    #[test]
    fn average_pooling_keeps_shapes() {
        let device = Default::default();
        let vgg = Vgg16::<B>::new(PoolType::Average, &device);

        let batch = Tensor::<B, 4>::ones([3, 3, 16, 16], &device);
        let acts = vgg.extract(batch, &layers(&["conv2_1"]));
        assert_eq!(acts.get("conv2_1").unwrap().dims(), [3, 128, 8, 8]);
    }

    #[test]
    fn slots_follow_batch_order() {
        let device = Default::default();
        let mut acts = Activations::<B>::default();

        let content = Tensor::<B, 4>::zeros([1, 2, 2, 2], &device);
        let style = Tensor::<B, 4>::ones([1, 2, 2, 2], &device);
        let combination = Tensor::<B, 4>::ones([1, 2, 2, 2], &device).mul_scalar(2.0);
        acts.insert("layer", Tensor::cat(vec![content, style, combination], 0));

        let sum = |slot| {
            acts.slot("layer", slot)
                .unwrap()
                .sum()
                .into_scalar()
        };
        approx::assert_relative_eq!(sum(BatchSlot::Content), 0.0);
        approx::assert_relative_eq!(sum(BatchSlot::Style), 8.0);
        approx::assert_relative_eq!(sum(BatchSlot::Combination), 16.0);
        assert_eq!(acts.slot("layer", BatchSlot::Style).unwrap().dims(), [2, 2, 2]);
    }

    #[test]
    fn missing_weights() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let err = Vgg16::<B>::load(dir.path().join("nope.mpk"), PoolType::Max, &device).unwrap_err();
        assert!(matches!(err, Error::MissingWeights(_)));
    }

    #[test]
    fn weights_round_trip() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vgg16.mpk");

        let convs = Vgg16Convs::<B>::new(&device);
        let reference = Vgg16::from_convs(convs.clone(), PoolType::Max);
        convs
            .save_file(path.clone(), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();

        let loaded = Vgg16::<B>::load(&path, PoolType::Max, &device).unwrap();

        let batch = Tensor::<B, 4>::ones([3, 3, 8, 8], &device);
        let names = layers(&["conv2_2"]);
        let expected = reference.extract(batch.clone(), &names);
        let actual = loaded.extract(batch, &names);

        let diff = expected
            .get("conv2_2")
            .unwrap()
            .clone()
            .sub(actual.get("conv2_2").unwrap().clone())
            .abs()
            .max()
            .into_scalar();
        approx::assert_relative_eq!(diff, 0.0);
    }

    #[test]
    fn pool_type_names() {
        assert_eq!("max".parse::<PoolType>().unwrap(), PoolType::Max);
        assert_eq!("AVE".parse::<PoolType>().unwrap(), PoolType::Average);
        assert!("min".parse::<PoolType>().is_err());
    }
}

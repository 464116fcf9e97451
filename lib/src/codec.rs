//! Conversion between encoded images and the tensors the feature extractor
//! consumes.
//!
//! The extractor expects BGR channel order with the ImageNet per-channel mean
//! subtracted, laid out as `(batch, channel, height, width)`.

use crate::{Dims, Error};
use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{imageops::FilterType, RgbImage};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::{fmt, path::Path, str::FromStr};

/// Per-channel means in B, G, R order
pub const BGR_MEANS: [f32; 3] = [103.939, 116.779, 123.68];

/// Number of color channels of every image tensor
pub const CHANNELS: usize = 3;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a + ?Sized,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Facts about the content image that are needed after optimization to give
/// the snapshots back their original shape.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RunContext {
    original: Option<Dims>,
}

impl RunContext {
    pub fn record(&mut self, dims: Dims) {
        self.original = Some(dims);
    }

    /// The `(width, height)` of the content image before it was resized
    pub fn original_dims(&self) -> Option<Dims> {
        self.original
    }

    /// `height / width` of the content image before it was resized
    pub fn aspect_ratio(&self) -> Option<f64> {
        self.original
            .map(|dims| f64::from(dims.height) / f64::from(dims.width))
    }
}

/// The interpolation used when a snapshot is resized before being saved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RescaleMethod {
    Nearest,
    Bilinear,
    Bicubic,
    Lanczos,
    Gaussian,
}

impl RescaleMethod {
    pub fn filter(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Bilinear => FilterType::Triangle,
            Self::Bicubic => FilterType::CatmullRom,
            Self::Lanczos => FilterType::Lanczos3,
            Self::Gaussian => FilterType::Gaussian,
        }
    }
}

impl FromStr for RescaleMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s {
            "nearest" => Self::Nearest,
            "bilinear" => Self::Bilinear,
            "bicubic" | "cubic" => Self::Bicubic,
            "lanczos" => Self::Lanczos,
            "gaussian" => Self::Gaussian,
            other => {
                return Err(format!(
                    "rescale method `{}` not one of: 'nearest', 'bilinear', 'bicubic', 'cubic', 'lanczos', 'gaussian'",
                    other
                ))
            }
        };

        Ok(method)
    }
}

impl fmt::Display for RescaleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Nearest => "nearest",
            Self::Bilinear => "bilinear",
            Self::Bicubic => "bicubic",
            Self::Lanczos => "lanczos",
            Self::Gaussian => "gaussian",
        })
    }
}

/// A preprocessed square image with a leading batch axis of 1, ie. of shape
/// `(1, 3, size, size)`, in BGR order with the channel means subtracted.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    size: u32,
}

impl ImageTensor {
    /// Preprocesses a square RGB image.
    pub fn from_rgb(img: &RgbImage) -> Self {
        let (width, height) = img.dimensions();
        assert_eq!(width, height, "image tensors must be square");

        let size = width as usize;
        let plane = size * size;
        let mut data = vec![0.0; CHANNELS * plane];

        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = y as usize * size + x as usize;
            // RGB -> BGR
            for (c, mean) in BGR_MEANS.iter().enumerate() {
                data[c * plane + offset] = f32::from(pixel[2 - c]) - mean;
            }
        }

        Self { data, size: width }
    }

    /// Uniform noise in `[0, 255)`, preprocessed like a decoded image.
    pub fn noise(size: u32, seed: u64) -> Self {
        let mut rng = Pcg32::seed_from_u64(seed);
        let plane = size as usize * size as usize;

        let data = (0..CHANNELS * plane)
            .map(|i| rng.gen_range(0.0f32..255.0) - BGR_MEANS[i / plane])
            .collect();

        Self { data, size }
    }

    /// Rebuilds an image tensor from the optimizer's flattened pixel vector.
    pub fn from_flat(pixels: &[f64], size: u32) -> Result<Self, Error> {
        let expected = CHANNELS * size as usize * size as usize;
        if pixels.len() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                actual: pixels.len(),
            });
        }

        Ok(Self {
            data: pixels.iter().map(|&p| p as f32).collect(),
            size,
        })
    }

    /// Flattens the tensor into the vector the optimizer works on.
    pub fn to_flat(&self) -> Vec<f64> {
        self.data.iter().map(|&p| f64::from(p)).collect()
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn shape(&self) -> [usize; 4] {
        let size = self.size as usize;
        [1, CHANNELS, size, size]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::from_data(TensorData::new(self.data.clone(), self.shape()), device)
    }

    /// Undoes the preprocessing: adds the means back, converts BGR -> RGB,
    /// and clips and rounds into the 8-bit range.
    pub fn to_rgb(&self) -> RgbImage {
        let size = self.size as usize;
        let plane = size * size;

        RgbImage::from_fn(self.size, self.size, |x, y| {
            let offset = y as usize * size + x as usize;
            let mut rgb = [0u8; 3];
            for (c, mean) in BGR_MEANS.iter().enumerate() {
                let value = (self.data[c * plane + offset] + mean).clamp(0.0, 255.0);
                rgb[2 - c] = value.round() as u8;
            }
            image::Rgb(rgb)
        })
    }
}

/// Decodes an image, resizes it to the square working resolution and
/// preprocesses it. If a run context is given, the original dimensions of the
/// image are recorded into it.
pub fn load(
    src: ImageSource<'_>,
    size: u32,
    record: Option<&mut RunContext>,
) -> Result<ImageTensor, Error> {
    let img = load_dynamic_image(src)?.to_rgb8();
    let (width, height) = img.dimensions();

    if let Some(ctx) = record {
        ctx.record(Dims::new(width, height));
    }

    let img = if width != size || height != size {
        tracing::debug!(width, height, size, "resizing input to the working resolution");
        image::imageops::resize(&img, size, size, FilterType::Triangle)
    } else {
        img
    };

    Ok(ImageTensor::from_rgb(&img))
}

/// Deprocesses an image tensor, optionally resizes it, and writes it to disk.
/// The image format is inferred from the file extension.
pub fn save<P: AsRef<Path>>(
    tensor: &ImageTensor,
    path: P,
    target: Option<Dims>,
    method: RescaleMethod,
) -> Result<RgbImage, Error> {
    let path = path.as_ref();
    let img = tensor.to_rgb();

    let img = match target {
        Some(dims) if dims != Dims::square(tensor.size()) => {
            tracing::info!(
                width = dims.width,
                height = dims.height,
                "rescaling image"
            );
            image::imageops::resize(&img, dims.width, dims.height, method.filter())
        }
        _ => img,
    };

    if let Some(parent_path) = path.parent() {
        std::fs::create_dir_all(parent_path)?;
    }

    img.save(path)?;
    Ok(img)
}

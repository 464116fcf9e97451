// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `neural-style` synthesizes an image that keeps the spatial structure of a
//! content image while taking on the texture and color statistics of a style
//! image.
//!
//! The three images (content, style and the evolving combination) are fed as
//! one batch through a VGG16 feature extractor. A scalar loss is assembled from
//! a content term, a Gram-matrix style term and a total variation term, its
//! gradient with respect to the combination pixels is obtained with reverse
//! mode autodiff, and an L-BFGS optimizer updates the pixels. A snapshot of the
//! combination image is saved after every outer iteration.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the
//! builder pattern. Calling `build` loads the input images and the extractor
//! weights and checks the parameters. `Session::run` then performs the outer
//! iterations and returns a `TransferReport`.
//!
//! ## Usage
//!
//! ```no_run
//! let session = neural_style::Session::builder()
//!     .content_image(&"imgs/portrait.jpg")
//!     .style_image(&"imgs/starry_night.jpg")
//!     .result_prefix("out/portrait")
//!     .image_size(256)
//!     .num_iter(5)
//!     .build()
//!     .expect("failed to build session");
//!
//! let report = session.run(None).expect("style transfer failed");
//! println!("final loss {}", report.final_loss());
//! ```
mod errors;

pub mod codec;
pub mod evaluator;
pub mod lbfgs;
pub mod loss;
pub mod session;
pub mod vgg;

pub use burn;
pub use image;

pub use codec::{ImageSource, ImageTensor, RescaleMethod, RunContext};
pub use errors::Error;
pub use evaluator::Evaluator;
pub use lbfgs::{Lbfgs, Minimum, Objective, Termination};
pub use loss::{LossComponents, LossWeights, StyleNorm};
pub use session::{
    IterationReport, ProgressUpdate, Session, SessionBuilder, TransferProgress, TransferReport,
};
pub use vgg::{Activations, FeatureExtractor, PoolType, Vgg16};

use std::{fmt, path::PathBuf, str::FromStr};

/// The backend every session runs on: the ndarray CPU backend, wrapped for
/// reverse mode autodiff.
pub type DefaultBackend = burn::backend::Autodiff<burn::backend::NdArray<f32>>;

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// How the combination image is seeded before the first outer iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitImage {
    /// Start from the preprocessed content image
    Content,
    /// Start from uniform noise in `[0, 255)`
    Noise,
}

impl FromStr for InitImage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(Self::Content),
            "noise" => Ok(Self::Noise),
            other => Err(format!(
                "init image `{}` not one of: 'content', 'noise'",
                other
            )),
        }
    }
}

impl fmt::Display for InitImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Content => "content",
            Self::Noise => "noise",
        })
    }
}

/// Default location of the pretrained VGG16 weights
pub const DEFAULT_WEIGHTS_PATH: &str = "vgg16_weights.mpk";

struct Parameters {
    image_size: u32,
    content_weight: f64,
    style_weight: f64,
    total_variation_weight: f64,
    num_iter: u32,
    max_evals: u32,
    rescale_image: bool,
    maintain_aspect_ratio: bool,
    rescale_method: RescaleMethod,
    content_layer: String,
    feature_layers: Vec<String>,
    init_image: InitImage,
    pool_type: PoolType,
    g_max: f64,
    g_min: f64,
    gamma: f64,
    seed: u64,
    weights: PathBuf,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            image_size: 512,
            content_weight: 0.5,
            style_weight: 0.5,
            total_variation_weight: 1e-5,
            num_iter: 10,
            max_evals: 20,
            rescale_image: true,
            maintain_aspect_ratio: true,
            rescale_method: RescaleMethod::Bilinear,
            content_layer: "conv5_2".to_owned(),
            feature_layers: vec!["conv3_1".to_owned(), "conv4_1".to_owned()],
            init_image: InitImage::Content,
            pool_type: PoolType::Max,
            g_max: 5.0,
            g_min: 0.7,
            gamma: 100.0,
            seed: 0,
            weights: PathBuf::from(DEFAULT_WEIGHTS_PATH),
        }
    }
}

impl Parameters {
    fn to_loss_weights(&self) -> LossWeights {
        LossWeights {
            content_weight: self.content_weight,
            style_weight: self.style_weight,
            total_variation_weight: self.total_variation_weight,
            gamma: self.gamma,
            g_min: self.g_min,
            g_max: self.g_max,
        }
    }

    fn to_optimizer(&self) -> Lbfgs {
        Lbfgs::default().max_evals(self.max_evals as usize)
    }

    /// The size a snapshot is resized to before it is saved, if any.
    fn output_size(&self, ctx: &RunContext) -> Option<Dims> {
        if self.rescale_image {
            ctx.original_dims()
        } else if self.maintain_aspect_ratio {
            ctx.aspect_ratio().map(|ratio| {
                Dims::new(
                    self.image_size,
                    (f64::from(self.image_size) * ratio) as u32,
                )
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_image_parses() {
        assert_eq!("content".parse::<InitImage>().unwrap(), InitImage::Content);
        assert_eq!("noise".parse::<InitImage>().unwrap(), InitImage::Noise);
        assert!("gradient".parse::<InitImage>().is_err());
    }

    #[test]
    fn rescale_policy() {
        let mut ctx = RunContext::default();
        ctx.record(Dims::new(400, 300));

        let mut params = Parameters {
            image_size: 256,
            ..Parameters::default()
        };

        // rescaling to the original wins regardless of the aspect flag
        assert_eq!(params.output_size(&ctx), Some(Dims::new(400, 300)));
        params.maintain_aspect_ratio = false;
        assert_eq!(params.output_size(&ctx), Some(Dims::new(400, 300)));

        params.rescale_image = false;
        assert_eq!(params.output_size(&ctx), None);

        params.maintain_aspect_ratio = true;
        assert_eq!(params.output_size(&ctx), Some(Dims::new(256, 192)));
    }

    #[test]
    fn rescale_needs_recorded_dims() {
        let params = Parameters::default();
        assert_eq!(params.output_size(&RunContext::default()), None);
    }
}

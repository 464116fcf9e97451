use crate::*;
use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

/// The smallest working resolution that survives the four pooling steps
/// in front of the deepest VGG16 block.
const MIN_IMAGE_SIZE: u32 = 16;

/// Style transfer session.
///
/// Calling `run()` performs the outer iterations, saving a snapshot of the
/// combination image after each of them, and consumes the session in the
/// process. You can provide a `TransferProgress` implementation to get the
/// freshly saved image and the loss after every outer iteration.
///
/// # Example
/// ```no_run
/// let session = neural_style::Session::builder()
///     .content_image(&"imgs/portrait.jpg")
///     .style_image(&"imgs/starry_night.jpg")
///     .result_prefix("out/portrait")
///     .build().expect("failed to build session");
///
/// let report = session.run(None).expect("style transfer failed");
/// report.image.save("my_styled_img.png").expect("failed to save image");
/// ```
pub struct Session {
    content: ImageTensor,
    style: ImageTensor,
    ctx: RunContext,
    extractor: Box<dyn FeatureExtractor<DefaultBackend>>,
    result_prefix: PathBuf,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// Runs the outer iterations, returning a report of each of them along
    /// with the last saved image.
    pub fn run(
        self,
        mut progress: Option<Box<dyn TransferProgress>>,
    ) -> Result<TransferReport, Error> {
        let device = Default::default();
        let size = self.content.size();

        let mut evaluator = Evaluator::<DefaultBackend>::new(
            &*self.extractor,
            &self.content,
            &self.style,
            self.params.feature_layers.clone(),
            self.params.content_layer.clone(),
            self.params.to_loss_weights(),
            &device,
        )?;
        let optimizer = self.params.to_optimizer();
        let output_size = self.params.output_size(&self.ctx);

        let mut x = match self.params.init_image {
            InitImage::Content => self.content.to_flat(),
            InitImage::Noise => ImageTensor::noise(size, self.params.seed).to_flat(),
        };

        let total = self.params.num_iter;
        let mut iterations = Vec::with_capacity(total as usize);
        let mut image = None;

        for iteration in 1..=total {
            tracing::info!(iteration, "start of iteration");
            let started = Instant::now();

            let minimum = optimizer.minimize(&mut evaluator, x)?;
            tracing::info!(
                loss = minimum.loss,
                evaluations = minimum.evaluations,
                termination = ?minimum.termination,
                "current loss value"
            );

            let path = snapshot_path(&self.result_prefix, iteration);
            let saved = codec::save(
                &ImageTensor::from_flat(&minimum.x, size)?,
                &path,
                output_size,
                self.params.rescale_method,
            )?;
            tracing::info!(path = %path.display(), "image saved");

            let elapsed = started.elapsed();
            tracing::info!(
                iteration,
                elapsed_secs = elapsed.as_secs_f64(),
                "iteration completed"
            );

            let report = IterationReport {
                iteration,
                start_loss: minimum.start_loss,
                loss: minimum.loss,
                evaluations: minimum.evaluations,
                termination: minimum.termination,
                elapsed,
                path,
            };

            if let Some(progress) = progress.as_mut() {
                progress.update(ProgressUpdate {
                    image: &saved,
                    report: &report,
                    total,
                });
            }

            iterations.push(report);
            image = Some(saved);
            x = minimum.x;
        }

        // num_iter is validated to be at least 1
        let image = image.ok_or(Error::MissingInput("outer iteration"))?;

        Ok(TransferReport { iterations, image })
    }
}

/// `<prefix>_at_iteration_<n>.png`
fn snapshot_path(prefix: &Path, iteration: u32) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("_at_iteration_{}.png", iteration));
    PathBuf::from(name)
}

/// Builds a session by setting parameters and input images, calling `build`
/// will load the inputs and the feature extractor and check all of the
/// parameters, so that a run can't fail on bad configuration halfway through.
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    result_prefix: Option<PathBuf>,
    extractor: Option<Box<dyn FeatureExtractor<DefaultBackend>>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose spatial structure the result keeps. Its original
    /// dimensions drive the rescale policy of the saved snapshots.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// let session = neural_style::Session::builder()
    ///     .content_image(&"imgs/portrait.jpg")
    ///     .style_image(&"imgs/starry_night.jpg")
    ///     .result_prefix("out/portrait")
    ///     .build().expect("failed to build session");
    /// ```
    pub fn content_image<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// The image whose texture and colors are transferred
    pub fn style_image<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// Snapshots are written to `<prefix>_at_iteration_<n>.png`. Missing
    /// parent directories are created.
    pub fn result_prefix<P: Into<PathBuf>>(mut self, prefix: P) -> Self {
        self.result_prefix = Some(prefix.into());
        self
    }

    /// The side of the square working resolution both inputs are resized to
    pub fn image_size(mut self, size: u32) -> Self {
        self.params.image_size = size;
        self
    }

    pub fn content_weight(mut self, value: f64) -> Self {
        self.params.content_weight = value;
        self
    }

    pub fn style_weight(mut self, value: f64) -> Self {
        self.params.style_weight = value;
        self
    }

    pub fn total_variation_weight(mut self, value: f64) -> Self {
        self.params.total_variation_weight = value;
        self
    }

    /// Number of outer iterations, each of which saves a snapshot
    pub fn num_iter(mut self, count: u32) -> Self {
        self.params.num_iter = count;
        self
    }

    /// Loss and gradient evaluations the optimizer may spend per outer
    /// iteration
    pub fn max_evals(mut self, count: u32) -> Self {
        self.params.max_evals = count;
        self
    }

    /// Resize the snapshots back to the original content image dimensions
    pub fn rescale_image(mut self, value: bool) -> Self {
        self.params.rescale_image = value;
        self
    }

    /// When not rescaling, keep the width at the working size and scale the
    /// height by the content image's aspect ratio
    pub fn maintain_aspect_ratio(mut self, value: bool) -> Self {
        self.params.maintain_aspect_ratio = value;
        self
    }

    pub fn rescale_method(mut self, method: RescaleMethod) -> Self {
        self.params.rescale_method = method;
        self
    }

    pub fn content_layer<S: Into<String>>(mut self, layer: S) -> Self {
        self.params.content_layer = layer.into();
        self
    }

    /// The layers the content and style terms are accumulated over
    pub fn feature_layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, layers: I) -> Self {
        self.params.feature_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    pub fn init_image(mut self, init: InitImage) -> Self {
        self.params.init_image = init;
        self
    }

    /// Ignored if a custom extractor is provided
    pub fn pool_type(mut self, pool: PoolType) -> Self {
        self.params.pool_type = pool;
        self
    }

    pub fn g_max(mut self, value: f64) -> Self {
        self.params.g_max = value;
        self
    }

    pub fn g_min(mut self, value: f64) -> Self {
        self.params.g_min = value;
        self
    }

    /// Scales the style term as a whole
    pub fn gamma(mut self, value: f64) -> Self {
        self.params.gamma = value;
        self
    }

    /// Seed of the noise used with `InitImage::Noise`
    pub fn seed(mut self, value: u64) -> Self {
        self.params.seed = value;
        self
    }

    /// Path of the pretrained VGG16 weights record
    pub fn weights<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.params.weights = path.into();
        self
    }

    /// Uses a custom feature extractor instead of loading VGG16 from the
    /// weights path.
    pub fn extractor(mut self, extractor: Box<dyn FeatureExtractor<DefaultBackend>>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn build(self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let content = self.content.ok_or(Error::MissingInput("content image"))?;
        let style = self.style.ok_or(Error::MissingInput("style image"))?;
        let result_prefix = self
            .result_prefix
            .ok_or(Error::MissingInput("result prefix"))?;

        let extractor = match self.extractor {
            Some(extractor) => extractor,
            None => Box::new(Vgg16::<DefaultBackend>::load(
                &self.params.weights,
                self.params.pool_type,
                &Default::default(),
            )?),
        };

        if let Some(unknown) = self
            .params
            .feature_layers
            .iter()
            .chain(std::iter::once(&self.params.content_layer))
            .find(|layer| !extractor.has_layer(layer))
        {
            return Err(Error::UnknownLayer(unknown.clone()));
        }

        let mut ctx = RunContext::default();
        let size = self.params.image_size;
        let content = codec::load(content, size, Some(&mut ctx))?;
        let style = codec::load(style, size, None)?;

        Ok(Session {
            content,
            style,
            ctx,
            extractor,
            result_prefix,
            params: self.params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        let params = &self.params;

        if params.image_size < MIN_IMAGE_SIZE {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: f64::from(MIN_IMAGE_SIZE),
                max: f64::from(u32::MAX),
                value: f64::from(params.image_size),
                name: "image-size",
            }));
        }

        if params.num_iter == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f64::from(u32::MAX),
                value: 0.0,
                name: "num-iter",
            }));
        }

        if params.max_evals == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f64::from(u32::MAX),
                value: 0.0,
                name: "max-evals",
            }));
        }

        for (value, name) in [
            (params.content_weight, "content-weight"),
            (params.style_weight, "style-weight"),
            (params.total_variation_weight, "total-variation-weight"),
            (params.gamma, "gamma"),
            (params.g_min, "g-min"),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 0.0,
                    max: f64::INFINITY,
                    value,
                    name,
                }));
            }
        }

        if params.g_max.is_nan() || params.g_max < params.g_min {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: params.g_min,
                max: f64::INFINITY,
                value: params.g_max,
                name: "g-max",
            }));
        }

        if params.feature_layers.is_empty() {
            return Err(Error::MissingInput("feature layer"));
        }

        Ok(())
    }
}

/// What happened during one outer iteration
#[derive(Clone, Debug)]
pub struct IterationReport {
    /// 1-based index of the outer iteration
    pub iteration: u32,
    /// The loss when the iteration started
    pub start_loss: f64,
    /// The loss of the saved snapshot
    pub loss: f64,
    /// Loss and gradient evaluations spent
    pub evaluations: usize,
    pub termination: Termination,
    pub elapsed: Duration,
    /// Where the snapshot was saved
    pub path: PathBuf,
}

/// The outcome of a whole run
pub struct TransferReport {
    pub iterations: Vec<IterationReport>,
    /// The last saved snapshot, after rescaling
    pub image: image::RgbImage,
}

impl TransferReport {
    pub fn iterations(&self) -> &[IterationReport] {
        &self.iterations
    }

    pub fn final_loss(&self) -> f64 {
        self.iterations.last().map_or(f64::NAN, |it| it.loss)
    }
}

/// The state of the run after an outer iteration
pub struct ProgressUpdate<'a> {
    /// The snapshot that was just saved
    pub image: &'a image::RgbImage,
    pub report: &'a IterationReport,
    /// The total number of outer iterations
    pub total: u32,
}

/// Allows the session to update external callers with the current
/// progress of the transfer
pub trait TransferProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> TransferProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_names() {
        assert_eq!(
            snapshot_path(Path::new("out/result"), 3),
            PathBuf::from("out/result_at_iteration_3.png")
        );
        assert_eq!(
            snapshot_path(Path::new("result"), 10),
            PathBuf::from("result_at_iteration_10.png")
        );
    }

    #[test]
    fn builder_requires_inputs() {
        let session = Session::builder()
            .extractor(Box::new(Vgg16::<DefaultBackend>::new(
                PoolType::Max,
                &Default::default(),
            )))
            .style_image(&"style.png")
            .result_prefix("out")
            .build();

        assert!(matches!(session, Err(Error::MissingInput("content image"))));
    }

    #[test]
    fn invalid_parameters() {
        let check = |builder: SessionBuilder<'_>| match builder.check_parameters_validity() {
            Err(Error::InvalidRange(ir)) => ir.name,
            other => panic!("expected an invalid range, got {:?}", other),
        };

        assert_eq!(check(Session::builder().image_size(0)), "image-size");
        assert_eq!(check(Session::builder().num_iter(0)), "num-iter");
        assert_eq!(check(Session::builder().max_evals(0)), "max-evals");
        assert_eq!(check(Session::builder().style_weight(-1.0)), "style-weight");
        assert_eq!(check(Session::builder().gamma(f64::NAN)), "gamma");
        assert_eq!(check(Session::builder().g_min(2.0).g_max(1.0)), "g-max");

        assert!(Session::builder().check_parameters_validity().is_ok());
        assert!(Session::builder()
            .g_min(1.0)
            .g_max(1.0)
            .check_parameters_validity()
            .is_ok());
    }

    #[test]
    fn feature_layers_must_not_be_empty() {
        let result = Session::builder()
            .feature_layers(Vec::<String>::new())
            .check_parameters_validity();

        assert!(matches!(result, Err(Error::MissingInput("feature layer"))));
    }
}

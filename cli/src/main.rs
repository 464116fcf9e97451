mod progress;

use structopt::StructOpt;

use neural_style::{Error, InitImage, PoolType, RescaleMethod, Session, TransferProgress};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Boolean options take a value so they can be switched off, anything other
/// than `true`, `yes`, `t` or `1` counts as false
fn parse_bool(input: &str) -> bool {
    matches!(
        input.to_lowercase().as_str(),
        "true" | "yes" | "t" | "1"
    )
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Weights {
    /// Weight of the content term
    #[structopt(long, default_value = "0.5")]
    content_weight: f64,
    /// Weight of the style term
    #[structopt(long, default_value = "0.5")]
    style_weight: f64,
    /// Weight of the total variation term, which keeps the result smooth
    #[structopt(long, default_value = "1e-5")]
    total_variation_weight: f64,
    /// Upper bound of the per-feature content gain
    #[structopt(long, default_value = "5.0")]
    g_max: f64,
    /// Lower bound of the per-feature content gain
    #[structopt(long, default_value = "0.7")]
    g_min: f64,
    /// Scales the style term as a whole
    #[structopt(long, default_value = "100")]
    gamma: f64,
}

#[derive(StructOpt)]
#[structopt(
    name = "neural-style",
    about = "Transfers the style of one image onto the content of another",
    rename_all = "kebab-case"
)]
struct Opt {
    /// Path to the image whose content is kept
    #[structopt(parse(from_os_str))]
    base_image_path: PathBuf,
    /// Path to the image whose style is transferred
    #[structopt(parse(from_os_str))]
    style_reference_image_path: PathBuf,
    /// Prefix of the saved snapshots, which are named
    /// `<prefix>_at_iteration_<n>.png`
    #[structopt(parse(from_os_str))]
    result_prefix: PathBuf,
    /// Side of the square working resolution
    #[structopt(long, default_value = "512")]
    image_size: u32,
    /// Number of outer iterations, a snapshot is saved after each of them
    #[structopt(long, default_value = "10")]
    num_iter: u32,
    /// Loss evaluations the optimizer may spend per outer iteration
    #[structopt(long, default_value = "20")]
    max_evals: u32,
    /// Resize the snapshots to the dimensions of the content image
    #[structopt(long, default_value = "true", parse(from_str = parse_bool))]
    rescale_image: bool,
    /// Without --rescale-image, keep the aspect ratio of the content image
    #[structopt(long, default_value = "true", parse(from_str = parse_bool))]
    maintain_aspect_ratio: bool,
    /// Filter used to resize the snapshots, one of 'nearest', 'bilinear',
    /// 'bicubic', 'lanczos' or 'gaussian'
    #[structopt(long, default_value = "bilinear")]
    rescale_method: RescaleMethod,
    /// The VGG16 layer used as the content layer
    #[structopt(long, default_value = "conv5_2")]
    content_layer: String,
    /// Comma separated VGG16 layers the content and style terms are
    /// accumulated over
    #[structopt(long, default_value = "conv3_1,conv4_1", use_delimiter = true)]
    feature_layers: Vec<String>,
    /// What the result starts from, 'content' or 'noise'
    #[structopt(long, default_value = "content")]
    init_image: InitImage,
    /// Pooling between the VGG16 blocks, 'max' or 'ave'
    #[structopt(long, default_value = "max")]
    pool_type: PoolType,
    /// Seed of the noise used with `--init-image noise`
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// Path to the pretrained VGG16 weights
    #[structopt(long, default_value = "vgg16_weights.mpk", parse(from_os_str))]
    weights: PathBuf,
    /// Don't show a progress bar
    #[structopt(long)]
    no_progress: bool,
    #[structopt(flatten)]
    loss: Weights,
}

fn main() {
    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let session = Session::builder()
        .content_image(&args.base_image_path)
        .style_image(&args.style_reference_image_path)
        .result_prefix(&args.result_prefix)
        .image_size(args.image_size)
        .num_iter(args.num_iter)
        .max_evals(args.max_evals)
        .rescale_image(args.rescale_image)
        .maintain_aspect_ratio(args.maintain_aspect_ratio)
        .rescale_method(args.rescale_method)
        .content_layer(&args.content_layer)
        .feature_layers(&args.feature_layers)
        .init_image(args.init_image)
        .pool_type(args.pool_type)
        .seed(args.seed)
        .weights(&args.weights)
        .content_weight(args.loss.content_weight)
        .style_weight(args.loss.style_weight)
        .total_variation_weight(args.loss.total_variation_weight)
        .g_max(args.loss.g_max)
        .g_min(args.loss.g_min)
        .gamma(args.loss.gamma)
        .build()?;

    let progress: Option<Box<dyn TransferProgress>> = if !args.no_progress {
        Some(Box::new(progress::IterationBar::new(args.num_iter)))
    } else {
        None
    };

    let report = session.run(progress)?;

    if let Some(last) = report.iterations().last() {
        tracing::info!(
            loss = report.final_loss(),
            path = %last.path.display(),
            "style transfer finished"
        );
    }

    Ok(())
}

use neural_style::{
    image::{Rgb, RgbImage},
    DefaultBackend, Error, FeatureExtractor, InitImage, PoolType, ProgressUpdate, Session,
    SessionBuilder, Vgg16,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

const SIZE: u32 = 32;

fn random_vgg() -> Box<dyn FeatureExtractor<DefaultBackend>> {
    Box::new(Vgg16::<DefaultBackend>::new(
        PoolType::Max,
        &Default::default(),
    ))
}

/// Writes a 48x32 content image and a 32x32 style image into `dir`
fn write_inputs(dir: &Path) -> (PathBuf, PathBuf) {
    let content = RgbImage::from_fn(48, 32, |x, y| Rgb([(x * 5) as u8, (y * 7) as u8, 128]));
    let style = RgbImage::from_fn(32, 32, |x, y| {
        if (x / 4 + y / 4) % 2 == 0 {
            Rgb([240, 200, 20])
        } else {
            Rgb([20, 40, 160])
        }
    });

    let content_path = dir.join("content.png");
    let style_path = dir.join("style.png");
    content.save(&content_path).unwrap();
    style.save(&style_path).unwrap();

    (content_path, style_path)
}

fn builder<'a>(content: &'a Path, style: &'a Path, prefix: PathBuf) -> SessionBuilder<'a> {
    Session::builder()
        .content_image(content)
        .style_image(style)
        .result_prefix(prefix)
        .extractor(random_vgg())
        .image_size(SIZE)
        .num_iter(1)
        .max_evals(1)
}

#[test]
fn single_iteration_writes_one_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let (content, style) = write_inputs(dir.path());

    let report = builder(&content, &style, dir.path().join("out/result"))
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    let out_dir = dir.path().join("out");
    let written: Vec<_> = std::fs::read_dir(&out_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(written, vec![std::ffi::OsString::from("result_at_iteration_1.png")]);

    // rescaled back to the content image
    let saved = neural_style::image::open(out_dir.join("result_at_iteration_1.png"))
        .unwrap()
        .to_rgb8();
    assert_eq!(saved.dimensions(), (48, 32));
    assert_eq!(report.image.dimensions(), (48, 32));

    assert_eq!(report.iterations().len(), 1);
    let it = &report.iterations()[0];
    assert_eq!(it.iteration, 1);
    assert_eq!(it.path, out_dir.join("result_at_iteration_1.png"));
    assert!(it.evaluations >= 1);
    assert!(it.loss.is_finite());
    assert!(it.loss >= 0.0);
    assert!(it.loss < it.start_loss);
    assert_eq!(report.final_loss(), it.loss);
}

#[test]
fn aspect_ratio_without_rescaling() {
    let dir = tempfile::tempdir().unwrap();
    let (content, style) = write_inputs(dir.path());

    let report = builder(&content, &style, dir.path().join("result"))
        .rescale_image(false)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    // width stays at the working size, height is floor(32 * 32 / 48)
    assert_eq!(report.image.dimensions(), (32, 21));
}

#[test]
fn working_size_without_rescaling() {
    let dir = tempfile::tempdir().unwrap();
    let (content, style) = write_inputs(dir.path());

    let report = builder(&content, &style, dir.path().join("result"))
        .rescale_image(false)
        .maintain_aspect_ratio(false)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    assert_eq!(report.image.dimensions(), (SIZE, SIZE));
}

#[test]
fn noise_init_and_progress() {
    let dir = tempfile::tempdir().unwrap();
    let (content, style) = write_inputs(dir.path());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let progress = {
        let seen = Arc::clone(&seen);
        move |update: ProgressUpdate<'_>| {
            seen.lock()
                .unwrap()
                .push((update.report.iteration, update.total, update.image.dimensions()));
        }
    };

    let report = builder(&content, &style, dir.path().join("noise"))
        .init_image(InitImage::Noise)
        .seed(3)
        .num_iter(2)
        .max_evals(2)
        .build()
        .unwrap()
        .run(Some(Box::new(progress)))
        .unwrap();

    assert!(dir.path().join("noise_at_iteration_1.png").exists());
    assert!(dir.path().join("noise_at_iteration_2.png").exists());
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(1, 2, (48, 32)), (2, 2, (48, 32))]
    );

    let its = report.iterations();
    assert_eq!(its.len(), 2);
    // the second iteration picks up where the first left off
    approx::assert_relative_eq!(its[1].start_loss, its[0].loss, max_relative = 1e-4);
    assert!(its[1].loss <= its[1].start_loss);
}

#[test]
fn missing_weights() {
    let dir = tempfile::tempdir().unwrap();
    let (content, style) = write_inputs(dir.path());

    let result = Session::builder()
        .content_image(&content)
        .style_image(&style)
        .result_prefix(dir.path().join("result"))
        .weights(dir.path().join("vgg16_weights"))
        .build();

    match result {
        Err(Error::MissingWeights(path)) => {
            assert_eq!(path, dir.path().join("vgg16_weights.mpk"));
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("built a session without weights"),
    }
}

#[test]
fn unknown_layer() {
    let dir = tempfile::tempdir().unwrap();
    let (content, style) = write_inputs(dir.path());

    let result = builder(&content, &style, dir.path().join("result"))
        .feature_layers(vec!["conv3_1", "conv9_9"])
        .build();
    assert!(matches!(result, Err(Error::UnknownLayer(name)) if name == "conv9_9"));

    let result = builder(&content, &style, dir.path().join("result"))
        .content_layer("fc7")
        .build();
    assert!(matches!(result, Err(Error::UnknownLayer(name)) if name == "fc7"));
}

#[test]
fn invalid_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let (content, style) = write_inputs(dir.path());

    let result = builder(&content, &style, dir.path().join("result"))
        .image_size(8)
        .build();
    assert!(matches!(result, Err(Error::InvalidRange(_))));

    let result = builder(&content, &style, dir.path().join("result"))
        .total_variation_weight(-1e-5)
        .build();
    assert!(matches!(result, Err(Error::InvalidRange(_))));

    // nothing was written
    assert!(!dir.path().join("result_at_iteration_1.png").exists());
}

#[test]
fn missing_input_image() {
    let dir = tempfile::tempdir().unwrap();
    let (_, style) = write_inputs(dir.path());
    let content = dir.path().join("does_not_exist.png");

    let result = builder(&content, &style, dir.path().join("result")).build();
    assert!(matches!(result, Err(Error::Image(_)) | Err(Error::Io(_))));
}

use neural_style::{InitImage, PoolType, ProgressUpdate, RescaleMethod};

fn main() -> Result<(), neural_style::Error> {
    let session = neural_style::Session::builder()
        .content_image(&"imgs/content.jpg")
        .style_image(&"imgs/style.jpg")
        .result_prefix("out/02")
        //start from seeded noise instead of the content image
        .init_image(InitImage::Noise)
        .seed(7)
        //average pooling gives smoother results
        .pool_type(PoolType::Average)
        //keep the working width, but follow the content image's aspect ratio
        .rescale_image(false)
        .rescale_method(RescaleMethod::Lanczos)
        .style_weight(1.0)
        .build()?;

    let progress = |update: ProgressUpdate<'_>| {
        println!(
            "{}/{} saved {} ({}x{})",
            update.report.iteration,
            update.total,
            update.report.path.display(),
            update.image.width(),
            update.image.height()
        );
    };

    session.run(Some(Box::new(progress)))?;
    Ok(())
}

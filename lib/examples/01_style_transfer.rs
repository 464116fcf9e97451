fn main() -> Result<(), neural_style::Error> {
    //create a new session
    let session = neural_style::Session::builder()
        //the image whose layout we keep
        .content_image(&"imgs/content.jpg")
        //the image whose texture and colors we take
        .style_image(&"imgs/style.jpg")
        //snapshots are saved as out/01_at_iteration_<n>.png
        .result_prefix("out/01")
        .image_size(256)
        .num_iter(5)
        .build()?;

    //run the outer iterations
    let report = session.run(None)?;

    for it in report.iterations() {
        println!(
            "iteration {}: {} -> {} in {} evaluations",
            it.iteration, it.start_loss, it.loss, it.evaluations
        );
    }

    //the last snapshot is also handed back
    report.image.save("out/01.png")?;
    Ok(())
}

use indicatif::{ProgressBar, ProgressStyle};
use neural_style::{ProgressUpdate, TransferProgress};

/// A progress bar over the outer iterations, with the latest loss as its
/// message.
pub struct IterationBar {
    pb: ProgressBar,
    total: u32,
}

impl IterationBar {
    pub fn new(total: u32) -> Self {
        let pb = ProgressBar::new(u64::from(total));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss {msg}")
                .progress_chars("##-"),
        );

        Self { pb, total }
    }
}

impl Drop for IterationBar {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl TransferProgress for IterationBar {
    fn update(&mut self, update: ProgressUpdate<'_>) {
        if update.total != self.total {
            self.total = update.total;
            self.pb.set_length(u64::from(self.total));
        }

        self.pb.set_message(format!("{:.4e}", update.report.loss));
        self.pb.set_position(u64::from(update.report.iteration));
    }
}

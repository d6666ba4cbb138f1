//! Progress reporting: spectrogram plots and experiment tracking

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use mlx_rs::Array;
use tracing::info;

use crate::error::Result;

/// Renders a progress plot of the model's current output.
pub trait ProgressPlotter<M> {
    /// Synthesize with `default_emb` and write a plot into `save_dir`.
    /// Returns the path of the written image.
    fn plot_progress(
        &mut self,
        model: &mut M,
        default_emb: &Array,
        save_dir: &Path,
        step: usize,
        lang: &str,
        run_flow: bool,
    ) -> Result<PathBuf>;
}

/// Sink for training metrics and images.
pub trait ExperimentTracker {
    fn log_metrics(&mut self, step: usize, metrics: &BTreeMap<String, f32>) -> Result<()>;

    fn log_image(&mut self, step: usize, name: &str, path: &Path) -> Result<()>;
}

/// Tracker that writes metrics to the `tracing` log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracker;

impl ExperimentTracker for TracingTracker {
    fn log_metrics(&mut self, step: usize, metrics: &BTreeMap<String, f32>) -> Result<()> {
        for (name, value) in metrics {
            info!(step, metric = %name, value, "Metric");
        }
        Ok(())
    }

    fn log_image(&mut self, step: usize, name: &str, path: &Path) -> Result<()> {
        info!(step, name, path = %path.display(), "Image");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_tracker_accepts_metrics_and_images() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let mut tracker = TracingTracker;
        let mut metrics = BTreeMap::new();
        metrics.insert("regression_loss".to_string(), 0.25f32);
        metrics.insert("learning_rate".to_string(), 1e-3f32);

        assert!(tracker.log_metrics(4, &metrics).is_ok());
        assert!(tracker.log_metrics(5, &BTreeMap::new()).is_ok());
        assert!(tracker
            .log_image(4, "progress_plot", Path::new("plots/4.png"))
            .is_ok());
    }
}

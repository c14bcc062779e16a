use crate::estimate::ClassFit;

/// Observer for reporting progress while the one-vs-all trainer runs.
///
/// Per-class fits may finish concurrently on different threads, so observers
/// receive shared references and must be `Sync`.
pub trait FitProgressObserver: Sync {
    fn on_fit_start(&self, num_classes: usize) {
        let _ = num_classes;
    }
    fn on_class_finished(&self, fit: &ClassFit) {
        let _ = fit;
    }
    fn on_fit_finish(&self) {}
}

#[derive(Default)]
pub struct NoopFitProgress;

impl FitProgressObserver for NoopFitProgress {}

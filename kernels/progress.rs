use std::fmt;

/// Iterative drivers that report progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IterativeAlgorithm {
    Kmeans,
    ImplicitAls,
}

impl IterativeAlgorithm {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Kmeans => "k-means refinement",
            Self::ImplicitAls => "implicit ALS training",
        }
    }
}

impl fmt::Display for IterativeAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress across the rounds of an iterative driver.
pub trait IterationObserver {
    fn on_start(&mut self, algorithm: IterativeAlgorithm, total_iterations: usize) {
        let _ = (algorithm, total_iterations);
    }
    /// `objective` is reported by drivers that track one.
    fn on_iteration(&mut self, algorithm: IterativeAlgorithm, completed: usize, objective: Option<f64>) {
        let _ = (algorithm, completed, objective);
    }
    fn on_finish(&mut self, algorithm: IterativeAlgorithm) {
        let _ = algorithm;
    }
}

#[derive(Default)]
pub struct NoopIterationObserver;

impl IterationObserver for NoopIterationObserver {}

/// Records every notification; used by tests to check round counts.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingObserver {
    pub events: Vec<(IterativeAlgorithm, usize)>,
    pub finished: bool,
}

#[cfg(test)]
impl IterationObserver for RecordingObserver {
    fn on_iteration(&mut self, algorithm: IterativeAlgorithm, completed: usize, _objective: Option<f64>) {
        self.events.push((algorithm, completed));
    }
    fn on_finish(&mut self, _algorithm: IterativeAlgorithm) {
        self.finished = true;
    }
}

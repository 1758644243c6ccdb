use crate::config::ClassifierConfig;
use crate::scheduler::{Quality, Stat};

/// Turns counter growth into a quality grade.
///
/// Implementations must be deterministic and monotonic: more loss never
/// yields a better grade.
pub trait QualityClassifier {
    /// Returns the new grade when it differs from `grade`, `None` otherwise
    /// (including when there is not enough evidence yet).
    fn classify(&self, previous: &Stat, current: &Stat, grade: Quality) -> Option<Quality>;
}

/// Grades by the share of distinct reports that were never acknowledged
/// since the baseline.
#[derive(Debug, Clone, Default)]
pub struct LossRatioClassifier {
    config: ClassifierConfig,
}

impl LossRatioClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Loss ratio over the delta, or `None` below `min_samples`.
    pub fn loss_ratio(&self, previous: &Stat, current: &Stat) -> Option<f64> {
        let delta = current.delta_since(previous);
        if delta.valid_sent < self.config.min_samples {
            return None;
        }
        // Late acks for keys sent before the baseline can push this past 1.
        let received = delta.valid_received.min(delta.valid_sent) as f64;
        Some(1.0 - received / delta.valid_sent as f64)
    }

    pub fn grade(&self, loss: f64) -> Quality {
        if loss <= self.config.excellent_loss_max {
            Quality::Excellent
        } else if loss <= self.config.good_loss_max {
            Quality::Good
        } else if loss <= self.config.fair_loss_max {
            Quality::Fair
        } else if loss <= self.config.poor_loss_max {
            Quality::Poor
        } else {
            Quality::Bad
        }
    }
}

impl QualityClassifier for LossRatioClassifier {
    fn classify(&self, previous: &Stat, current: &Stat, grade: Quality) -> Option<Quality> {
        let loss = self.loss_ratio(previous, current)?;
        let next = self.grade(loss);
        (next != grade).then_some(next)
    }
}

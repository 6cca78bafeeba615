// Copyright (c) 2024-present, microforest-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::Label;

/// Metric selection bitmask values.
pub mod metric {
    /// Overall accuracy
    pub const ACCURACY: u8 = 0x01;

    /// Macro-averaged precision
    pub const PRECISION: u8 = 0x02;

    /// Macro-averaged recall
    pub const RECALL: u8 = 0x04;

    /// Macro-averaged F1
    pub const F1_SCORE: u8 = 0x08;
}

/// Confusion-matrix driven score aggregator.
///
/// Tracks per-label TP/FP/FN counters; `calculate_score` averages the metric
/// subset selected by the bitmask. Labels with a zero denominator do not
/// contribute to the macro averages.
#[derive(Clone, Debug)]
pub struct MatrixScore {
    tp: Vec<u32>,
    fp: Vec<u32>,
    fn_: Vec<u32>,
    total: u32,
    correct: u32,
    num_labels: Label,
    metric_mask: u8,
}

impl MatrixScore {
    #[must_use]
    pub fn new(num_labels: Label, metric_mask: u8) -> Self {
        let n = usize::from(num_labels);
        Self {
            tp: vec![0; n],
            fp: vec![0; n],
            fn_: vec![0; n],
            total: 0,
            correct: 0,
            num_labels,
            metric_mask,
        }
    }

    /// Resets all counters.
    pub fn reset(&mut self) {
        self.tp.fill(0);
        self.fp.fill(0);
        self.fn_.fill(0);
        self.total = 0;
        self.correct = 0;
    }

    /// Records one prediction.
    pub fn update_prediction(&mut self, actual: Label, predicted: Label) {
        if actual >= self.num_labels || predicted >= self.num_labels {
            return;
        }

        self.total += 1;
        if predicted == actual {
            self.correct += 1;
            self.tp[usize::from(actual)] += 1;
        } else {
            self.fn_[usize::from(actual)] += 1;
            self.fp[usize::from(predicted)] += 1;
        }
    }

    /// Number of recorded predictions.
    #[must_use]
    pub fn total_predictions(&self) -> u32 {
        self.total
    }

    #[must_use]
    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.correct as f32 / self.total as f32
        }
    }

    fn precision_of(&self, label: usize) -> Option<f32> {
        let denom = self.tp[label] + self.fp[label];
        if denom == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(self.tp[label] as f32 / denom as f32)
    }

    fn recall_of(&self, label: usize) -> Option<f32> {
        let denom = self.tp[label] + self.fn_[label];
        if denom == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some(self.tp[label] as f32 / denom as f32)
    }

    fn macro_average(&self, per_label: impl Fn(usize) -> Option<f32>) -> f32 {
        let mut sum = 0.0f32;
        let mut valid = 0u32;
        for label in 0..usize::from(self.num_labels) {
            if let Some(v) = per_label(label) {
                sum += v;
                valid += 1;
            }
        }
        if valid == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                sum / valid as f32
            }
        }
    }

    /// Averages the metrics selected by the bitmask into a single score.
    #[must_use]
    pub fn calculate_score(&self) -> f32 {
        if self.total == 0 {
            log::warn!("no valid predictions recorded");
            return 0.0;
        }

        let mut combined = 0.0f32;
        let mut flags = 0u8;

        if self.metric_mask & metric::ACCURACY != 0 {
            combined += self.accuracy();
            flags += 1;
        }

        if self.metric_mask & metric::PRECISION != 0 {
            combined += self.macro_average(|l| self.precision_of(l));
            flags += 1;
        }

        if self.metric_mask & metric::RECALL != 0 {
            combined += self.macro_average(|l| self.recall_of(l));
            flags += 1;
        }

        if self.metric_mask & metric::F1_SCORE != 0 {
            combined += self.macro_average(|l| {
                let p = self.precision_of(l)?;
                let r = self.recall_of(l)?;
                if p + r > 0.0 {
                    Some(2.0 * p * r / (p + r))
                } else {
                    None
                }
            });
            flags += 1;
        }

        if flags == 0 {
            0.0
        } else {
            combined / f32::from(flags)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn score_perfect_accuracy() {
        let mut m = MatrixScore::new(2, metric::ACCURACY);
        for label in [0, 1, 0, 1] {
            m.update_prediction(label, label);
        }
        assert!((m.calculate_score() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn score_half_accuracy() {
        let mut m = MatrixScore::new(2, metric::ACCURACY);
        m.update_prediction(0, 0);
        m.update_prediction(0, 1);
        assert!((m.calculate_score() - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn score_skips_labels_without_support() {
        let mut m = MatrixScore::new(3, metric::RECALL);
        // Label 2 never appears as an actual, so it must not drag recall down
        m.update_prediction(0, 0);
        m.update_prediction(1, 1);
        assert!((m.calculate_score() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn score_combines_selected_metrics() {
        let mut m = MatrixScore::new(2, metric::ACCURACY | metric::F1_SCORE);
        m.update_prediction(0, 0);
        m.update_prediction(1, 1);
        m.update_prediction(1, 0);

        let score = m.calculate_score();
        assert!(score > 0.0 && score < 1.0);
    }

    #[test]
    fn score_ignores_out_of_range_labels() {
        let mut m = MatrixScore::new(2, metric::ACCURACY);
        m.update_prediction(5, 0);
        m.update_prediction(0, 9);
        assert_eq!(0, m.total_predictions());
    }
}

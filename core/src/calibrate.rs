//! Decision-threshold calibration.
//!
//! Chooses the threshold maximising training-set F-score by sweeping the
//! candidate split points of the sorted predictions. Starting from the
//! all-positive classification, each group of equal predictions is moved to
//! the negative side in turn; the earliest boundary achieving the best
//! F-score wins, and the threshold is the midpoint between that boundary's
//! prediction and the next higher distinct one.

use tracing::debug;

/// Default threshold for classifiers that were never calibrated.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

fn fscore(true_pos: f64, false_pos: f64, false_neg: f64) -> f64 {
    let precision = if true_pos + false_pos > 0.0 {
        true_pos / (true_pos + false_pos)
    } else {
        0.0
    };
    let recall = if true_pos + false_neg > 0.0 {
        true_pos / (true_pos + false_neg)
    } else {
        0.0
    };
    if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    }
}

/// Calibrate a decision threshold from `(predicted probability, label)`
/// pairs. Returns [`DEFAULT_THRESHOLD`] when no data is given.
pub fn calibrate_threshold(calib_data: &[(f64, u8)]) -> f64 {
    if calib_data.is_empty() {
        return DEFAULT_THRESHOLD;
    }

    let mut data: Vec<(f64, u8)> = calib_data.to_vec();
    data.sort_by(|(pa, _), (pb, _)| pa.partial_cmp(pb).unwrap_or(std::cmp::Ordering::Equal));

    // All pairs classified positive.
    let mut true_pos: f64 = data.iter().map(|(_, y)| *y as f64).sum();
    let mut false_pos: f64 = data.len() as f64 - true_pos;
    let mut false_neg: f64 = 0.0;
    let mut best_f = fscore(true_pos, false_pos, false_neg);
    let mut split_idx = 0usize;

    let mut idx = 0;
    while idx < data.len() {
        let pred = data[idx].0;
        let mut end = idx + 1;
        while end < data.len() && data[end].0 == pred {
            end += 1;
        }
        let group_pos: f64 = data[idx..end].iter().map(|(_, y)| *y as f64).sum();
        let group_len = (end - idx) as f64;

        true_pos -= group_pos;
        false_pos -= group_len - group_pos;
        false_neg += group_pos;

        let f = fscore(true_pos, false_pos, false_neg);
        if f > best_f {
            best_f = f;
            split_idx = end - 1;
        }
        idx = end;
    }

    let threshold = if split_idx + 1 < data.len() {
        0.5 * (data[split_idx].0 + data[split_idx + 1].0)
    } else {
        data[split_idx].0
    };
    debug!(threshold, best_f, "calibrated threshold");
    threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_lands_between_classes() {
        let data = [(0.1, 0), (0.2, 0), (0.6, 1), (0.9, 1)];
        let threshold = calibrate_threshold(&data);
        assert!(
            threshold > 0.2 && threshold < 0.6,
            "threshold {threshold} outside (0.2, 0.6)"
        );
    }

    #[test]
    fn threshold_is_midpoint_after_last_negative() {
        let data = [(0.1, 0), (0.2, 0), (0.6, 1), (0.8, 1)];
        let threshold = calibrate_threshold(&data);
        assert!((threshold - 0.4).abs() < 1e-12);
    }

    #[test]
    fn equal_predictions_move_as_one_group() {
        let data = [(0.3, 0), (0.3, 0), (0.9, 1), (0.9, 1)];
        let threshold = calibrate_threshold(&data);
        // The 0.3 group is dropped together: threshold splits 0.3 from 0.9.
        assert!((threshold - 0.6).abs() < 1e-12);
    }

    #[test]
    fn empty_input_keeps_the_default() {
        assert_eq!(calibrate_threshold(&[]), DEFAULT_THRESHOLD);
    }
}

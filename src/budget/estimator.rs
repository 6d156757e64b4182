//! Token estimation for budget admission.
//!
//! The guard requires a conservative estimator: realized counts must not
//! exceed the estimate on calibrated data, or reservation math under-holds.
//! The tiktoken estimate is padded upward to keep the bias non-negative.

use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, CoreBPE};

static CL100K: OnceLock<CoreBPE> = OnceLock::new();

fn get_cl100k() -> &'static CoreBPE {
    CL100K.get_or_init(|| cl100k_base().expect("Failed to load cl100k_base tokenizer"))
}

pub trait TokenEstimator: Send + Sync {
    /// Conservative token estimate for `text`; never underestimates on
    /// calibrated data.
    fn estimate(&self, text: &str) -> u64;
}

/// BPE-backed estimator with a safety pad on top of the raw count.
pub struct TiktokenEstimator {
    pad_ratio: f64,
}

impl TiktokenEstimator {
    pub fn new() -> Self {
        Self { pad_ratio: 1.1 }
    }

    pub fn with_pad_ratio(pad_ratio: f64) -> Self {
        Self {
            pad_ratio: pad_ratio.max(1.0),
        }
    }
}

impl Default for TiktokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> u64 {
        let raw = get_cl100k().encode_with_special_tokens(text).len();
        (raw as f64 * self.pad_ratio).ceil() as u64
    }
}

/// Fast chars-per-token heuristic. Dividing by a low chars-per-token keeps
/// the estimate on the high side for typical prose and code.
pub struct HeuristicEstimator {
    chars_per_token: usize,
}

impl HeuristicEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self::new(3)
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> u64 {
        text.len().div_ceil(self.chars_per_token) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiktoken_pads_above_raw_count() {
        let estimator = TiktokenEstimator::new();
        let text = "The quick brown fox jumps over the lazy dog.";
        let raw = get_cl100k().encode_with_special_tokens(text).len() as u64;
        assert!(estimator.estimate(text) >= raw);
    }

    #[test]
    fn test_heuristic_rounds_up() {
        let estimator = HeuristicEstimator::new(4);
        assert_eq!(estimator.estimate("abcde"), 2);
        assert_eq!(estimator.estimate(""), 0);
    }

    #[test]
    fn test_heuristic_default_overestimates_prose() {
        let estimator = HeuristicEstimator::default();
        // English prose runs ~4 chars/token; a 3-char divisor stays above.
        let text = "a reasonably ordinary English sentence for calibration";
        assert!(estimator.estimate(text) >= (text.len() / 4) as u64);
    }

    #[test]
    fn test_pad_ratio_floor_is_one() {
        let estimator = TiktokenEstimator::with_pad_ratio(0.5);
        let text = "hello world";
        let raw = get_cl100k().encode_with_special_tokens(text).len() as u64;
        assert!(estimator.estimate(text) >= raw);
    }
}

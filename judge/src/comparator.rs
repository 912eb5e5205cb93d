//! Output comparison
//!
//! Decides whether a program's output matches the expected answer under a
//! problem-specific mode. Comparison is total and deterministic; a truncated
//! output never matches.

use serde::{Deserialize, Serialize};

pub const DEFAULT_ABS_TOLERANCE: f64 = 1e-6;
pub const DEFAULT_REL_TOLERANCE: f64 = 1e-6;

fn default_abs_tolerance() -> f64 {
    DEFAULT_ABS_TOLERANCE
}

fn default_rel_tolerance() -> f64 {
    DEFAULT_REL_TOLERANCE
}

/// Comparison mode for a problem or a single test case
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CompareMode {
    /// Byte-for-byte after stripping one trailing newline
    Exact,
    /// Whitespace-separated token sequences must be equal
    #[default]
    Token,
    /// Tokens compared as numbers within tolerance, other tokens exactly
    Numeric {
        #[serde(default = "default_abs_tolerance")]
        abs_tolerance: f64,
        #[serde(default = "default_rel_tolerance")]
        rel_tolerance: f64,
    },
}

impl CompareMode {
    pub fn numeric() -> Self {
        CompareMode::Numeric {
            abs_tolerance: DEFAULT_ABS_TOLERANCE,
            rel_tolerance: DEFAULT_REL_TOLERANCE,
        }
    }
}

/// Compare program output with expected output.
///
/// `truncated` must be set when the output was capped by the executor; such
/// output is never accepted.
pub fn compare(expected: &str, actual: &str, truncated: bool, mode: &CompareMode) -> bool {
    if truncated {
        return false;
    }

    match mode {
        CompareMode::Exact => strip_one_newline(expected) == strip_one_newline(actual),
        CompareMode::Token => expected.split_whitespace().eq(actual.split_whitespace()),
        CompareMode::Numeric {
            abs_tolerance,
            rel_tolerance,
        } => {
            let mut expected_tokens = expected.split_whitespace();
            let mut actual_tokens = actual.split_whitespace();
            loop {
                match (expected_tokens.next(), actual_tokens.next()) {
                    (None, None) => return true,
                    (Some(e), Some(a)) => {
                        if !numeric_token_eq(e, a, *abs_tolerance, *rel_tolerance) {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }
        }
    }
}

fn strip_one_newline(s: &str) -> &str {
    s.strip_suffix('\n').unwrap_or(s)
}

fn parse_finite(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn numeric_token_eq(expected: &str, actual: &str, abs_tol: f64, rel_tol: f64) -> bool {
    match (parse_finite(expected), parse_finite(actual)) {
        (Some(e), Some(a)) => {
            let diff = (e - a).abs();
            diff <= abs_tol || diff <= rel_tol * e.abs()
        }
        _ => expected == actual,
    }
}

use serde::{Deserialize, Serialize};

/// Result of comparing captured output against expected output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputCheck {
    pub passed: bool,
    /// Expected lines with no containing actual line, in expected order.
    pub missing: Vec<String>,
    pub expected_lines: usize,
    pub actual_lines: usize,
}

/// Trims every line and drops the blank ones.
pub fn normalize_output(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Lenient comparison for noisy emulator output: each expected line must be
/// a substring of some actual line, in any order. With nothing expected the
/// check passes as long as the emulator printed anything at all.
pub fn check_output(actual: &str, expected: &str) -> OutputCheck {
    let actual = normalize_output(actual);
    let expected = normalize_output(expected);

    if expected.is_empty() {
        return OutputCheck {
            passed: !actual.is_empty(),
            missing: Vec::new(),
            expected_lines: 0,
            actual_lines: actual.len(),
        };
    }

    let missing: Vec<String> = expected
        .iter()
        .filter(|exp| !actual.iter().any(|act| act.contains(**exp)))
        .map(|exp| exp.to_string())
        .collect();

    OutputCheck {
        passed: missing.is_empty(),
        missing,
        expected_lines: expected.len(),
        actual_lines: actual.len(),
    }
}

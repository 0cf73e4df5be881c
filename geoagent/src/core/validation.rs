//! Attempt outcome classification.
//!
//! Success is the AND of three checks: the claimed output file exists, it is
//! non-empty, and stderr carries no traceback marker. The filesystem check is
//! done by the caller; this module only combines observations.

use crate::core::extract::has_traceback;
use crate::core::types::AttemptClass;

/// What the caller found at the path claimed by the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    /// No parseable sentinel on stdout.
    NotClaimed,
    Missing,
    Empty,
    Present,
}

/// Observed facts about one finished subprocess.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub timed_out: bool,
    pub stderr: &'a str,
    /// Traceback marker seen anywhere on stderr, including bytes past the
    /// capture limit.
    pub traceback_seen: bool,
    pub output: OutputStatus,
}

/// Classify with precedence timeout > traceback > missing sentinel > missing
/// file > empty file.
pub fn classify(obs: &Observation<'_>) -> AttemptClass {
    if obs.timed_out {
        return AttemptClass::Timeout;
    }
    if obs.traceback_seen || has_traceback(obs.stderr) {
        return AttemptClass::Traceback;
    }
    match obs.output {
        OutputStatus::NotClaimed => AttemptClass::MissingSentinel,
        OutputStatus::Missing => AttemptClass::OutputMissing,
        OutputStatus::Empty => AttemptClass::OutputEmpty,
        OutputStatus::Present => AttemptClass::Success,
    }
}

/// Error text fed into the next prompt: stderr when present, otherwise the
/// class's synthesized message.
pub fn attempt_error(class: AttemptClass, stderr: &str) -> String {
    if class == AttemptClass::Success {
        return String::new();
    }
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        class.synthesized_error().to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(timed_out: bool, stderr: &str, output: OutputStatus) -> Observation<'_> {
        Observation {
            timed_out,
            stderr,
            traceback_seen: false,
            output,
        }
    }

    #[test]
    fn success_requires_all_three_checks() {
        let statuses = [
            OutputStatus::NotClaimed,
            OutputStatus::Missing,
            OutputStatus::Empty,
            OutputStatus::Present,
        ];
        for status in statuses {
            for stderr in ["", "Traceback (most recent call last)"] {
                let class = classify(&obs(false, stderr, status));
                let expected = status == OutputStatus::Present && stderr.is_empty();
                assert_eq!(class == AttemptClass::Success, expected, "{status:?} {stderr:?}");
            }
        }
    }

    #[test]
    fn timeout_wins_over_everything() {
        let class = classify(&obs(true, "traceback", OutputStatus::Present));
        assert_eq!(class, AttemptClass::Timeout);
    }

    #[test]
    fn traceback_beats_missing_sentinel() {
        let class = classify(&obs(false, "TRACEBACK", OutputStatus::NotClaimed));
        assert_eq!(class, AttemptClass::Traceback);
    }

    #[test]
    fn traceback_beyond_captured_stderr_fails() {
        let class = classify(&Observation {
            timed_out: false,
            stderr: "UserWarning: layer has no CRS\n[stderr truncated 2600 bytes]",
            traceback_seen: true,
            output: OutputStatus::Present,
        });
        assert_eq!(class, AttemptClass::Traceback);
    }

    #[test]
    fn warnings_on_stderr_do_not_fail() {
        let class = classify(&obs(false, "DeprecationWarning: old api", OutputStatus::Present));
        assert_eq!(class, AttemptClass::Success);
    }

    #[test]
    fn error_prefers_stderr_then_synthesized() {
        assert_eq!(
            attempt_error(AttemptClass::Traceback, "  boom \n"),
            "boom"
        );
        assert_eq!(
            attempt_error(AttemptClass::OutputMissing, ""),
            "Generated code failed to save a valid output file."
        );
        assert_eq!(attempt_error(AttemptClass::Success, "noise"), "");
    }
}

//! Loop Detection
//!
//! Watches for an agent grinding in circles: the same tool call repeated
//! with the same outcome, the same tool call failing over and over, or the
//! same parse error bouncing back.  The engine consults the detector after
//! every step and applies the stuck protocol when it fires.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// Which detection rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopType {
    /// The last K `(tool, args, observation)` triples were identical.
    IdenticalToolCalls,
    /// The last K calls hit the same tool with the same arguments and kept
    /// failing with the same error class, even though the error text varied.
    RepeatedToolErrors,
    /// The last K `(error message, response prefix)` pairs were identical.
    RepeatedMessages,
}

impl LoopType {
    /// Tag used in events and stuck-protocol messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopType::IdenticalToolCalls => "identical_tool_calls",
            LoopType::RepeatedToolErrors => "repeated_tool_errors",
            LoopType::RepeatedMessages => "repeated_messages",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
struct ToolCallRecord {
    tool_name: String,
    args_hash: String,
    observation_hash: String,
    error_class: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
struct MessageRecord {
    error_hash: String,
    response_prefix_hash: String,
}

fn hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    // 16 bytes of the digest are plenty for window comparison.
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Coarse classification of an error observation: the first whitespace
/// token after the `"Error:"` prefix (a status code like `500`, or the
/// leading word of the message).  `None` for non-error observations.
///
/// Failing calls whose texts differ only in variable detail ("attempt 2",
/// a timestamp) share a class; genuinely unrelated failures do not.
fn error_class(observation: &str) -> Option<String> {
    observation
        .strip_prefix("Error:")
        .and_then(|rest| rest.split_whitespace().next())
        .map(|token| token.to_string())
}

/// Rolling-window loop detector.
///
/// `window_size` bounds both windows (default 8); `repeat_threshold` is the
/// K from the detection rules (default 3, minimum 3).
pub struct LoopDetector {
    tool_calls: VecDeque<ToolCallRecord>,
    messages: VecDeque<MessageRecord>,
    window_size: usize,
    repeat_threshold: usize,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(8, 3)
    }
}

impl LoopDetector {
    /// Create a detector with explicit window size and repeat threshold.
    pub fn new(window_size: usize, repeat_threshold: usize) -> Self {
        Self {
            tool_calls: VecDeque::new(),
            messages: VecDeque::new(),
            window_size: window_size.max(1),
            repeat_threshold: repeat_threshold.max(3),
        }
    }

    /// Record one executed tool call and its observation.
    pub fn record_tool_call(&mut self, tool_name: &str, args: &str, observation: &str) {
        if self.tool_calls.len() == self.window_size {
            self.tool_calls.pop_front();
        }
        self.tool_calls.push_back(ToolCallRecord {
            tool_name: tool_name.to_string(),
            args_hash: hash(args),
            observation_hash: hash(observation),
            error_class: error_class(observation),
        });
    }

    /// Record one non-action model exchange (parse error, invalid format).
    pub fn record_message(&mut self, error_message: &str, response: &str) {
        if self.messages.len() == self.window_size {
            self.messages.pop_front();
        }
        let prefix: String = response.chars().take(100).collect();
        self.messages.push_back(MessageRecord {
            error_hash: hash(error_message),
            response_prefix_hash: hash(&prefix),
        });
    }

    /// Whether either rule currently fires.
    pub fn is_looping(&self) -> bool {
        self.loop_type().is_some()
    }

    /// The rule that fired, if any.
    pub fn loop_type(&self) -> Option<LoopType> {
        let k = self.repeat_threshold;

        if self.tool_calls.len() >= k {
            let tail: Vec<&ToolCallRecord> =
                self.tool_calls.iter().rev().take(k).collect();
            if tail.windows(2).all(|w| w[0] == w[1]) {
                return Some(LoopType::IdenticalToolCalls);
            }
            let same_call = tail.windows(2).all(|w| {
                w[0].tool_name == w[1].tool_name && w[0].args_hash == w[1].args_hash
            });
            // The observations may differ in detail, but every one must be
            // an error of the same class.
            let same_error_class = tail[0].error_class.is_some()
                && tail.windows(2).all(|w| w[0].error_class == w[1].error_class);
            if same_call && same_error_class {
                return Some(LoopType::RepeatedToolErrors);
            }
        }

        if self.messages.len() >= k {
            let tail: Vec<&MessageRecord> = self.messages.iter().rev().take(k).collect();
            if tail.windows(2).all(|w| w[0] == w[1]) {
                return Some(LoopType::RepeatedMessages);
            }
        }

        None
    }

    /// Clear both windows.  Callers reset after issuing a corrective
    /// system-prompt injection.
    pub fn reset(&mut self) {
        self.tool_calls.clear();
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_identical_triples_loop() {
        let mut detector = LoopDetector::default();
        for _ in 0..2 {
            detector.record_tool_call("add", r#"{"a":1}"#, "2");
        }
        assert!(!detector.is_looping());
        detector.record_tool_call("add", r#"{"a":1}"#, "2");
        assert_eq!(detector.loop_type(), Some(LoopType::IdenticalToolCalls));
    }

    #[test]
    fn same_call_distinct_errors_of_one_class_loop() {
        let mut detector = LoopDetector::default();
        detector.record_tool_call("fetch", r#"{"url":"x"}"#, "Error: 500 upstream (attempt 1)");
        detector.record_tool_call("fetch", r#"{"url":"x"}"#, "Error: 500 upstream (attempt 2)");
        detector.record_tool_call("fetch", r#"{"url":"x"}"#, "Error: 500 upstream (attempt 3)");
        assert_eq!(detector.loop_type(), Some(LoopType::RepeatedToolErrors));
    }

    #[test]
    fn unrelated_error_classes_do_not_loop() {
        let mut detector = LoopDetector::default();
        detector.record_tool_call("fetch", r#"{"url":"x"}"#, "Error: timeout after 30s");
        detector.record_tool_call("fetch", r#"{"url":"x"}"#, "Error: invalid argument");
        detector.record_tool_call("fetch", r#"{"url":"x"}"#, "Error: permission denied");
        assert!(!detector.is_looping());
    }

    #[test]
    fn error_after_successes_does_not_loop() {
        let mut detector = LoopDetector::default();
        detector.record_tool_call("fetch", r#"{"url":"x"}"#, "ok");
        detector.record_tool_call("fetch", r#"{"url":"x"}"#, "still ok");
        detector.record_tool_call("fetch", r#"{"url":"x"}"#, "Error: timeout after 30s");
        assert!(!detector.is_looping());
    }

    #[test]
    fn varying_observations_do_not_loop() {
        let mut detector = LoopDetector::default();
        detector.record_tool_call("roll", "{}", "4");
        detector.record_tool_call("roll", "{}", "2");
        detector.record_tool_call("roll", "{}", "6");
        assert!(!detector.is_looping());
    }

    #[test]
    fn repeated_parse_errors_loop() {
        let mut detector = LoopDetector::default();
        for _ in 0..3 {
            detector.record_message("Unbalanced JSON braces", "Action: {\"tool\": ");
        }
        assert_eq!(detector.loop_type(), Some(LoopType::RepeatedMessages));
    }

    #[test]
    fn reset_clears_both_windows() {
        let mut detector = LoopDetector::default();
        for _ in 0..3 {
            detector.record_tool_call("add", "{}", "2");
            detector.record_message("bad", "bad");
        }
        assert!(detector.is_looping());
        detector.reset();
        assert!(!detector.is_looping());
    }

    #[test]
    fn window_evicts_old_records() {
        let mut detector = LoopDetector::new(3, 3);
        detector.record_tool_call("add", "{}", "different");
        detector.record_tool_call("add", "{}", "2");
        detector.record_tool_call("add", "{}", "2");
        detector.record_tool_call("add", "{}", "2");
        // The differing record has been evicted; the last three are equal.
        assert_eq!(detector.loop_type(), Some(LoopType::IdenticalToolCalls));
    }
}

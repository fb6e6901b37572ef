//! Marker-based readiness detection over a decoder's line output.
//!
//! The decoder's log format is not a contract, so readiness is decided by
//! substring markers rather than by parsing structured output.

use serde::{Deserialize, Serialize};

use super::supervisor::LineStream;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStage {
    Ready,
    Failed,
}

/// One `(stage, substring)` pair. Matching is case-sensitive containment.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Marker {
    pub stage: MarkerStage,
    pub pattern: String,
}

impl Marker {
    pub fn ready(pattern: impl Into<String>) -> Self {
        Self { stage: MarkerStage::Ready, pattern: pattern.into() }
    }

    pub fn failed(pattern: impl Into<String>) -> Self {
        Self { stage: MarkerStage::Failed, pattern: pattern.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Waiting,
    /// Carries the line that matched.
    Ready(String),
    Errored(ReadinessFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessFailure {
    /// A failure marker matched this line.
    Marker(String),
    /// Output ended before any marker matched.
    Eof,
}

impl std::fmt::Display for ReadinessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadinessFailure::Marker(line) => write!(f, "decoder reported failure: {}", line),
            ReadinessFailure::Eof => write!(f, "decoder output ended before it became ready"),
        }
    }
}

/// Waiting → Ready | Errored. Both outcomes are terminal; build a new
/// detector for every session attempt.
pub struct ReadinessDetector {
    markers: Vec<Marker>,
    state: Readiness,
    lines_seen: usize,
}

impl ReadinessDetector {
    pub fn new(markers: Vec<Marker>) -> Self {
        Self { markers, state: Readiness::Waiting, lines_seen: 0 }
    }

    #[cfg(test)]
    pub fn state(&self) -> &Readiness {
        &self.state
    }

    pub fn lines_seen(&self) -> usize {
        self.lines_seen
    }

    /// Feed one line. Lines arriving after a terminal state are ignored.
    pub fn feed(&mut self, line: &str) -> &Readiness {
        if self.state != Readiness::Waiting {
            return &self.state;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return &self.state;
        }
        self.lines_seen += 1;

        if let Some(marker) = self.markers.iter().find(|m| line.contains(m.pattern.as_str())) {
            self.state = match marker.stage {
                MarkerStage::Ready => Readiness::Ready(line.to_string()),
                MarkerStage::Failed => {
                    Readiness::Errored(ReadinessFailure::Marker(line.to_string()))
                }
            };
        }
        &self.state
    }

    /// The line stream ended.
    pub fn finish(&mut self) -> &Readiness {
        if self.state == Readiness::Waiting {
            self.state = Readiness::Errored(ReadinessFailure::Eof);
        }
        &self.state
    }

    /// Consume lines until a terminal state is reached. Cancel-safe: dropping
    /// the future loses no line that was not already fed.
    pub async fn watch(&mut self, lines: &mut LineStream) -> Readiness {
        loop {
            match lines.next_line().await {
                Some(line) => {
                    if self.feed(&line) != &Readiness::Waiting {
                        break;
                    }
                }
                None => {
                    self.finish();
                    break;
                }
            }
        }
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op25_markers() -> Vec<Marker> {
        vec![
            Marker::failed("Traceback (most recent call last):"),
            Marker::ready("Reconfiguring NAC"),
        ]
    }

    fn run(lines: &[&str]) -> ReadinessDetector {
        let mut detector = ReadinessDetector::new(op25_markers());
        for line in lines {
            detector.feed(line);
        }
        detector
    }

    #[test]
    fn ready_marker_after_noise() {
        let detector = run(&["booting", "Reconfiguring NAC 0x1a2"]);
        assert_eq!(detector.state(), &Readiness::Ready("Reconfiguring NAC 0x1a2".into()));
    }

    #[test]
    fn failure_before_ready_is_errored() {
        let detector = run(&[
            "booting",
            "Traceback (most recent call last):",
            "Reconfiguring NAC",
        ]);
        assert!(matches!(detector.state(), Readiness::Errored(ReadinessFailure::Marker(_))));
    }

    #[test]
    fn ready_is_sticky() {
        let detector = run(&[
            "Reconfiguring NAC",
            "Traceback (most recent call last):",
            "Reconfiguring NAC",
        ]);
        assert!(matches!(detector.state(), Readiness::Ready(_)));
        assert_eq!(detector.lines_seen(), 1);
    }

    #[test]
    fn blank_lines_do_not_count() {
        let detector = run(&["", "   ", "\r\n", "booting"]);
        assert_eq!(detector.state(), &Readiness::Waiting);
        assert_eq!(detector.lines_seen(), 1);
    }

    #[test]
    fn matching_is_case_sensitive() {
        let detector = run(&["reconfiguring nac"]);
        assert_eq!(detector.state(), &Readiness::Waiting);
    }

    #[test]
    fn first_listed_marker_wins_on_one_line() {
        let mut detector =
            ReadinessDetector::new(vec![Marker::ready("NAC"), Marker::failed("error")]);
        detector.feed("error while Reconfiguring NAC");
        assert!(matches!(detector.state(), Readiness::Ready(_)));
    }

    #[test]
    fn eof_while_waiting_is_errored() {
        let mut detector = run(&["booting"]);
        assert_eq!(detector.finish(), &Readiness::Errored(ReadinessFailure::Eof));
    }

    #[test]
    fn eof_after_ready_keeps_ready() {
        let mut detector = run(&["Reconfiguring NAC"]);
        assert!(matches!(detector.finish(), Readiness::Ready(_)));
    }
}

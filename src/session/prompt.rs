//! Interactive prompt detection
//!
//! A line is a prompt when it contains one of the configured literal
//! patterns. No regex grammar: patterns are short tokens such as `[Y/n]`.

/// Decides whether a line of tool output blocks on a yes/no answer
#[derive(Debug, Clone, Default)]
pub struct PromptDetector {
    patterns: Vec<String>,
}

impl PromptDetector {
    /// Create a detector from a pattern set; empty patterns are ignored
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True iff `line` contains any configured pattern
    pub fn is_prompt(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| line.contains(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> PromptDetector {
        PromptDetector::new(["(y)es (n)o", "[Y/n]", "[y/N]"])
    }

    #[test]
    fn test_detects_pattern_anywhere_in_line() {
        let detector = detector();
        assert!(detector.is_prompt("Do you want to continue? [Y/n] "));
        assert!(detector.is_prompt("[y/N]"));
        assert!(detector.is_prompt("- Submit update? (y)es (n)o (q)uit"));
    }

    #[test]
    fn test_ordinary_output_is_not_prompt() {
        let detector = detector();
        assert!(!detector.is_prompt("+ Target IP: 93.184.216.34"));
        assert!(!detector.is_prompt(""));
        assert!(!detector.is_prompt("yes no"));
    }

    #[test]
    fn test_match_is_literal_and_case_sensitive() {
        let detector = PromptDetector::new(["[Y/n]"]);
        assert!(!detector.is_prompt("[y/n]"));
        assert!(!detector.is_prompt("Y/n"));
    }

    #[test]
    fn test_empty_patterns_ignored() {
        let detector = PromptDetector::new(["", "[Y/n]"]);
        assert_eq!(detector.patterns().len(), 1);
        assert!(!detector.is_prompt("anything"));
    }

    #[test]
    fn test_no_patterns_never_matches() {
        let detector = PromptDetector::default();
        assert!(!detector.is_prompt("Continue? [Y/n]"));
    }
}

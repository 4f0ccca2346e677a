//! Word-set similarity loop detector: flags a session as stuck when its last
//! K non-JSON assistant-text messages are all pairwise similar to the first.

use std::collections::VecDeque;

/// Rolling window of recent assistant-text messages for one session.
pub struct LoopDetector {
    window: usize,
    similarity_threshold: f64,
    recent: VecDeque<String>,
}

impl LoopDetector {
    pub fn new(window: usize, similarity_threshold: f64) -> Self {
        Self { window, similarity_threshold, recent: VecDeque::with_capacity(window + 2) }
    }

    /// Record a new assistant-text message and report whether a loop is now
    /// detected (the last `window` messages are pairwise > threshold similar
    /// to the first of that window).
    pub fn push(&mut self, text: &str) -> bool {
        self.recent.push_back(text.to_string());
        while self.recent.len() > self.window + 2 {
            self.recent.pop_front();
        }
        self.is_looping()
    }

    pub fn is_looping(&self) -> bool {
        if self.recent.len() < self.window {
            return false;
        }
        let last_window: Vec<&String> = self.recent.iter().rev().take(self.window).collect();
        let first = last_window[self.window - 1];
        last_window[..self.window - 1]
            .iter()
            .all(|msg| word_set_similarity(first, msg) > self.similarity_threshold)
    }

    pub fn last_n(&self, n: usize) -> Vec<String> {
        self.recent.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }
}

fn word_set(text: &str) -> std::collections::HashSet<String> {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 2)
        .collect()
}

/// Intersection size over max set size; words of length <= 2 ignored;
/// case-folded. Returns 0.0 when both sets are empty.
pub fn word_set_similarity(a: &str, b: &str) -> f64 {
    let set_a = word_set(a);
    let set_b = word_set(b);
    let max_len = set_a.len().max(set_b.len());
    if max_len == 0 {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    intersection as f64 / max_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_of_identical_strings_is_one() {
        assert_eq!(word_set_similarity("retrying the build", "retrying the build"), 1.0);
    }

    #[test]
    fn similarity_ignores_short_words() {
        // "X" and "a" are length <= 2 and should be ignored from the set.
        let sim = word_set_similarity("retrying X now", "retrying Y later");
        assert!(sim > 0.0);
    }

    #[test]
    fn similarity_of_unrelated_strings_is_low() {
        let sim = word_set_similarity("implementing the login page", "running database migrations");
        assert!(sim < 0.3);
    }

    #[test]
    fn no_loop_detected_before_window_fills() {
        let mut detector = LoopDetector::new(5, 0.5);
        for msg in ["retrying X", "retrying X (2)", "retrying X again", "retrying X once more"] {
            assert!(!detector.push(msg));
        }
    }

    #[test]
    fn loop_detected_on_repetitive_messages() {
        let mut detector = LoopDetector::new(5, 0.5);
        let messages = [
            "retrying X",
            "retrying X (2)",
            "retrying X again",
            "retrying X once more",
            "retrying X now",
        ];
        let mut detected = false;
        for msg in messages {
            detected = detector.push(msg);
        }
        assert!(detected);
    }

    #[test]
    fn no_loop_when_messages_differ() {
        let mut detector = LoopDetector::new(5, 0.5);
        let messages = [
            "implementing the login form",
            "adding validation rules",
            "wiring up the database schema",
            "writing integration tests",
            "fixing a type error in the handler",
        ];
        let mut detected = false;
        for msg in messages {
            detected = detector.push(msg);
        }
        assert!(!detected);
    }

    #[test]
    fn last_n_returns_most_recent_in_order() {
        let mut detector = LoopDetector::new(5, 0.5);
        for msg in ["a message one", "b message two", "c message three"] {
            detector.push(msg);
        }
        let last_two = detector.last_n(2);
        assert_eq!(last_two, vec!["b message two".to_string(), "c message three".to_string()]);
    }

    #[test]
    fn clear_resets_window() {
        let mut detector = LoopDetector::new(5, 0.5);
        for msg in ["retrying X", "retrying X (2)", "retrying X again", "retrying X once more", "retrying X now"] {
            detector.push(msg);
        }
        assert!(detector.is_looping());
        detector.clear();
        assert!(!detector.is_looping());
    }
}

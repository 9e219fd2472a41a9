use std::collections::VecDeque;
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 100;

/// A bounded rolling buffer of a child process's stderr lines, per
/// `spec.md` §4.4 ("a rolling stderr buffer (bounded)").
pub struct StderrBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl StderrBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().rev().take(n).rev().cloned().collect()
    }
}

impl Default for StderrBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_lines_are_evicted_once_capacity_is_reached() {
        let buf = StderrBuffer::with_capacity(2);
        buf.push("a".into());
        buf.push("b".into());
        buf.push("c".into());
        assert_eq!(buf.tail(10), vec!["b".to_string(), "c".to_string()]);
    }
}

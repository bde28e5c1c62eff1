//! Stuck-loop detection over a sliding window of executed actions.

use std::collections::VecDeque;

use crate::action::Tool;
use crate::error::LoopDetected;

pub const DEFAULT_REPEAT_WINDOW: usize = 3;
pub const DEFAULT_THRASH_WINDOW: usize = 5;

/// One executed action as the guard remembers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub tool: Tool,
    pub target: String,
    pub success: bool,
}

impl HistoryRecord {
    pub fn new(tool: Tool, target: impl Into<String>, success: bool) -> Self {
        Self {
            tool,
            target: target.into(),
            success,
        }
    }
}

/// Two rules, both counting failures only:
///   - the last `repeat_window` records are the same failing (tool, target);
///   - the last `thrash_window` records all failed, whatever they were.
///
/// A success anywhere in the window breaks both.
#[derive(Debug, Clone)]
pub struct LoopGuard {
    repeat_window: usize,
    thrash_window: usize,
    history: VecDeque<HistoryRecord>,
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new(DEFAULT_REPEAT_WINDOW, DEFAULT_THRASH_WINDOW)
    }
}

impl LoopGuard {
    /// `thrash_window` is raised to `repeat_window + 1` if it is not larger.
    pub fn new(repeat_window: usize, thrash_window: usize) -> Self {
        let repeat_window = repeat_window.max(2);
        let thrash_window = thrash_window.max(repeat_window + 1);
        Self {
            repeat_window,
            thrash_window,
            history: VecDeque::with_capacity(thrash_window),
        }
    }

    /// Append a record and evaluate both rules.
    pub fn record(&mut self, record: HistoryRecord) -> Result<(), LoopDetected> {
        if self.history.len() == self.thrash_window {
            self.history.pop_front();
        }
        self.history.push_back(record);
        match self.check() {
            Some(detected) => Err(detected),
            None => Ok(()),
        }
    }

    pub fn check(&self) -> Option<LoopDetected> {
        if let Some(last) = self.recent(self.repeat_window).and_then(|window| {
            let first = *window.first()?;
            window
                .iter()
                .all(|r| !r.success && r.tool == first.tool && r.target == first.target)
                .then_some(first)
        }) {
            return Some(LoopDetected::Repeated {
                tool: last.tool,
                target: last.target.clone(),
                count: self.repeat_window,
            });
        }

        let window = self.recent(self.thrash_window)?;
        if window.iter().all(|r| !r.success) {
            let tools = window
                .iter()
                .map(|r| r.tool.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Some(LoopDetected::Thrashing {
                count: self.thrash_window,
                tools,
            });
        }
        None
    }

    /// Forget everything, e.g. after a human unstuck the task.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.history.iter()
    }

    fn recent(&self, n: usize) -> Option<Vec<&HistoryRecord>> {
        let len = self.history.len();
        (len >= n).then(|| self.history.range(len - n..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(tool: Tool, target: &str) -> HistoryRecord {
        HistoryRecord::new(tool, target, false)
    }

    fn ok(tool: Tool, target: &str) -> HistoryRecord {
        HistoryRecord::new(tool, target, true)
    }

    #[test]
    fn repeated_failure_raises_on_the_third() {
        let mut guard = LoopGuard::default();
        assert!(guard.record(fail(Tool::ClickElement, "#7")).is_ok());
        assert!(guard.record(fail(Tool::ClickElement, "#7")).is_ok());
        let err = guard.record(fail(Tool::ClickElement, "#7")).unwrap_err();
        assert_eq!(
            err,
            LoopDetected::Repeated {
                tool: Tool::ClickElement,
                target: "#7".into(),
                count: 3
            }
        );
    }

    #[test]
    fn varying_target_is_exploration() {
        let mut guard = LoopGuard::default();
        for target in ["#1", "#2", "#3", "#4"] {
            assert!(guard.record(fail(Tool::ClickElement, target)).is_ok());
        }
    }

    #[test]
    fn five_failures_of_any_kind_is_thrashing() {
        let mut guard = LoopGuard::default();
        guard.record(fail(Tool::ClickElement, "#1")).unwrap();
        guard.record(fail(Tool::TypeText, "#2")).unwrap();
        guard.record(fail(Tool::Navigate, "https://a.com")).unwrap();
        guard.record(fail(Tool::ClickElement, "#3")).unwrap();
        let err = guard.record(fail(Tool::SelectOption, "#4")).unwrap_err();
        assert!(matches!(err, LoopDetected::Thrashing { count: 5, .. }));
    }

    #[test]
    fn success_breaks_both_windows() {
        let mut guard = LoopGuard::default();
        guard.record(fail(Tool::ClickElement, "#7")).unwrap();
        guard.record(fail(Tool::ClickElement, "#7")).unwrap();
        guard.record(ok(Tool::ClickElement, "#7")).unwrap();
        guard.record(fail(Tool::ClickElement, "#7")).unwrap();
        guard.record(fail(Tool::ClickElement, "#7")).unwrap();
        assert!(guard.record(fail(Tool::ClickElement, "#7")).is_err());
    }

    #[test]
    fn repeated_successes_never_count() {
        let mut guard = LoopGuard::default();
        for _ in 0..10 {
            assert!(guard.record(ok(Tool::ScrollPage, "down")).is_ok());
        }
    }

    #[test]
    fn history_is_bounded_and_resettable() {
        let mut guard = LoopGuard::new(3, 5);
        for i in 0..8 {
            guard.record(ok(Tool::Wait, &i.to_string())).unwrap();
        }
        assert_eq!(guard.history().count(), 5);
        guard.reset();
        assert_eq!(guard.history().count(), 0);
    }

    #[test]
    fn thrash_window_stays_above_repeat_window() {
        let mut guard = LoopGuard::new(4, 3);
        for target in ["a", "b", "c", "d"] {
            assert!(guard.record(fail(Tool::ClickElement, target)).is_ok());
        }
        assert!(guard.record(fail(Tool::ClickElement, "e")).is_err());
    }
}

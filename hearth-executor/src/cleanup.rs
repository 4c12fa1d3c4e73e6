//! Partial-failure reporting for best-effort teardown.

use std::fmt;

use serde::Serialize;

/// One best-effort step that failed without failing the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupWarning {
    /// Step name, e.g. `undefine` or `remove_disk`.
    pub step: &'static str,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Warnings collected while tearing something down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Resource the report is about.
    pub target: String,
    pub warnings: Vec<CleanupWarning>,
}

impl CleanupReport {
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into(), warnings: Vec::new() }
    }

    /// Records and logs a warning.
    pub fn warn(&mut self, step: &'static str, message: impl fmt::Display) {
        let message = message.to_string();
        tracing::warn!(
            target_name = %self.target,
            step,
            error = %message,
            "cleanup step failed, continuing"
        );
        self.warnings.push(CleanupWarning { step, message });
    }

    /// Appends the warnings of another report without logging them again.
    pub fn merge(&mut self, other: CleanupReport) {
        self.warnings.extend(other.warnings);
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Returns `true` if any warning was recorded for `step`.
    #[must_use]
    pub fn has_step(&self, step: &str) -> bool {
        self.warnings.iter().any(|w| w.step == step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_collects_warnings_in_order() {
        let mut report = CleanupReport::new("alpha");
        assert!(report.is_clean());
        report.warn("force_stop", "domain not running");
        report.warn("undefine", "permission denied");
        assert!(!report.is_clean());
        assert!(report.has_step("undefine"));
        assert_eq!(report.warnings[0].to_string(), "force_stop: domain not running");
    }

    #[test]
    fn merged_report_serializes_for_callers() {
        let mut outer = CleanupReport::new("alpha");
        let mut inner = CleanupReport::new("alpha");
        inner.warn("undefine", "permission denied");
        outer.merge(inner);
        outer.warn("remove_disk", "read-only file system");

        let json = serde_json::to_value(&outer).expect("serialize");
        assert_eq!(json["target"], "alpha");
        assert_eq!(json["warnings"][0]["step"], "undefine");
        assert_eq!(json["warnings"][1]["message"], "read-only file system");
    }
}

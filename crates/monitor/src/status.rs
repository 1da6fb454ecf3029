use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized lifecycle label for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalStatus {
    Running,
    Queued,
    Completed,
    Failed,
    Canceled,
    Unknown,
}

impl CanonicalStatus {
    pub const ALL: [CanonicalStatus; 6] = [
        CanonicalStatus::Running,
        CanonicalStatus::Queued,
        CanonicalStatus::Completed,
        CanonicalStatus::Failed,
        CanonicalStatus::Canceled,
        CanonicalStatus::Unknown,
    ];

    /// Canonical lowercase name, accepted back by [`normalize`]
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalStatus::Running => "running",
            CanonicalStatus::Queued => "queued",
            CanonicalStatus::Completed => "completed",
            CanonicalStatus::Failed => "failed",
            CanonicalStatus::Canceled => "canceled",
            CanonicalStatus::Unknown => "unknown",
        }
    }

    /// Running or waiting to run
    pub fn is_active(&self) -> bool {
        matches!(self, CanonicalStatus::Running | CanonicalStatus::Queued)
    }

    /// Presentation priority: running first, then queued, then everything else
    pub fn priority(&self) -> u8 {
        match self {
            CanonicalStatus::Running => 2,
            CanonicalStatus::Queued => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map heterogeneous backend status fields onto [`CanonicalStatus`]
///
/// Precedence: a non-empty error always wins, then a failed/partial result,
/// then the lifecycle label. Total and pure; never panics.
pub fn normalize(
    raw_status: Option<&str>,
    error: Option<&str>,
    result_status: Option<&str>,
) -> CanonicalStatus {
    if error.map(|e| !e.trim().is_empty()).unwrap_or(false) {
        return CanonicalStatus::Failed;
    }

    if let Some(result) = result_status {
        let result = result.trim();
        // Partial counts as failed
        if result.eq_ignore_ascii_case("failed") || result.eq_ignore_ascii_case("partial") {
            return CanonicalStatus::Failed;
        }
    }

    match raw_status {
        Some(label) => map_label(label),
        None => CanonicalStatus::Unknown,
    }
}

fn map_label(label: &str) -> CanonicalStatus {
    match label.trim().to_ascii_lowercase().as_str() {
        "done" | "completed" => CanonicalStatus::Completed,
        "restored" | "pending" | "starting" | "queued" => CanonicalStatus::Queued,
        "running" => CanonicalStatus::Running,
        "failed" => CanonicalStatus::Failed,
        "canceled" | "cancelled" => CanonicalStatus::Canceled,
        _ => CanonicalStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status_label() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("running".to_string()),
            Just("queued".to_string()),
            Just("pending".to_string()),
            Just("starting".to_string()),
            Just("restored".to_string()),
            Just("done".to_string()),
            Just("completed".to_string()),
            Just("failed".to_string()),
            Just("canceled".to_string()),
            Just("cancelled".to_string()),
            Just("RUNNING".to_string()),
            "[a-z_]{0,12}",
        ]
    }

    fn result_label() -> impl Strategy<Value = Option<String>> {
        prop_oneof![
            Just(None),
            Just(Some("failed".to_string())),
            Just(Some("partial".to_string())),
            Just(Some("success".to_string())),
            "[a-z]{0,8}".prop_map(Some),
        ]
    }

    #[test]
    fn test_table_mappings() {
        assert_eq!(normalize(Some("done"), None, None), CanonicalStatus::Completed);
        assert_eq!(normalize(Some("restored"), None, None), CanonicalStatus::Queued);
        assert_eq!(normalize(Some("pending"), None, None), CanonicalStatus::Queued);
        assert_eq!(normalize(Some("starting"), None, None), CanonicalStatus::Queued);
        assert_eq!(normalize(Some("running"), None, None), CanonicalStatus::Running);
        assert_eq!(normalize(Some("canceled"), None, None), CanonicalStatus::Canceled);
        assert_eq!(normalize(Some("transcoding"), None, None), CanonicalStatus::Unknown);
        assert_eq!(normalize(None, None, None), CanonicalStatus::Unknown);
    }

    #[test]
    fn test_stale_error_dominates_queued_label() {
        assert_eq!(
            normalize(Some("queued"), Some("worker exited with 1"), None),
            CanonicalStatus::Failed
        );
    }

    #[test]
    fn test_blank_error_is_ignored() {
        assert_eq!(normalize(Some("running"), Some("   "), None), CanonicalStatus::Running);
    }

    #[test]
    fn test_partial_result_is_failed() {
        assert_eq!(normalize(Some("done"), None, Some("partial")), CanonicalStatus::Failed);
        assert_eq!(normalize(Some("done"), None, Some("success")), CanonicalStatus::Completed);
    }

    #[test]
    fn test_canonical_names_round_trip() {
        for status in CanonicalStatus::ALL {
            assert_eq!(normalize(Some(status.as_str()), None, None), status);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Normalizing an already-normalized status changes nothing
        #[test]
        fn test_normalize_is_idempotent(
            label in status_label(),
            error in proptest::option::of("[a-z ]{0,10}"),
            result in result_label(),
        ) {
            let once = normalize(Some(&label), error.as_deref(), result.as_deref());
            let twice = normalize(Some(once.as_str()), None, None);
            prop_assert_eq!(once, twice);
        }

        /// A non-empty error forces failed no matter what else is set
        #[test]
        fn test_error_forces_failed(
            label in proptest::option::of(status_label()),
            error in "[a-z]{1,20}",
            result in result_label(),
        ) {
            prop_assert_eq!(
                normalize(label.as_deref(), Some(&error), result.as_deref()),
                CanonicalStatus::Failed
            );
        }
    }
}

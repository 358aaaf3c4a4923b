//! Name and label derivation for cluster resources.

use chrono::DateTime;
use chrono::Days;
use chrono::Utc;
use rand::Rng as _;
use rand::rngs::ThreadRng;

/// The label carrying the date a resource becomes eligible for cleanup.
///
/// A bulk `delete ... -l delete_by=<today>` reaps everything past its
/// retention window.
pub const DELETE_BY_LABEL: &str = "delete_by";

/// A name suffix generator.
pub trait Generator {
    /// Generates a new suffix.
    fn generate(&self) -> String;
}

/// An alphanumeric suffix generator.
pub struct Alphanumeric {
    /// The length of the generated suffix.
    length: usize,
}

impl Default for Alphanumeric {
    fn default() -> Self {
        Self { length: 8 }
    }
}

impl Generator for Alphanumeric {
    fn generate(&self) -> String {
        let mut rng = ThreadRng::default();

        (&mut rng)
            .sample_iter(&rand::distr::Alphanumeric)
            .take(self.length)
            .map(char::from)
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }
}

/// Derives a pod name from a task name and a unique suffix.
///
/// The suffix keeps retried runs of the same task from colliding on the
/// previous pod's name.
pub fn pod_name(task_name: &str, suffix: &str) -> String {
    format!(
        "{name}-{suffix}",
        name = task_name.trim().to_lowercase().replace(' ', "-")
    )
}

/// Formats the cleanup label value for a resource created now.
///
/// Recomputed on every call; a value cached across midnight would tag new
/// resources with a stale date.
pub fn expiration_label(now: DateTime<Utc>, retention_days: i64) -> String {
    now.checked_add_days(Days::new(retention_days.max(0) as u64))
        .unwrap_or(now)
        .format("%Y%m%d")
        .to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn pod_names_are_lowered_and_suffixed() {
        assert_eq!(pod_name("Pheno Analysis", "a1b2c3"), "pheno-analysis-a1b2c3");
        assert_eq!(pod_name("  task ", "x"), "task-x");
    }

    #[test]
    fn expiration_label_adds_retention_days() {
        let now = Utc.with_ymd_and_hms(2024, 12, 30, 23, 59, 0).unwrap();
        assert_eq!(expiration_label(now, 3), "20250102");
        assert_eq!(expiration_label(now, 0), "20241230");
    }

    #[test]
    fn generated_suffixes_are_lowercase_and_sized() {
        let suffix = Alphanumeric::default().generate();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_uppercase()));
    }
}

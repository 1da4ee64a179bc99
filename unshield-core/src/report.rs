use serde::{Deserialize, Serialize};

/// Outcome of one deprotection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionReport {
    pub protections_found: u32,
    pub unknown_file_count: usize,
    pub new_listfile_entries_found: usize,
    /// Entries whose payload could not be decoded. They are left out of the output.
    #[serde(default)]
    pub unreadable_file_count: usize,
    /// Non-zero when the output is likely unusable in the editor.
    pub critical_warning_count: u32,
    pub warnings: Vec<String>,
}

impl ProtectionReport {
    pub fn protection(&mut self) {
        self.protections_found += 1;
    }

    /// Appends a warning unless the same text is already present.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }

    pub fn unreadable(&mut self, label: &str, reason: impl std::fmt::Display) {
        self.unreadable_file_count += 1;
        self.warn(format!(
            "WARNING: {label} could not be extracted ({reason}) and is missing from the deprotected map"
        ));
    }

    pub fn critical(&mut self, message: impl Into<String>) {
        self.critical_warning_count += 1;
        self.warn(message);
    }
}

#[cfg(test)]
mod tests {
    use super::ProtectionReport;

    #[test]
    fn warnings_keep_first_occurrence_order() {
        let mut report = ProtectionReport::default();
        report.warn("b");
        report.warn("a");
        report.warn("b");
        report.critical("a");
        assert_eq!(report.warnings, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(report.critical_warning_count, 1);
    }
}

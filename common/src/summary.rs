/// Wall-clock time spent in each pipeline stage.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StageTimes {
    pub enumerate: std::time::Duration,
    pub compare: std::time::Duration,
    pub upload: std::time::Duration,
    pub reconcile: std::time::Duration,
}

/// Durations rounded to milliseconds, e.g. `1s 250ms`.
#[must_use]
pub fn format_duration(duration: std::time::Duration) -> humantime::FormattedDuration {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    humantime::format_duration(std::time::Duration::from_millis(millis))
}

#[derive(Debug, Copy, Clone, Default)]
pub struct Summary {
    pub files_found: u64,
    pub files_rejected: u64,
    pub files_unchanged: u64,
    pub upload_candidates: u64,
    pub compare_failed: u64,
    pub files_uploaded: u64,
    pub bytes_uploaded: u64,
    pub upload_failed: u64,
    pub remote_objects_listed: u64,
    pub delete_candidates: u64,
    pub objects_deleted: u64,
    pub delete_failed: u64,
    pub times: StageTimes,
    pub total_time: std::time::Duration,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files found: {}\n\
            files rejected: {}\n\
            files unchanged: {}\n\
            compare failures: {}\n\
            upload candidates: {}\n\
            files uploaded: {}\n\
            bytes uploaded: {}\n\
            upload failures: {}\n\
            remote objects listed: {}\n\
            delete candidates: {}\n\
            objects deleted: {}\n\
            delete failures: {}\n\
            -----------------------\n\
            enumerate time: {}\n\
            compare time: {}\n\
            upload time: {}\n\
            reconcile time: {}\n\
            total time: {}\n",
            self.files_found,
            self.files_rejected,
            self.files_unchanged,
            self.compare_failed,
            self.upload_candidates,
            self.files_uploaded,
            bytesize::ByteSize(self.bytes_uploaded),
            self.upload_failed,
            self.remote_objects_listed,
            self.delete_candidates,
            self.objects_deleted,
            self.delete_failed,
            format_duration(self.times.enumerate),
            format_duration(self.times.compare),
            format_duration(self.times.upload),
            format_duration(self.times.reconcile),
            format_duration(self.total_time),
        )
    }
}

/// Outcome of one sync run.
#[derive(Debug, Clone)]
pub struct Report {
    pub summary: Summary,
    /// Every recorded failure, in the order it was recorded.
    pub errors: Vec<String>,
}

impl Report {
    #[must_use]
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Process exit status: 0 iff no error was recorded.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    /// The `ERRORS:` block alone, empty when the run succeeded.
    #[must_use]
    pub fn errors_block(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }
        let mut block = format!("ERRORS ({}):\n", self.errors.len());
        for error in &self.errors {
            block.push_str("  ");
            block.push_str(error);
            block.push('\n');
        }
        block
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.summary)?;
        write!(f, "{}", self.errors_block())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_exit_status_follows_errors() {
        let report = Report {
            summary: Summary::default(),
            errors: vec![],
        };
        assert!(report.success());
        assert_eq!(report.exit_code(), 0);
        assert!(!report.to_string().contains("ERRORS"));
        let report = Report {
            summary: Summary::default(),
            errors: vec!["/r/a.txt: ServiceUnavailable".to_string()],
        };
        assert_eq!(report.exit_code(), 1);
        let text = report.to_string();
        assert!(text.contains("ERRORS (1):\n  /r/a.txt: ServiceUnavailable\n"));
    }

    #[test]
    fn summary_renders_sizes_and_times() {
        let summary = Summary {
            files_uploaded: 3,
            bytes_uploaded: 2048,
            times: StageTimes {
                upload: std::time::Duration::from_micros(1_250_400),
                ..Default::default()
            },
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.contains("files uploaded: 3\n"));
        assert!(text.contains("bytes uploaded: 2"));
        assert!(text.contains("upload time: 1s 250ms\n"));
    }
}

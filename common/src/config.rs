//! Configuration types for runtime, throttling and output settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open local files (None = 80% of system limit, Some(0) = no limit)
    pub max_open_files: Option<usize>,
    /// Remote requests per second (0 = no throttle)
    pub ops_throttle: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output, per-item lines and the final report
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print the summary at the end
    pub print_summary: bool,
}

/// How periodic progress is displayed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProgressType {
    /// `ProgressBar` when stderr is a terminal, `TextUpdates` otherwise
    #[default]
    Auto,
    ProgressBar,
    TextUpdates,
}

impl std::str::FromStr for ProgressType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "auto" => Ok(ProgressType::Auto),
            "progressbar" => Ok(ProgressType::ProgressBar),
            "textupdates" => Ok(ProgressType::TextUpdates),
            _ => Err(format!(
                "invalid progress type {value:?}, expected one of: Auto, ProgressBar, TextUpdates"
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    /// Resolves `Auto` and the default delay for the chosen display.
    pub fn resolve(
        &self,
        stderr_is_terminal: bool,
    ) -> anyhow::Result<(ProgressType, std::time::Duration)> {
        let progress_type = match self.progress_type {
            ProgressType::Auto if stderr_is_terminal => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        };
        let delay = match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|err| anyhow::anyhow!("invalid progress delay {delay:?}: {err}"))?,
            None if progress_type == ProgressType::ProgressBar => {
                std::time::Duration::from_millis(200)
            }
            None => std::time::Duration::from_secs(10),
        };
        Ok((progress_type, delay))
    }
}

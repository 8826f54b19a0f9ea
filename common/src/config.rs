//! Configuration types for runtime and output settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Default directive for the log filter, overridden by `RUST_LOG` when set.
    pub fn log_directive(&self) -> &'static str {
        if self.quiet {
            return "off";
        }
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directive() {
        let mut output = OutputConfig::default();
        assert_eq!(output.log_directive(), "error");
        output.verbose = 1;
        assert_eq!(output.log_directive(), "info");
        output.verbose = 2;
        assert_eq!(output.log_directive(), "debug");
        output.verbose = 5;
        assert_eq!(output.log_directive(), "trace");
        output.quiet = true;
        assert_eq!(output.log_directive(), "off");
    }
}

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use rstage_tools_rstage::settings::{RawConfig, Settings, parse_assignment};
use tracing::instrument;

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Stage, package and unpack a release on the selected server
    Deploy,
    /// Verify the local and remote binaries a release needs are installed
    Check,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rstage",
    version,
    about = "Stage a revision with hard links, package it and unpack it on a remote host",
    long_about = "`rstage` materializes a source revision in a local staging directory, runs an optional build \
step, removes excluded paths, packages the tree into a single archive and unpacks it into the \
release directory of a remote host. The local archive and staging directory are always removed.

EXAMPLE:
    # Deploy revision abc123 using a configuration file
    rstage deploy --config deploy.json --revision abc123 --summary

    # Override configuration values on the command line
    rstage deploy --config deploy.json --set copy_compression=bzip2 --set rsync_exclude='*.log'

Note: exclusion patterns are matched per path relative to the cache root during the copy-cache \
walk (`*` crosses `/`), and against the staging root during the exclusion sweep (`*` stops at \
`/`)."
)]
struct Args {
    #[command(subcommand)]
    action: Action,

    // Configuration
    /// JSON configuration file
    #[arg(
        short = 'c',
        long,
        value_name = "PATH",
        global = true,
        help_heading = "Configuration"
    )]
    config: Option<std::path::PathBuf>,

    /// Override a configuration value (can be specified multiple times)
    ///
    /// List values (rsync_exclude, rsync_server) are appended to.
    #[arg(
        long = "set",
        value_name = "KEY=VALUE",
        value_parser = parse_assignment,
        action = clap::ArgAction::Append,
        global = true,
        help_heading = "Configuration"
    )]
    overrides: Vec<(String, String)>,

    /// Revision to deploy, overrides the configured one
    #[arg(
        short = 'r',
        long,
        value_name = "REV",
        global = true,
        help_heading = "Configuration"
    )]
    revision: Option<String>,

    // Output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true, help_heading = "Output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Output")]
    quiet: bool,

    // Advanced settings
    /// Maximum number of open files, 0 means no limit, leaving unspecified means using 80% of max open files system limit
    #[arg(
        long,
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_open_files: Option<usize>,

    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        global = true,
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

fn load_settings(args: &Args) -> Result<Settings> {
    let mut raw = match &args.config {
        Some(path) => RawConfig::from_file(path)?,
        None => RawConfig::default(),
    };
    for (key, value) in &args.overrides {
        raw.set(key, value)?;
    }
    let mut settings = Settings::resolve(raw)?;
    settings.max_open_files = args.max_open_files;
    Ok(settings)
}

// overrides may carry scm_password
#[instrument(skip_all)]
async fn async_main(args: Args) -> Result<String> {
    let settings = load_settings(&args)?;
    let strategy = rstage_tools_rstage::Strategy::new(settings)?;
    match args.action {
        Action::Deploy => {
            let revision = strategy.revision(args.revision.as_deref())?;
            let selector = remote::select::selector(strategy.settings().server_selection);
            let summary = strategy.deploy(&revision, selector.as_ref()).await?;
            Ok(summary.to_string())
        }
        Action::Check => {
            let summary = strategy.check().await?;
            if !summary.is_ok() {
                return Err(anyhow!("missing dependencies\n\n{}", &summary));
            }
            Ok(summary.to_string())
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

mod digest;
mod report;
mod suite;

use clap::Parser;
use digest::DigestChannel;
use labwired_utest_config::PlatformConfig;
use labwired_utest_core::{channel, Channel, Platform};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

const EXIT_FAILURES: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the platform profile (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging of every jump and flush
    #[arg(short, long)]
    trace: bool,

    /// Directory to write result.json and junit.xml into
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Only run cases in this group
    #[arg(short, long)]
    group: Option<String>,

    /// Run each test in a separate process (not available on this platform)
    #[arg(short = 'p', long)]
    separate_process: bool,

    /// List the built-in cases and exit
    #[arg(long)]
    list: bool,
}

type ReportPlatform = Platform<DigestChannel<Box<dyn Channel>>>;

fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the test report.
    let level = if args.trace {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let runner = suite::conformance()
        .with_group_filter(args.group.clone())
        .with_separate_process(args.separate_process);

    if args.list {
        for case in runner.cases() {
            println!("{}.{}", case.group, case.name);
        }
        return ExitCode::SUCCESS;
    }

    let (config, platform) = match load_platform(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    info!("Running {} conformance cases", runner.cases().count());
    let summary = runner.run(&platform);
    if let Err(e) = platform.shutdown() {
        error!("Final flush failed: {}", e);
    }
    info!(
        passed = summary.passed,
        failed = summary.failed,
        checks = summary.checks,
        "Run finished"
    );

    if let Some(dir) = &args.output_dir {
        let digest = platform.output().with(|out| out.channel().hex_digest());
        let result = report::RunResult::new(&summary, &config, platform.output_stats(), digest);
        if let Err(e) = report::write_artifacts(dir, &result) {
            error!("{:#}", e);
            return ExitCode::from(EXIT_FAILURES);
        }
    }

    if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILURES)
    }
}

fn load_platform(args: &Args) -> anyhow::Result<(PlatformConfig, ReportPlatform)> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading platform profile: {:?}", path);
            PlatformConfig::from_file(path)?
        }
        None => {
            info!("Using default platform profile");
            PlatformConfig::default()
        }
    };

    let channel = DigestChannel::new(channel::from_config(&config.channel)?);
    let platform = Platform::with_config(&config, channel)?;
    Ok((config, platform))
}

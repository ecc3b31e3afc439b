use clap::Parser;
use orthobatch::{BatchArgs, FrameEngine, LogConfig, RunOutcome, Verbosity};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};

/// Orthorectify images with known DEM and camera model.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Source image path(s) or pattern(s), followed by the DEM file and the
    /// camera position and orientation file.
    #[arg(
        value_name = "SRC_IM_FILE... DEM_FILE POS_ORI_FILE",
        num_args = 3..,
        required = true
    )]
    paths: Vec<String>,

    /// Write ortho image(s) to this directory instead of beside the source.
    #[arg(short, long, value_name = "ORTHO_DIR")]
    ortho_dir: Option<PathBuf>,

    /// Read a custom configuration from this path.
    #[arg(short, long, value_name = "READ_CONF")]
    read_conf: Option<PathBuf>,

    /// Write the configuration to this path and exit.
    #[arg(short, long, value_name = "WRITE_CONF")]
    write_conf: Option<PathBuf>,

    /// Logging level: 1=debug, 2=info, 3=warning, 4=error.
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=4))]
    verbosity: u8,

    /// Number of images to process at once.
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    /// Write a JSON report of the batch to this path.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

impl From<Args> for BatchArgs {
    fn from(mut args: Args) -> Self {
        // clap guarantees at least three paths.
        let pose_file = args.paths.pop().unwrap_or_default();
        let dem = args.paths.pop().unwrap_or_default();
        let verbosity = Verbosity::try_from(args.verbosity).unwrap_or_default();

        Self {
            src_patterns: args.paths,
            dem: dem.into(),
            pose_file: pose_file.into(),
            ortho_dir: args.ortho_dir,
            read_conf: args.read_conf,
            write_conf: args.write_conf,
            jobs: args.jobs,
            report: args.report,
            log: LogConfig::from(verbosity),
        }
    }
}

fn main() -> ExitCode {
    let args = BatchArgs::from(Args::parse());
    args.log.init();

    let engine = FrameEngine::new(&args.log);
    match orthobatch::run(&args, &engine) {
        Ok(RunOutcome::ConfigWritten(_)) => ExitCode::SUCCESS,
        Ok(RunOutcome::Completed(report)) => {
            info!(
                "Finished {} image(s): {} succeeded, {} skipped",
                report.len(),
                report.succeeded(),
                report.skipped()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

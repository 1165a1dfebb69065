use std::{fs, path::PathBuf, process::ExitCode};

use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rsofs::{check, CheckOpts};

/// Check a SOFS11 volume for consistency.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
	/// Path to the backing device file
	#[arg(short = 'f', long = "file")]
	device: PathBuf,

	/// Duplicate the report (or the failure) into this log file
	#[arg(short, long)]
	log: Option<PathBuf>,

	#[command(flatten)]
	verbose: Verbosity<WarnLevel>,
}

fn main() -> ExitCode {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let opts = CheckOpts {
		logfile: cli.log.clone(),
	};
	match check(&cli.device, &opts) {
		Ok(report) => {
			for line in report.lines() {
				println!("{line}");
			}
			println!("{}: clean", cli.device.display());
			ExitCode::SUCCESS
		}
		Err(e) => {
			eprintln!("{}: {e}", cli.device.display());
			if let Some(path) = &cli.log {
				let _ = fs::write(path, format!("{}: {e}\n", cli.device.display()));
			}
			ExitCode::FAILURE
		}
	}
}

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rsofs::{format, FormatOpts};

/// Format a backing file as a SOFS11 volume.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
	/// Volume name
	#[arg(short, long, default_value = "")]
	name: String,

	/// Number of inodes; defaults to one per eight blocks
	#[arg(short, long)]
	inodes: Option<u32>,

	/// Zero-fill the payload of every free cluster
	#[arg(short, long)]
	zero: bool,

	#[command(flatten)]
	verbose: Verbosity<WarnLevel>,

	/// Path to the backing device file
	device: PathBuf,
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::builder()
		.filter_level(cli.verbose.log_level_filter())
		.init();

	let geo = format(
		&cli.device,
		&FormatOpts {
			name:   cli.name.clone(),
			itotal: cli.inodes,
			zero:   cli.zero,
		},
	)?;

	if cli.verbose.log_level_filter() > log::LevelFilter::Error {
		println!(
			"{}: {} blocks, {} inodes, {} data clusters",
			cli.device.display(),
			geo.ntotal,
			geo.itotal,
			geo.dzone_total
		);
	}
	Ok(())
}

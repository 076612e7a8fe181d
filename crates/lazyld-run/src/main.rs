mod logger;

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use lazyld::{Loader, LoaderConfig};
use log::LevelFilter;

use crate::logger::StderrLogger;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run an ELF executable, paging its segments in on first touch", long_about = None)]
struct Args {
    /// Statically linked ELF executable
    program: PathBuf,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Stack size for the program, in bytes
    #[arg(long, default_value_t = lazyld::config::DEFAULT_STACK_SIZE)]
    stack_size: usize,

    /// More loader output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match (args.quiet, args.verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Warn,
        (false, 1) => LevelFilter::Info,
        (false, _) => LevelFilter::Debug,
    };
    StderrLogger::new(level)
        .init()
        .context("Failed to install logger")?;

    // argv[0] is the program path itself
    let mut argv = Vec::with_capacity(args.args.len() + 1);
    argv.push(
        CString::new(args.program.as_os_str().as_bytes())
            .with_context(|| format!("Program path contains NUL: {:?}", args.program))?,
    );
    for a in &args.args {
        argv.push(CString::new(a.as_str()).with_context(|| format!("Argument contains NUL: {a:?}"))?);
    }

    let config = LoaderConfig::detect().stack_size(args.stack_size);
    let mut loader = Loader::new(config);
    loader
        .install_fault_handler()
        .context("Failed to set up demand paging")?;

    let report = loader
        .execute(&args.program, &argv)
        .with_context(|| format!("Failed to run {:?}", args.program))?;

    // Only reachable if the program handed control back.
    log::info!(
        "program returned: {} faults served, {} pages released",
        report.faults.resolved,
        report.release.released
    );
    Ok(())
}

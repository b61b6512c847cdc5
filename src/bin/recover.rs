//! `recover` — resolve a path inside one volume of an APFS container and
//! write the file's bytes to standard output.

use std::fs::File;
use std::io::{self, BufReader};
use std::process::ExitCode;

use clap::Parser;

/// Recover a file's contents from a raw APFS container image.
#[derive(Parser, Debug)]
#[command(name = "recover")]
struct Args {
    /// Path to the container image (regular file or block device)
    container: String,

    /// Index into the container's volume array
    volume_index: usize,

    /// Path of the file within the volume, e.g. /Users/me/hello.txt
    path: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> apfs::Result<()> {
    log::info!("opening {} (volume {})", args.container, args.volume_index);
    let file = File::open(&args.container)?;
    let reader = BufReader::new(file);

    let mut volume = apfs::ApfsVolume::open_volume(reader, Some(args.volume_index))?;
    log::info!("mounted volume '{}'", volume.volume_info().name);

    let stdout = io::stdout();
    let mut handle = stdout.lock();
    let written = volume.read_file_to(&args.path, &mut handle)?;
    log::info!("wrote {written} bytes for {}", args.path);
    Ok(())
}

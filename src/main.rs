use std::path::PathBuf;

use clap::Parser;
use owo_colors::Style;

use wznx::convert::{convert_file, output_path, Options};
use wznx::error::WzError;

use crate::colors::ErrStyle;

mod colors;

/// WZ to NX archive converter.
#[derive(Parser, Debug)]
#[clap(about = "Converts WZ archives into NX files", version, disable_help_flag = true)]
struct Wz2Nx {
    /// Emit bitmap and audio payloads (the default).
    #[clap(short = 'c', long, conflicts_with = "server")]
    client: bool,
    /// Omit bitmap and audio payloads.
    #[clap(short = 's', long)]
    server: bool,
    /// Compress bitmaps with the high-compression LZ4 mode.
    #[clap(short = 'h', long = "high-compression")]
    high_compression: bool,
    /// Print help.
    #[clap(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
    /// Archives to convert: .wz for full archives, .img for bare imgs.
    #[clap(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> Result<(), WzError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Wz2Nx::parse();
    let opts = Options {
        client: !args.server,
        high_compression: args.high_compression,
    };

    let mut bad_paths = false;
    for file in &args.files {
        if !file.is_file() {
            eprintln!(
                "{}: not a regular file",
                file.display().errstyle(Style::new().red())
            );
            bad_paths = true;
            continue;
        }
        let output = output_path(file);
        println!("{} -> {}", file.display(), output.display());
        convert_file(file, &output, &opts)?;
    }
    if bad_paths {
        std::process::exit(1);
    }
    Ok(())
}

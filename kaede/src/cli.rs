use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "kaede", about = "headless shell for the kaede emulator")]
pub struct Cli {
    /// Guest image to load (.kxe container)
    pub image: PathBuf,

    /// Stop after this many emulation steps (run until shutdown otherwise)
    #[arg(long)]
    pub steps: Option<u64>,

    /// Pretend the output cannot accept frames (the run loop presents
    /// blank frames and throttles instead of executing guest code)
    #[arg(long)]
    pub no_output: bool,
}

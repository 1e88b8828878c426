mod cli;
mod frontend;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kaede_core::cpu::NullCpu;
use kaede_core::{StepOutcome, System};

use crate::cli::Cli;
use crate::frontend::HeadlessFrontend;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let args = Cli::parse();

    let mut frontend = HeadlessFrontend::new(!args.no_output);
    let mut system = System::load(&mut frontend, &args.image, Box::new(NullCpu))
        .with_context(|| format!("loading {}", args.image.display()))?;
    info!(title = system.title(), "booting");

    let controller = system.controller();
    controller.set_running(true);

    let mut steps: u64 = 0;
    loop {
        match system.run_loop() {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::ShutdownRequested) => break,
            Err(e) => {
                // The caller decides: a single faulting step ends a
                // headless run.
                tracing::error!("emulation fault: {e}");
                break;
            }
        }
        steps += 1;
        if args.steps.is_some_and(|limit| steps >= limit) {
            system.request_shutdown();
        }
    }

    system.shutdown();
    info!(
        steps,
        frames = frontend.frames(),
        cycles = system.timing().ticks(),
        "done"
    );
    Ok(())
}

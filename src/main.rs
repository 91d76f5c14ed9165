mod backend;
mod cli;
mod logging;
mod model;
mod orchestrator;
mod progress;
mod storage;
mod text_summary;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    let is_non_tui = args.is_non_tui() || cfg!(not(feature = "tui"));

    let target = if is_non_tui {
        logging::LogTarget::Stderr
    } else {
        logging::LogTarget::File
    };
    if let Err(e) = logging::init(target) {
        if !is_silent {
            eprintln!("logging disabled: {e}");
        }
    }

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0 on success, especially for non-TUI modes
            if is_non_tui {
                std::process::exit(0);
            }
            Ok(())
        }
        Err(e) => {
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}

//! Main entry point for the archive-io CLI app

use archive_io::cli::{self, commands, Commands};
use tracing_subscriber::EnvFilter;

fn main() -> std::process::ExitCode {
    if let Err(e) = run_app() {
        if e.downcast_ref::<clap::Error>().is_none() {
            eprintln!("Error: {}", e);
        }
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

/// Logs go to stderr so `list` output stays clean. `-v` wins over `RUST_LOG`.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::run()?;
    init_logging(args.verbose);

    match &args.command {
        Commands::Pack { input, output, stats, .. } => {
            let options = args.command.parallel_options().ok_or("pack options unavailable")?;
            let summary = commands::pack(input, output, options)?;
            println!("Packed {} entries into {}", summary.entries, output.display());
            if *stats {
                match summary.stats {
                    Some(stats) => println!("{stats}"),
                    None => println!("No blocking statistics: {} is not written in parallel", output.display()),
                }
            }
        }
        Commands::List { archive } => {
            for name in commands::list(archive)? {
                println!("{name}");
            }
        }
        Commands::Extract { archive, output } => {
            let count = commands::extract(archive, output)?;
            println!("Extracted {count} entries into {}", output.display());
        }
        Commands::Convert { source, dest } => {
            let count = commands::convert(source, dest)?;
            println!("Copied {count} entries into {}", dest.display());
        }
    }

    Ok(())
}

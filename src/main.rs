//! Main entry point for the repack CLI app

use repack::cli::{self, Commands};
use repack::progress::{ConsoleObserver, NoopObserver, Observer};
use repack::{archive::NO_DATA, compress, extract};
use tracing_subscriber::EnvFilter;

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_app() {
        if e.downcast_ref::<clap::Error>().is_none() {
            eprintln!("Error: {}", e);
        }
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

fn observer(progress: bool) -> Box<dyn Observer> {
    if progress {
        Box::new(ConsoleObserver::new())
    } else {
        Box::new(NoopObserver)
    }
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    let command = cli::run()?;

    match &command {
        Commands::Pack { source, output, progress, .. } => {
            let options = command.pack_options().unwrap_or_default();
            compress::pack_with(source, output, &options, observer(*progress).as_ref())?;
        }
        Commands::Unpack { archive, output, progress } => {
            extract::unpack_with(archive, output, observer(*progress).as_ref())?;
        }
        Commands::List { archive } => {
            let header = extract::read_header(archive)?;
            println!("{:>6} {:>6} {:<17} {:>10}  name", "id", "parent", "kind", "offset");
            for (i, record) in header.folders.iter().enumerate() {
                let offset = if record.data_ref == NO_DATA { "-".to_string() } else { record.data_ref.to_string() };
                println!("{:>6} {:>6} {:<17} {:>10}  {}", i + 1, record.parent_id, format!("{:?}", record.kind), offset, record.name);
            }
            println!(
                "{} records, {} blobs, {} payload bytes",
                header.folders.len(),
                header.data.len(),
                header.total_payload_size
            );
        }
    }

    Ok(())
}

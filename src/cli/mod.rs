use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::compress::PackOptions;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Pack a directory tree into a new archive.
    #[command(alias = "p")]
    Pack {
        /// The directory to pack.
        #[arg(required = true)]
        source: PathBuf,

        /// The path for the output archive file. Must not exist yet.
        #[arg(short, long)]
        output: PathBuf,

        /// LZMA compression preset (0-9). Falls back to REPACK_LEVEL, then 8.
        #[arg(long, env = "REPACK_LEVEL", value_parser = clap::value_parser!(u32).range(0..=9))]
        level: Option<u32>,

        /// Also write the decoded header as `<ARCHIVE>.header.json` and the raw header as `<ARCHIVE>.header`.
        #[arg(long)]
        dump_header: bool,

        /// Print progress messages to stdout.
        #[arg(long)]
        progress: bool,
    },

    /// Unpack an archive into a new directory.
    #[command(alias = "u")]
    Unpack {
        /// The archive file to unpack.
        #[arg(required = true)]
        archive: PathBuf,

        /// The directory to create. Must not exist yet.
        #[arg(short, long)]
        output: PathBuf,

        /// Print progress messages to stdout.
        #[arg(long)]
        progress: bool,
    },

    /// List the records of an archive without unpacking it.
    #[command(alias = "l")]
    List {
        /// The archive file to list.
        #[arg(required = true)]
        archive: PathBuf,
    },
}

impl Commands {
    /// Pack options for a `pack` command, `None` for anything else.
    pub fn pack_options(&self) -> Option<PackOptions> {
        match self {
            Commands::Pack { level, dump_header, .. } => {
                let mut options = PackOptions::default();
                if let Some(level) = level {
                    options.level = *level;
                }
                options.dump_header = *dump_header;
                Some(options)
            }
            _ => None,
        }
    }
}

/// Parses command-line arguments using `clap` and returns the command to execute.
pub fn run() -> Result<Commands, Box<dyn std::error::Error>> {
    let args = Args::parse();
    Ok(args.command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_flags_become_options() {
        let args = Args::try_parse_from(["repack", "pack", "src", "-o", "out.rpk", "--level", "3", "--dump-header"]).unwrap();
        let options = args.command.pack_options().unwrap();
        assert_eq!(options.level, 3);
        assert!(options.dump_header);
    }

    #[test]
    fn level_out_of_range_is_rejected() {
        assert!(Args::try_parse_from(["repack", "pack", "src", "-o", "out.rpk", "--level", "10"]).is_err());
    }

    #[test]
    fn unpack_requires_output() {
        assert!(Args::try_parse_from(["repack", "unpack", "a.rpk"]).is_err());
        let args = Args::try_parse_from(["repack", "unpack", "a.rpk", "-o", "dir"]).unwrap();
        assert!(args.command.pack_options().is_none());
    }
}

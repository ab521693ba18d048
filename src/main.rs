use clap::{Parser, Subcommand};
use ofpx::sniff;
use ofpx::Extractor;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ofpx", about = "Oppo/OnePlus/Realme firmware container extractor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a firmware container (.ofp, .ops, or plain ZIP)
    Extract {
        input: PathBuf,
        /// Output directory (default: `extract` next to the container)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Print key-trial and per-entry progress
        #[arg(short, long)]
        verbose: bool,
    },
    /// Decrypt and print the manifest XML without extracting
    Manifest {
        input: PathBuf,
    },
    /// Report the detected container flavour
    Sniff {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, output_dir, verbose } => {
            let mut extractor = Extractor::new(&input);
            if verbose {
                extractor = extractor.with_log(|line| eprintln!("{line}"));
            }
            let out = extractor.extract(output_dir.as_deref())?;
            println!("Extracted to: {}", out.display());
        }

        // ── Manifest ─────────────────────────────────────────────────────────
        Commands::Manifest { input } => {
            let xml = Extractor::new(&input)
                .with_log(|line| eprintln!("{line}"))
                .manifest_xml()?;
            println!("{xml}");
        }

        // ── Sniff ────────────────────────────────────────────────────────────
        Commands::Sniff { input } => {
            let kind = sniff::detect_kind(&input)?;
            println!("{}: {:?}", input.display(), kind);
        }
    }
    Ok(())
}

// CLI application
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use loopfuse_cli::commands::{analyze_file, fuse_file, print_stats, resolve_config, ConfigOverrides};
use loopfuse_core::config::{AnchorStrategy, ChainPolicy};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "loopfuse")]
#[command(about = "Loop fusion for SSA control-flow graphs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Report which adjacent loop pairs could be fused, without changing anything
    Analyze {
        /// Function (or list of functions) in JSON
        #[arg(short, long)]
        input: PathBuf,

        /// Path to a JSON pass configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Anchor loop: `first` or `header:<label>`
        #[arg(long)]
        anchor: Option<AnchorStrategy>,

        /// Write the reports as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Run loop fusion and write the transformed functions
    Fuse {
        /// Function (or list of functions) in JSON
        #[arg(short, long)]
        input: PathBuf,

        /// Output path for the transformed functions
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Path to a JSON pass configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Chain policy: `single-pair` or `greedy-chain`
        #[arg(long)]
        policy: Option<ChainPolicy>,

        /// Anchor loop: `first` or `header:<label>`
        #[arg(long)]
        anchor: Option<AnchorStrategy>,

        /// Maximum number of fusion attempts per function
        #[arg(long)]
        max_chain: Option<usize>,

        /// Print each function before and after the pass
        #[arg(long)]
        trace: bool,

        /// Write the reports as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            input,
            config,
            anchor,
            report,
        } => {
            let overrides = ConfigOverrides {
                anchor,
                ..ConfigOverrides::default()
            };
            let config = resolve_config(config.as_deref(), &overrides)?;
            let pb = create_progress_bar("Analyzing loops...");
            let reports = analyze_file(&input, &config, report.as_deref());
            pb.finish_with_message("Analysis complete");
            reports?;
        }
        Commands::Fuse {
            input,
            output,
            config,
            policy,
            anchor,
            max_chain,
            trace,
            report,
        } => {
            let overrides = ConfigOverrides {
                policy,
                anchor,
                max_chain,
                trace,
            };
            let config = resolve_config(config.as_deref(), &overrides)?;
            let pb = create_progress_bar("Fusing loops...");
            let reports = fuse_file(&input, output.as_deref(), &config, report.as_deref());
            pb.finish_with_message("Fusion complete");
            let reports = reports?;
            let fused = reports.iter().filter(|r| r.modified).count();
            log::info!("{} of {} function(s) modified", fused, reports.len());
        }
    }

    print_stats();
    Ok(())
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(message.to_string());
    pb
}

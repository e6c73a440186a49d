use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true, help = "Seed for random number generation")]
    pub seed: Option<u64>,
    #[arg(
        short,
        long,
        global = true,
        help = "Override the configured duration, in seconds"
    )]
    pub duration: Option<f64>,
    #[arg(
        short,
        long,
        global = true,
        help = "Override the configured number of worker threads"
    )]
    pub threads: Option<usize>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Live mode: pace packet deadlines against the wall clock
    Run {
        #[arg(short, long, default_value = "flowgen.yaml", help = "Run configuration (YAML or JSON)")]
        config: String,
    },
    /// Offline mode: run the virtual clock as fast as possible
    Simulate {
        #[arg(short, long, default_value = "flowgen.yaml", help = "Run configuration (YAML or JSON)")]
        config: String,
        #[arg(short, long, default_value_t = false, help = "Print every packet record")]
        verbose: bool,
    },
}

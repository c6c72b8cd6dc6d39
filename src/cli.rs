use clap::Parser;
use std::path::PathBuf;

use crate::config::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "chat-bench")]
#[command(author, version, about = "Measure chat-completion throughput of a vLLM or SGLang server", long_about = None)]
pub struct Cli {
    /// Server IP address [default: 127.0.0.1]
    #[arg(long)]
    pub ip: Option<String>,

    /// Server port [default: 9000]
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum number of requests in flight [default: 1]
    #[arg(long = "batch_size", alias = "batch-size")]
    pub batch_size: Option<usize>,

    /// Optional TOML configuration file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// JSONL prompt file used instead of the built-in question set
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Write the JSON report to this file
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

use anyhow::Result;
use chat_bench::{Cli, Config};
use log::{debug, info};
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let config = Config::from_cli(&cli)?;

    if let Some(mut drain) = chat_bench::logging::init(&config)? {
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(Duration::from_millis(50));
                let _ = drain.flush();
            }
        });
    }

    if !config.output.quiet {
        println!("Chat Completion Benchmark");
        if let Some(ref path) = cli.config {
            println!("   Config: {}", path.display());
        }
        println!("   Target: {}", config.endpoint.base_url());
        println!("   Batch size: {}", config.load.batch_size);
        match &config.input.file {
            Some(path) => println!("   Prompts: {}", path.display()),
            None => println!("   Prompts: built-in ({:?})", config.input.set),
        }
        println!();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads)
        .enable_all()
        .build()?;

    let result = runtime.block_on(async { run_benchmark(config).await });

    // Give the drain a chance to write out the final records
    std::thread::sleep(Duration::from_millis(100));
    result
}

async fn run_benchmark(config: Config) -> Result<()> {
    debug!("Initializing benchmark runner");
    let runner = chat_bench::BenchmarkRunner::new(config).await?;
    info!("Starting benchmark run");
    runner.run().await?;
    info!("Benchmark completed successfully");
    Ok(())
}

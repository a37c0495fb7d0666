use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use solovm::cli::{Cli, Command};
use solovm::config::ConfigStore;
use solovm::logging;
use solovm::orchestrator::{Orchestrator, RunOutcome};

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let terminal_filter = if cli.verbose {
        EnvFilter::new("solovm=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("solovm=info"))
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures solovm=debug, discards until a VM is selected
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("solovm=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let tools = cli.toolchain();
    tools.check()?;

    let store = ConfigStore::new(cli.vm_dir());
    let orchestrator = Orchestrator::new(store, tools).with_log(file_handle);

    match cli.command.unwrap_or(Command::Up) {
        Command::Up => match orchestrator.run().await? {
            RunOutcome::AlreadyRunning { name } => {
                println!("{} VM '{name}' is already running", style("●").green());
            }
            RunOutcome::Completed { name } => {
                println!("{} VM '{name}' has shut down", style("✓").green());
            }
        },
        Command::Status { name, json } => {
            let status = orchestrator.status(name.as_deref())?;
            if json {
                let text = facet_json::to_string(&status)
                    .map_err(|e| miette::miette!("serializing status: {e:?}"))?;
                println!("{text}");
            } else {
                let state = if status.running {
                    style("running").green()
                } else {
                    style("stopped").dim()
                };
                println!("VM '{}': {state}", status.name);
                println!("  SSH port: {}", status.ssh_port);
                println!("  Disk: {}", status.img_file);
                println!("  Seed: {}", status.seed_file);
            }
        }
        Command::Args { name } => {
            let argv = orchestrator.command_line(name.as_deref())?;
            println!("{}", argv.join(" "));
        }
    }

    Ok(())
}

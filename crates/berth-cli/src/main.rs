mod commands;

use clap::{Parser, Subcommand};
use commands::simulate::SimulateOptions;
use commands::{DEFINITION_ERROR_PREFIX, EXIT_DEFINITION_ERROR, EXIT_FAILURE};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "berth",
    version,
    about = "Node-local agent that keeps managed containers converged with their definitions"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse and validate definition files.
    Validate {
        /// Definition TOML files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show which replicas applying a definition would create, update, or destroy.
    Plan {
        /// Definition to apply.
        file: PathBuf,
        /// The definition currently applied for the same group and name.
        #[arg(long)]
        previous: Option<PathBuf>,
        /// Highest replica index currently running (defaults to the previous replica count).
        #[arg(long)]
        highest: Option<u32>,
    },
    /// Apply definitions to an in-memory engine and report where they settle.
    Simulate {
        /// Definition TOML files, applied in order.
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Agent configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Template value for placeholders, as kind.group.id.key=value.
        #[arg(long = "value")]
        values: Vec<String>,
        /// Generated container name that crashes right after every start.
        #[arg(long)]
        crash: Vec<String>,
        /// Make the first runs of a container fail, as name=count.
        #[arg(long)]
        fail_runs: Vec<String>,
        /// Treat every readiness check as passing instead of calling operators.
        #[arg(long, default_value_t = false)]
        assume_ready: bool,
        /// Seconds to wait for every container to settle.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("BERTH_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let json_output = cli.json;
    let result = match cli.command {
        Commands::Validate { files } => commands::validate::run(&files, json_output),
        Commands::Plan {
            file,
            previous,
            highest,
        } => commands::plan::run(&file, previous.as_deref(), highest, json_output),
        Commands::Simulate {
            files,
            config,
            values,
            crash,
            fail_runs,
            assume_ready,
            timeout,
        } => commands::simulate::run(
            &SimulateOptions {
                files,
                config,
                values,
                crash,
                fail_runs,
                assume_ready,
                timeout: Duration::from_secs(timeout),
            },
            json_output,
        ),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with(DEFINITION_ERROR_PREFIX) {
                EXIT_DEFINITION_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

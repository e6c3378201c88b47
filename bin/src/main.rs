use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::Parser;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use prefork_core::{install_signal_handlers, Supervisor, SupervisorConfig};

/// prefork - pre-forking cluster supervisor
#[derive(Parser, Debug)]
#[command(name = "prefork")]
#[command(about = "run a pool of worker processes sharing listening sockets")]
struct Cli {
    /// Log level: error, warn, info, debug, trace.
    #[arg(short = 'l', long = "log", default_value = "debug")]
    log: String,

    /// Log to a file instead of stdout.
    #[arg(short = 'f', long = "file")]
    file: Option<PathBuf>,

    /// Number of workers to spawn.
    #[arg(short = 'w', long = "workers", default_value_t = num_cpus::get())]
    workers: usize,

    /// Worker program to run in every pool member.
    script: String,

    /// Arguments after `--` are forwarded verbatim to every worker.
    #[arg(last = true)]
    args: Vec<String>,
}

fn parse_cli() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            std::process::exit(0);
        }
        Err(e) => {
            eprint!("{e}");
            std::process::exit(1);
        }
    }
}

/// set up the global subscriber, the guard must outlive main
fn init_logging(cli: &Cli) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_new(&cli.log).unwrap_or_else(|_| {
        eprintln!("warning: invalid log level '{}', using debug", cli.log);
        EnvFilter::new("debug")
    });
    match &cli.file {
        Some(path) => {
            let file = match std::fs::File::create(path) {
                Ok(file) => file,
                Err(e) => {
                    eprintln!("error: cannot open log file {}: {e}", path.display());
                    std::process::exit(1);
                }
            };
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stdout)
                .init();
            None
        }
    }
}

fn main() {
    let cli = parse_cli();
    let _guard = init_logging(&cli);

    let mut worker_command = vec![cli.script.clone()];
    worker_command.extend(cli.args.iter().cloned());
    let config = SupervisorConfig::new(worker_command).with_workers(cli.workers);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("prefork")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: cannot build runtime: {e}");
            std::process::exit(1);
        }
    };

    let workers = cli.workers;
    let code = runtime.block_on(async move {
        let supervisor = match Supervisor::new(config) {
            Ok(supervisor) => supervisor,
            Err(e) => {
                error!("{e}");
                return 1;
            }
        };
        if let Err(e) = supervisor.start(workers).await {
            error!("{e}");
            return 1;
        }
        let _signals = install_signal_handlers(supervisor.clone());
        match supervisor.wait().await {
            Ok(()) => 0,
            Err(e) => {
                error!("run ended with error: {e}");
                1
            }
        }
    });
    std::process::exit(code);
}

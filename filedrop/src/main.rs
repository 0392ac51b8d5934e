use clap::Parser;
use filedrop::{config::Config, store, supervisor, web};
use filedrop_log::error;
use std::{path::PathBuf, process::exit};

/// Privilege-separated anonymous file-drop service.
#[derive(Debug, Parser)]
#[command(name = "filedropd", version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Internal: run as the named child process.
    #[arg(long = "fork-child", value_name = "ROLE", hide = true)]
    fork_child: Option<String>,

    /// Verbose logging.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("filedropd: cannot load configuration: {}", err);
            exit(1);
        }
    };

    let role = args.fork_child.as_deref();
    let name = match role {
        None => "filedropd",
        Some("store") => "store",
        Some("webserver") => "webserver",
        Some(unknown) => {
            eprintln!("filedropd: unknown child process {:?}", unknown);
            exit(1);
        }
    };

    // Children emit JSON records on stderr for the supervisor to pick up;
    // the parent itself logs human-readable text.
    let log_config = filedrop_log::Config {
        json: role.is_some(),
        verbose: args.verbose,
    };
    let log_guard = match role {
        None => filedrop_log::sync_logger(name, &log_config),
        Some(_) => filedrop_log::async_logger(name, &log_config).await,
    };
    let _log_guard = match log_guard {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("filedropd: cannot set up logging: {}", err);
            exit(1);
        }
    };

    let result = match role {
        None => supervisor::run(&config).await,
        Some("store") => store::run(&config).await,
        Some("webserver") => web::run(&config).await,
        Some(_) => unreachable!(),
    };

    if let Err(err) = result {
        error!("Fatal error"; "error" => err.to_string());

        // Flush the logger before exiting non-zero.
        drop(_log_guard);
        exit(1);
    }
}

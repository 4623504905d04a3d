//! `colcalc` -- compute calc columns over record containers.
//!
//! Every command prints its JSON response to stdout. Logs go to stderr.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use colcalc::config::Config;
use colcalc::service::Service;
use colcalc::transform::{CancelToken, TransformRequest};

#[derive(Parser, Debug)]
#[command(name = "colcalc", about = "Sandboxed calc columns for record containers", version)]
struct Cli {
    /// Configuration file. Defaults are used when it does not exist.
    #[arg(long, short, env = "COLCALC_CONFIG", default_value = "colcalc.yaml")]
    config: PathBuf,

    /// Log specification, as in `info` or `colcalc::transform=trace`.
    #[arg(long, env = "COLCALC_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a transformation described by a JSON request file, `-` for stdin.
    Transform { request: PathBuf },

    /// Reload the allow-list of builtin functions and types.
    ReloadBuiltins,

    /// Reload the allow-list of importable modules.
    ReloadImports,

    /// Compile a formula against the allow-lists and explain any errors.
    Check { formula: String },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let _logger = flexi_logger::Logger::try_with_str(&cli.log)
        .context("invalid log specification")?
        .log_to_stderr()
        .format(colcalc::log_format)
        .start()
        .context("cannot start logging")?;

    let config = Config::load(&cli.config)?;
    let service = Service::open(config)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    let handled = ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            std::process::exit(130);
        }
        log::warn!("interrupted, cancelling");
        handler_token.cancel();
    });
    if let Err(error) = handled {
        log::warn!("cannot install interrupt handler: {error}");
    }

    let (response, code) = match cli.command {
        Command::Transform { request } => {
            let request = read_request(&request)?;
            let response = service.transform(&request, &cancel);
            let code = response.error_code;
            (serde_json::to_string_pretty(&response)?, code)
        }
        Command::ReloadBuiltins => {
            let response = service.reload_builtins();
            let code = response.error_code;
            (serde_json::to_string_pretty(&response)?, code)
        }
        Command::ReloadImports => {
            let response = service.reload_imports();
            let code = response.error_code;
            (serde_json::to_string_pretty(&response)?, code)
        }
        Command::Check { formula } => {
            let response = service.check(&formula);
            let code = if response.valid { 0 } else { 2 };
            (serde_json::to_string_pretty(&response)?, code)
        }
    };

    println!("{response}");
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

fn read_request(path: &Path) -> anyhow::Result<TransformRequest> {
    let text = if path.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("cannot read request from stdin")?;
        text
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("cannot read request {}", path.display()))?
    };
    serde_json::from_str(&text).context("malformed transform request")
}

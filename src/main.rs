use std::io::Write as _;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::runtime::{Builder, Runtime};
use tracing::level_filters::LevelFilter;

use flotilla::connection::CheckCodeProvider;
use flotilla::net::DefaultClientFactory;
use flotilla::types::{ClientTypeTag, PrinterIdentity};
use flotilla::{start_flotilla, ConnectionMode, StartupOptions};

/// CLI argument parsing is an external collaborator (spec §6.2); the library
/// never reads `std::env::args` itself.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long)]
    last_used: bool,
    #[arg(long)]
    all_saved_printers: bool,
    /// `<ip:type[:checkCode]>[,...]`, `type` one of `new`/`legacy`.
    #[arg(long)]
    printers: Option<String>,
    #[arg(long)]
    no_printers: bool,

    #[arg(long)]
    webui_port: Option<u16>,
    #[arg(long)]
    webui_password: Option<String>,

    #[arg(long, default_value_t = String::from("data"))]
    data_dir: String,
    #[arg(long, default_value_t = String::from("http://localhost:7912"))]
    spoolman_url: String,
    #[arg(default_value_t = String::from("INFO"), short, long)]
    loglevel: String,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from_str(&args.loglevel).expect("unable to parse loglevel"))
        .init();

    tracing::info!("starting flotilla");

    let mode = match parse_mode(&args) {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let options = StartupOptions {
        data_dir: PathBuf::from(args.data_dir),
        mode,
        webui_port_override: args.webui_port,
        webui_password_override: args.webui_password,
        spoolman_base_url: args.spoolman_url,
    };

    build_runtime().block_on(async move {
        let flotilla = start_flotilla(
            options,
            Arc::new(DefaultClientFactory),
            Some(Arc::new(StdinCheckCodeProvider)),
        )
        .await;

        flotilla::shutdown::wait_for_signal_and_shutdown(flotilla.shutdown.clone()).await;
    });
}

/// Parses the mutually-exclusive startup modes of spec §6.2. `--no-printers`
/// is the default when no mode flag is given.
fn parse_mode(args: &Args) -> Result<ConnectionMode, String> {
    let given = [
        args.last_used,
        args.all_saved_printers,
        args.printers.is_some(),
        args.no_printers,
    ]
    .iter()
    .filter(|&&x| x)
    .count();
    if given > 1 {
        return Err("--last-used, --all-saved-printers, --printers, and --no-printers are mutually exclusive".to_string());
    }

    if args.last_used {
        Ok(ConnectionMode::LastUsed)
    } else if args.all_saved_printers {
        Ok(ConnectionMode::AllSavedPrinters)
    } else if let Some(spec) = &args.printers {
        Ok(ConnectionMode::Printers(parse_printer_specs(spec)?))
    } else {
        Ok(ConnectionMode::NoPrinters)
    }
}

fn parse_printer_specs(
    spec: &str,
) -> Result<Vec<(String, ClientTypeTag, Option<String>)>, String> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let ip = parts.next().ok_or_else(|| format!("malformed printer spec '{entry}'"))?;
            let type_tag = match parts.next() {
                Some("new") => ClientTypeTag::New,
                Some("legacy") => ClientTypeTag::Legacy,
                Some(other) => return Err(format!("unknown printer type '{other}' in spec '{entry}'")),
                None => return Err(format!("missing type in printer spec '{entry}'")),
            };
            let check_code = parts.next().map(str::to_string);
            Ok((ip.to_string(), type_tag, check_code))
        })
        .collect()
}

/// Interactive stdin prompt for a missing check code, the default
/// `CheckCodeProvider` when running as a standalone process.
struct StdinCheckCodeProvider;

#[async_trait]
impl CheckCodeProvider for StdinCheckCodeProvider {
    async fn prompt(&self, identity: &PrinterIdentity) -> Option<String> {
        tokio::task::spawn_blocking({
            let name = identity.name.clone();
            let ip = identity.ip_address.clone();
            move || {
                print!("check code for {name} ({ip}): ");
                std::io::stdout().flush().ok()?;
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).ok()?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
        })
        .await
        .ok()
        .flatten()
    }
}

fn build_runtime() -> Runtime {
    Builder::new_multi_thread()
        .thread_name("flotilla-worker")
        .enable_time()
        .enable_io()
        .build()
        .expect("unable to start tokio runtime")
}

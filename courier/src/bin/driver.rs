//! Courier driver daemon.
//!
//! Creates the CnC shared memory object and runs the conductor until a
//! client sends an accepted termination request or the process is killed.
//!
//! # Usage
//!
//! ```sh
//! courier-driver --cnc /courier-cnc --liveness 10 --term-token secret
//! ```
//!
//! A killed driver leaves its CnC object behind; the next launch replaces
//! it once its heartbeat is stale.

use std::sync::Arc;
use std::time::Duration;

use courier::driver::{
    Driver, DriverConfig, DriverError, IdleStrategyKind, TokenTermination,
};
use courier::ipc::shmem::ShmPath;

/// How often the main thread checks whether the conductor is still running.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

fn main() {
    courier::init_tracing();

    if let Err(e) = run() {
        eprintln!("courier-driver: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let Some(config) = parse_args(&args)? else {
        print_usage();
        return Ok(());
    };

    eprintln!(
        "courier-driver: starting on {} (client liveness {:?})",
        config.cnc_path, config.client_liveness_timeout
    );

    let driver = Driver::launch(config)?;
    eprintln!("courier-driver: ready");

    while driver.is_running() {
        std::thread::sleep(POLL_INTERVAL);
    }

    if driver.is_terminated() {
        eprintln!("courier-driver: termination requested by client");
    }
    driver.shutdown();
    eprintln!("courier-driver: stopped");

    Ok(())
}

/// Parses command line arguments. `Ok(None)` means help was requested.
fn parse_args(args: &[String]) -> Result<Option<DriverConfig>, CliError> {
    let mut config = DriverConfig::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--cnc" | "-c" => {
                let value = value_for(args, &mut i, flag)?;
                config.cnc_path =
                    ShmPath::new(value).map_err(|e| CliError::Usage(e.to_string()))?;
            }
            "--liveness" | "-t" => {
                let secs: u64 = parse_value(value_for(args, &mut i, flag)?, flag)?;
                config.client_liveness_timeout = Duration::from_secs(secs);
            }
            "--core" => {
                config.conductor_core = Some(parse_value(value_for(args, &mut i, flag)?, flag)?);
            }
            "--idle" => {
                config.idle_strategy = match value_for(args, &mut i, flag)? {
                    "spin" => IdleStrategyKind::BusySpin,
                    "yield" => IdleStrategyKind::Yielding,
                    "sleep" => IdleStrategyKind::Sleeping(Duration::from_millis(1)),
                    "backoff" => IdleStrategyKind::Backoff,
                    other => {
                        return Err(CliError::Usage(format!("unknown idle strategy: {other}")));
                    }
                };
            }
            "--term-token" => {
                let token = value_for(args, &mut i, flag)?;
                config.termination_validator =
                    Arc::new(TokenTermination(token.as_bytes().to_vec()));
            }
            "--help" | "-h" => return Ok(None),
            arg => return Err(CliError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(Some(config))
}

fn value_for<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, CliError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing value for {flag}")))
}

fn parse_value<T>(value: &str, flag: &str) -> Result<T, CliError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| CliError::Usage(format!("invalid value for {flag}: {e}")))
}

fn print_usage() {
    eprintln!(
        r#"courier-driver - Courier media driver control plane

USAGE:
    courier-driver [OPTIONS]

OPTIONS:
    -c, --cnc <PATH>          CnC shared memory name (default: /courier-cnc)
    -t, --liveness <SECS>     Client liveness timeout in seconds (default: 10)
        --core <ID>           Pin the conductor thread to this core
        --idle <STRATEGY>     spin | yield | sleep | backoff (default: backoff)
        --term-token <TOKEN>  Accept TERMINATE_DRIVER carrying this token
    -h, --help                Print this help message

EXAMPLE:
    courier-driver --cnc /courier-d1 --term-token secret
"#
    );
}

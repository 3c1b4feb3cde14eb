//! oslog-tail
//!
//! Streams unified-log messages for a process to stdout as they are emitted.

use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oslog_stream::{LogMessage, LogStreamHost, StreamConfig};

/// Command-line options
#[derive(Default)]
struct Options {
    /// JSON config file, applied before environment overrides
    config: Option<PathBuf>,
    library: Option<PathBuf>,
    pid: Option<i32>,
    no_history: bool,
    json: bool,
    /// Stop after this long; run until killed otherwise
    duration: Option<Duration>,
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut opts = Options::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--library" | "-l" => {
                opts.library = Some(PathBuf::from(value(&args, i, "--library")));
                i += 2;
            }
            "--pid" | "-p" => {
                let raw = value(&args, i, "--pid");
                let pid = raw.parse::<i32>().unwrap_or_else(|_| {
                    eprintln!("error: invalid process id: {raw}");
                    process::exit(1);
                });
                opts.pid = Some(pid);
                i += 2;
            }
            "--config" | "-c" => {
                opts.config = Some(PathBuf::from(value(&args, i, "--config")));
                i += 2;
            }
            "--duration" | "-d" => {
                let raw = value(&args, i, "--duration");
                let secs = raw.parse::<u64>().unwrap_or_else(|_| {
                    eprintln!("error: invalid duration in seconds: {raw}");
                    process::exit(1);
                });
                opts.duration = Some(Duration::from_secs(secs));
                i += 2;
            }
            "--no-history" => {
                opts.no_history = true;
                i += 1;
            }
            "--json" => {
                opts.json = true;
                i += 1;
            }
            "--help" | "-h" => {
                println!("oslog-tail - stream unified-log messages for a process");
                println!();
                println!("USAGE:");
                println!("    oslog-tail [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -p, --pid <PID>           Process to stream [default: this process]");
                println!("    -l, --library <PATH>      LoggingSupport library path");
                println!("    -c, --config <FILE>       JSON stream configuration");
                println!("    -d, --duration <SECS>     Stop after SECS seconds");
                println!("        --no-history          Skip entries buffered before start");
                println!("        --json                Print one JSON object per message");
                println!("    -h, --help                Print help information");
                println!();
                println!("ENVIRONMENT:");
                println!("    OSLOG_STREAM_LIBRARY    LoggingSupport library path");
                println!("    OSLOG_STREAM_PID        Process to stream");
                println!("    OSLOG_STREAM_HISTORY    Include buffered history (true/false)");
                println!("    RUST_LOG                Log filter [default: info]");
                process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                process::exit(1);
            }
        }
    }

    opts
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    args.get(i + 1).map(String::as_str).unwrap_or_else(|| {
        eprintln!("error: {flag} requires a value");
        process::exit(1);
    })
}

fn build_config(opts: &Options) -> oslog_stream::LogStreamResult<StreamConfig> {
    let base = match &opts.config {
        Some(path) => StreamConfig::from_file(path)?,
        None => StreamConfig::default(),
    };
    let mut config = base.apply_env()?;

    if let Some(library) = &opts.library {
        config.library_path.clone_from(library);
    }
    if opts.pid.is_some() {
        config.process_id = opts.pid;
    }
    if opts.no_history {
        config.include_history = false;
    }
    config.validate()?;
    Ok(config)
}

fn print_message(json: bool, message: &LogMessage) {
    if json {
        match serde_json::to_string(message) {
            Ok(line) => println!("{line}"),
            Err(e) => error!(error = %e, "failed to encode message"),
        }
    } else {
        println!("{message}");
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let opts = parse_args();
    let config = build_config(&opts).unwrap_or_else(|e| {
        error!(error = %e, "invalid configuration");
        process::exit(1);
    });

    info!(
        library = %config.library_path.display(),
        pid = config.resolved_pid(),
        history = config.include_history,
        "oslog-tail v{}",
        env!("CARGO_PKG_VERSION")
    );

    let json = opts.json;
    let mut host = LogStreamHost::new(config);
    if let Err(e) = host.setup(move |message| print_message(json, &message)) {
        error!(error = %e, "could not start log stream");
        process::exit(1);
    }

    match opts.duration {
        Some(duration) => thread::sleep(duration),
        None => loop {
            thread::park();
        },
    }

    host.teardown();
    info!("log stream closed");
}

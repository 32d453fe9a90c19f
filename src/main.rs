/*! `meterctl`: one-shot human/collector reads, and a polling daemon, for
an LM50TCP+-style electricity-metering device.
*/

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use lm50_meter_client::config::{Config, Mode};
use lm50_meter_client::daemon::{Daemon, PollConfig};
use lm50_meter_client::device::{Device, CHANNEL_COUNT};
use lm50_meter_client::output::{format_collector, format_human};
use lm50_meter_client::sink::FileSink;

/// Client for an LM50TCP+-style electricity-metering device.
#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// DNS name or address of the device.
    #[arg(long, short = 'H')]
    host: String,

    /// TCP port or well-known service name.
    #[arg(long, short, default_value = "502")]
    port: String,

    /// Print a human-readable report once and exit.
    #[arg(long, conflicts_with_all = ["cacti", "daemon"])]
    full: bool,

    /// Print collector-mode output (`meterXX:V` pairs) once and exit.
    #[arg(long, conflicts_with_all = ["full", "daemon"])]
    cacti: bool,

    /// Run as a polling daemon.
    #[arg(long, conflicts_with_all = ["full", "cacti"])]
    daemon: bool,

    /// Channels to operate on, 1-indexed. Repeatable; duplicates and order
    /// don't matter. Defaults to all 50.
    #[arg(long, short = 'C', num_args = 1..)]
    channels: Vec<usize>,

    /// Daemon only: stay attached to the controlling terminal.
    #[arg(long)]
    foreground: bool,

    /// Verbosity of debug messages. Daemon mode implies foreground when
    /// verbose logging is on.
    #[arg(short, default_value = "0")]
    verbose: usize,

    /// Daemon only: seconds between polls.
    #[arg(long, default_value = "30")]
    poll_period_seconds: u64,

    /// Daemon only: path of the time-series file to append to.
    #[arg(long, default_value = "/tmp/lm50client.csv")]
    ts_sink_file: PathBuf,
}

fn build_config(opt: &Opt) -> Result<Config, String> {
    let mode = if opt.full {
        Mode::Human
    } else if opt.cacti {
        Mode::Collector
    } else if opt.daemon {
        Mode::Daemon
    } else {
        return Err("one of --full, --cacti or --daemon is required".into());
    };

    let mut channels: Vec<usize> = opt
        .channels
        .iter()
        .map(|&c| {
            c.checked_sub(1)
                .filter(|&zero| zero < CHANNEL_COUNT)
                .ok_or_else(|| format!("channel {c} is out of range 1..={CHANNEL_COUNT}"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    channels.sort_unstable();
    channels.dedup();

    Ok(Config {
        host: opt.host.clone(),
        service: opt.port.clone(),
        mode,
        channels,
        foreground: opt.foreground || opt.verbose > 0,
        verbose: opt.verbose > 0,
        poll_period: Duration::from_secs(opt.poll_period_seconds),
        ts_sink_file: opt.ts_sink_file.clone(),
    })
}

/// Human mode: connect, sample once, print a report. Any failure aborts
/// before anything is printed, and is reported by the caller as `Error: ...`.
fn run_human(config: &Config) -> Result<(), lm50_meter_client::Error> {
    let mut device = Device::new(&config.host, &config.service);
    device.connect()?;
    device.update_volatile()?;
    device.disconnect();

    print!("{}", format_human(&device, &config.resolved_channels()));
    Ok(())
}

/// Collector mode: unlike human mode, a connect or read failure must not
/// suppress output. `format_collector` already substitutes `nan` for any
/// channel that was never successfully read, so this prints a best-effort
/// line to stdout regardless of whether the sample succeeded, and only
/// reports failure through the process exit code.
fn run_collector(config: &Config) -> bool {
    let mut device = Device::new(&config.host, &config.service);
    let succeeded = match device.connect() {
        Ok(()) => match device.update_volatile() {
            Ok(()) => true,
            Err(e) => {
                warn!("update_volatile failed: {e}");
                false
            }
        },
        Err(e) => {
            warn!("connect failed: {e}");
            false
        }
    };
    device.disconnect();

    println!("{}", format_collector(&device, &config.resolved_channels()));
    succeeded
}

/// Fork into the background, redirect standard I/O to `/dev/null` and
/// detach from the controlling terminal. Returns `true` in the process
/// that should continue running (the child, or the original process if
/// `foreground` is set).
fn daemonize(foreground: bool) -> Result<bool, lm50_meter_client::Error> {
    if foreground {
        return Ok(true);
    }

    // Safety: `fork` has no preconditions beyond being a valid syscall; we
    // immediately branch on its return value before doing anything else.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(lm50_meter_client::Error::Fatal("fork failed".into()));
    }
    if pid != 0 {
        return Ok(false);
    }

    // Safety: `open` with a NUL-terminated path is a plain syscall; `dup2`
    // and `close` operate on file descriptors we just obtained or that are
    // always valid (0, 1, 2) in a freshly forked child.
    unsafe {
        let devnull = std::ffi::CString::new("/dev/null").unwrap();
        let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
        let mut ok = fd >= 0;
        ok &= libc::close(2) == 0;
        ok &= libc::close(1) == 0;
        ok &= libc::close(0) == 0;
        ok &= libc::dup2(fd, 0) >= 0;
        ok &= libc::dup2(fd, 1) >= 0;
        ok &= libc::dup2(fd, 2) >= 0;
        ok &= libc::close(fd) == 0;
        if !ok {
            return Err(lm50_meter_client::Error::Fatal(
                "could not redirect standard i/o to /dev/null".into(),
            ));
        }
        if libc::setsid() < 0 {
            return Err(lm50_meter_client::Error::Fatal(
                "could not create new session for daemon process".into(),
            ));
        }
    }
    Ok(true)
}

fn run_daemon(config: &Config) -> Result<(), lm50_meter_client::Error> {
    let device = Device::new(&config.host, &config.service);
    let poll_config = PollConfig {
        period: config.poll_period,
        channels: config.resolved_channels(),
    };
    let daemon = Daemon::new(device, poll_config);

    if !daemonize(config.foreground)? {
        return Ok(());
    }

    let sink = Arc::new(FileSink::open(&config.ts_sink_file)?);
    info!("daemon started, polling every {:?}", config.poll_period);
    daemon.run(sink, || {
        match lm50_meter_client::signals::wait_for_termination() {
            Ok(sig) => info!("received signal {sig}, shutting down"),
            Err(e) => error!("signal wait failed: {e}"),
        }
    })
}

fn main() {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("lm50_meter_client")
        .quiet(false)
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()
        .expect("initializing logger");

    let config = match build_config(&opt) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("Error: {msg}");
            std::process::exit(1);
        }
    };

    match config.mode {
        Mode::Human => {
            if let Err(e) = run_human(&config) {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
        Mode::Collector => {
            if !run_collector(&config) {
                std::process::exit(1);
            }
        }
        Mode::Daemon => {
            if let Err(e) = run_daemon(&config) {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn collector_config(host: String, service: String) -> Config {
        Config {
            host,
            service,
            mode: Mode::Collector,
            channels: vec![0, 1],
            foreground: false,
            verbose: false,
            poll_period: Duration::from_secs(30),
            ts_sink_file: PathBuf::from("/tmp/unused.csv"),
        }
    }

    #[test]
    fn run_collector_prints_nan_and_signals_failure_on_connect_error() {
        // Bind, then drop, to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = collector_config(addr.ip().to_string(), addr.port().to_string());
        assert!(!run_collector(&config));
    }
}

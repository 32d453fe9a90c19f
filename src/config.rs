/*! The configuration contract the core expects from its caller.

Parsing command-line arguments or a configuration file is explicitly out
of scope for this crate (see the crate-level docs); [`crate::main`] builds
a [`Config`] from `clap` and hands it to the core unchanged.
*/

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which of the three top-level behaviors to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Print a human-readable report once and exit.
    Human,
    /// Print `meterXX:V` collector output once and exit.
    Collector,
    /// Run as a long-lived polling daemon.
    Daemon,
}

/// Everything the core needs to run, independent of how it was obtained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS name or address of the device.
    pub host: String,
    /// TCP service: numeric or a well-known name. Defaults to `"502"`.
    pub service: String,
    /// Which behavior to run.
    pub mode: Mode,
    /// Zero-indexed, sorted, deduplicated channel indices in `[0, 50)`.
    /// Empty means "all 50".
    pub channels: Vec<usize>,
    /// Daemon only: stay attached to the controlling terminal instead of
    /// detaching.
    pub foreground: bool,
    /// Enables verbose logging; implies `foreground`.
    pub verbose: bool,
    /// Daemon only: polling period.
    pub poll_period: Duration,
    /// Daemon only: path the time-series sink appends to.
    pub ts_sink_file: PathBuf,
}

impl Config {
    /// The channel list with the "empty means all" convention resolved to
    /// an explicit `0..50`.
    pub fn resolved_channels(&self) -> Vec<usize> {
        if self.channels.is_empty() {
            (0..crate::device::CHANNEL_COUNT).collect()
        } else {
            self.channels.clone()
        }
    }
}

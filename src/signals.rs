/*! Termination-signal waiting for the daemon's main thread.

The main thread blocks synchronously on [`wait_for_termination`] for one
of the signals the daemon treats as a clean-shutdown request. This is
deliberately a blocking iterator rather than a flag polled from a
worker: workers never touch OS signals directly, they only ever observe
[`crate::cancel::Cancel`], which the main thread flips once a
termination signal arrives (see [`crate::daemon::Daemon::run`]).
*/

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGTSTP};
use signal_hook::iterator::Signals;

use crate::error::{Error, Result};

/// Signals that cause the daemon to terminate cleanly.
const TERMINATION_SIGNALS: &[libc::c_int] = &[SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGTSTP];

/// Block the calling thread until one of [`TERMINATION_SIGNALS`] arrives,
/// then return which one. Intended to be called once, from the daemon's
/// main thread.
pub fn wait_for_termination() -> Result<libc::c_int> {
    let mut signals = Signals::new(TERMINATION_SIGNALS)
        .map_err(|e| Error::Fatal(format!("registering termination signals: {e}")))?;
    match signals.forever().next() {
        Some(sig) => Ok(sig),
        None => Err(Error::Fatal("signal iterator ended without a signal".into())),
    }
}

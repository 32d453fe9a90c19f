/*! The time-series sink: an opaque collaborator the daemon appends
samples to. The daemon never treats a sink failure as fatal — see
[`crate::daemon::poll_loop`].
*/

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Something that accepts `(timestamp, values)` samples. Implemented for
/// the concrete file-backed sink below; daemon tests use a recording fake.
pub trait TimeSeriesSink: Send + Sync {
    /// Record one sample. `values` is in the same order as the daemon's
    /// configured channel list.
    fn append(&self, timestamp_seconds: u64, values: &[u32]) -> std::io::Result<()>;
}

/// Appends one line per sample to a flat file: `timestamp v1 v2 ...`.
///
/// This is a simple stand-in for the round-robin database the external
/// contract in §6 describes; the wire format here is this crate's own and
/// not otherwise specified.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FileSink {
    /// Open (creating if necessary) the file at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// The path this sink writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TimeSeriesSink for FileSink {
    fn append(&self, timestamp_seconds: u64, values: &[u32]) -> std::io::Result<()> {
        let mut line = timestamp_seconds.to_string();
        for v in values {
            line.push(' ');
            line.push_str(&v.to_string());
        }
        line.push('\n');
        let mut file = self.file.lock().expect("sink file mutex poisoned");
        file.write_all(line.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn file_sink_appends_one_line_per_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.rrd");
        let sink = FileSink::open(&path).unwrap();

        sink.append(1_000, &[1, 2, 3]).unwrap();
        sink.append(1_030, &[4, 5, 6]).unwrap();

        let mut contents = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "1000 1 2 3\n1030 4 5 6\n");
    }

    #[test]
    fn file_sink_reopens_existing_file_for_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("series.rrd");
        FileSink::open(&path).unwrap().append(1, &[9]).unwrap();
        FileSink::open(&path).unwrap().append(2, &[10]).unwrap();

        let mut contents = String::new();
        std::fs::File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "1 9\n2 10\n");
    }
}

//! Compression plumbing: the gzip shard writer used by the dumper and the
//! FIFO feeder that streams decompressed shard content into a bulk load.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd;
use tracing::debug;

const FEED_CHUNK: usize = 64 * 1024;
const FEED_POLL: Duration = Duration::from_millis(20);

/// Buffered gzip writer for one data shard.
pub struct ShardWriter {
    path: PathBuf,
    out: BufWriter<GzEncoder<File>>,
}

impl ShardWriter {
    /// Opens `path` for writing through a gzip encoder.
    ///
    /// # Errors
    /// Returns an error when the file cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let encoder = GzEncoder::new(file, Compression::default());
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(encoder),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes buffered rows and finalizes the gzip stream.
    ///
    /// # Errors
    /// Returns an error when the trailing gzip frame cannot be written.
    pub fn finish(self) -> Result<()> {
        let path = self.path;
        let encoder = self
            .out
            .into_inner()
            .map_err(|err| anyhow::anyhow!("failed to flush {}: {}", path.display(), err))?;
        encoder
            .finish()
            .with_context(|| format!("failed to finish {}", path.display()))?;
        Ok(())
    }
}

impl Write for ShardWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Recreates the named pipe at `path` with owner-only permissions.
///
/// # Errors
/// Returns an error when an existing pipe cannot be removed or the new one
/// cannot be created.
pub fn create_fifo(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to remove {}", path.display()))
        }
    }
    unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .with_context(|| format!("failed to create fifo {}", path.display()))?;
    Ok(())
}

/// Spawns the feeder thread that decompresses `shard` into the pipe at
/// `fifo`. The write end stays non-blocking so the feeder keeps observing
/// `cancel` while it waits for a reader or for pipe capacity; setting
/// `cancel` makes it exit early. The returned handle yields the bytes fed.
#[must_use]
pub fn feed_fifo(shard: &Path, fifo: &Path, cancel: Arc<AtomicBool>) -> JoinHandle<Result<u64>> {
    let shard = shard.to_path_buf();
    let fifo = fifo.to_path_buf();
    thread::spawn(move || {
        let file =
            File::open(&shard).with_context(|| format!("failed to open {}", shard.display()))?;
        let mut decoder = GzDecoder::new(file);
        let Some(mut sink) = open_fifo_writer(&fifo, &cancel)? else {
            return Ok(0);
        };
        let bytes = pump(&mut decoder, &mut sink, &cancel)
            .with_context(|| format!("failed to feed {}", fifo.display()))?;
        debug!(
            "fed {bytes} bytes from {} into {}",
            shard.display(),
            fifo.display()
        );
        Ok(bytes)
    })
}

/// Opens the write end of a FIFO without committing to a blocking `open`,
/// so a loader that dies before attaching a reader cannot strand the
/// feeder.
fn open_fifo_writer(fifo: &Path, cancel: &AtomicBool) -> Result<Option<File>> {
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(fifo)
        {
            Ok(file) => return Ok(Some(file)),
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {
                thread::sleep(FEED_POLL);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to open {}", fifo.display()))
            }
        }
    }
}

/// Copies `source` into the non-blocking pipe, parking briefly whenever the
/// pipe is full and honoring `cancel` between writes.
fn pump(source: &mut dyn Read, sink: &mut File, cancel: &AtomicBool) -> io::Result<u64> {
    let mut buf = vec![0u8; FEED_CHUNK];
    let mut total = 0u64;
    loop {
        let read = source.read(&mut buf)?;
        if read == 0 {
            return Ok(total);
        }
        let mut offset = 0;
        while offset < read {
            match sink.write(&buf[offset..read]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "pipe accepted no bytes",
                    ))
                }
                Ok(written) => offset += written,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if cancel.load(Ordering::SeqCst) {
                        return Err(io::Error::new(
                            io::ErrorKind::Interrupted,
                            "feed cancelled",
                        ));
                    }
                    thread::sleep(FEED_POLL);
                }
                Err(err) => return Err(err),
            }
        }
        total += read as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_writer_produces_readable_gzip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.000001.csv.gz");
        let mut writer = ShardWriter::create(&path).expect("create shard");
        writer.write_all(b"id,name\n1,alice\n").expect("write");
        assert_eq!(writer.path(), path);
        writer.finish().expect("finish");

        let mut decoder = GzDecoder::new(File::open(&path).expect("open shard"));
        let mut body = String::new();
        decoder.read_to_string(&mut body).expect("decompress");
        assert_eq!(body, "id,name\n1,alice\n");
    }

    #[test]
    fn feeder_streams_a_shard_through_the_fifo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shard = dir.path().join("t.000001.csv.gz");
        let mut writer = ShardWriter::create(&shard).expect("create shard");
        writer.write_all(b"id\n1\n2\n").expect("write");
        writer.finish().expect("finish");

        let fifo = dir.path().join("t.fifo");
        create_fifo(&fifo).expect("mkfifo");
        let cancel = Arc::new(AtomicBool::new(false));
        let feeder = feed_fifo(&shard, &fifo, cancel);

        let mut body = String::new();
        File::open(&fifo)
            .expect("open fifo")
            .read_to_string(&mut body)
            .expect("read fifo");
        assert_eq!(body, "id\n1\n2\n");

        let fed = feeder.join().expect("join feeder").expect("feed ok");
        assert_eq!(fed, 7);
    }

    #[test]
    fn cancelled_feeder_exits_without_a_reader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let shard = dir.path().join("t.000001.csv.gz");
        let mut writer = ShardWriter::create(&shard).expect("create shard");
        writer.write_all(b"x\n").expect("write");
        writer.finish().expect("finish");

        let fifo = dir.path().join("t.fifo");
        create_fifo(&fifo).expect("mkfifo");
        let cancel = Arc::new(AtomicBool::new(false));
        let feeder = feed_fifo(&shard, &fifo, cancel.clone());
        thread::sleep(Duration::from_millis(50));
        cancel.store(true, Ordering::SeqCst);
        let fed = feeder.join().expect("join feeder").expect("feed cancelled");
        assert_eq!(fed, 0);
    }

    #[test]
    fn create_fifo_replaces_an_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.fifo");
        fs::write(&path, b"stale").expect("write stale file");
        create_fifo(&path).expect("mkfifo over file");
        let meta = fs::symlink_metadata(&path).expect("stat fifo");
        assert!(!meta.is_file());
    }
}

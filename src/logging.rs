//! Logging setup: leveled, categorized console output, a size-rotated file
//! sink, and a ring of recent trace records replayed when an error is hit.
//!
//! Categories are tracing targets (`main`, `web`, `cache`). Verbosity from
//! the CLI widens the console filter; an explicit `RUST_LOG` wins.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_DIR: &str = "logs";
pub const LOG_FILE: &str = "app.log";
pub const LOG_FILE_SIZE: u64 = 512 * 1024;
pub const LOG_BACKUP_COUNT: usize = 5;
pub const LOG_BACKTRACE_SIZE: usize = 10;

/// Install the global subscriber. Called once, before any other work.
///
/// The file sink is best effort: if `logs/` cannot be created the process
/// keeps running with console output only.
pub fn init(verbosity: u8) {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let registry = tracing_subscriber::registry()
        .with(BacktraceLayer::new(LOG_BACKTRACE_SIZE))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(console_filter),
        );

    match RotatingFileWriter::create(
        Path::new(LOG_DIR).join(LOG_FILE),
        LOG_FILE_SIZE,
        LOG_BACKUP_COUNT,
    ) {
        Ok(writer) => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer)
                        .with_filter(LevelFilter::DEBUG),
                )
                .init();
        }
        Err(err) => {
            registry.init();
            tracing::warn!(target: "main", error = %err, "log file sink unavailable");
        }
    }
}

pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Keeps the most recent TRACE records and replays them to its sink
/// (stderr by default) whenever an ERROR record is emitted, so the console
/// shows the lead-up to a failure without running at full verbosity.
pub struct BacktraceLayer {
    capacity: usize,
    ring: Mutex<VecDeque<String>>,
    sink: Arc<Mutex<dyn Write + Send>>,
}

impl BacktraceLayer {
    pub fn new(capacity: usize) -> Self {
        Self::with_sink(capacity, Arc::new(Mutex::new(io::stderr())))
    }

    pub fn with_sink(capacity: usize, sink: Arc<Mutex<dyn Write + Send>>) -> Self {
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            sink,
        }
    }

    fn lock_ring(&self) -> MutexGuard<'_, VecDeque<String>> {
        match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<S: Subscriber> Layer<S> for BacktraceLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();

        if level == Level::ERROR {
            let mut ring = self.lock_ring();
            if ring.is_empty() {
                return;
            }

            let mut out = match self.sink.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let _ = writeln!(out, "--- last {} trace records ---", ring.len());
            for record in ring.drain(..) {
                let _ = writeln!(out, "  {record}");
            }
            let _ = writeln!(out, "--- end trace records ---");
        } else if level == Level::TRACE {
            let mut visitor = RecordVisitor::default();
            event.record(&mut visitor);

            let mut ring = self.lock_ring();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(format!(
                "{}: {}",
                event.metadata().target(),
                visitor.rendered
            ));
        }
    }
}

#[derive(Default)]
struct RecordVisitor {
    rendered: String,
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            if !self.rendered.is_empty() {
                let _ = write!(self.rendered, " ");
            }
            let _ = write!(self.rendered, "{value:?}");
        } else {
            let _ = write!(self.rendered, " {}={:?}", field.name(), value);
        }
    }
}

/// Append-only log file that rotates once it crosses `max_size`, keeping
/// `app.log.1` through `app.log.N` with 1 as the freshest backup.
#[derive(Clone)]
pub struct RotatingFileWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

struct RotatingFile {
    path: PathBuf,
    max_size: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingFileWriter {
    pub fn create(path: PathBuf, max_size: u64, backups: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFile {
                path,
                max_size,
                backups,
                file,
                written,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RotatingFile> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl RotatingFile {
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        for index in (1..self.backups).rev() {
            let from = backup_path(&self.path, index);
            if from.exists() {
                let _ = fs::rename(&from, backup_path(&self.path, index + 1));
            }
        }
        if self.backups > 0 {
            let _ = fs::rename(&self.path, backup_path(&self.path, 1));
        }

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(format!(".{index}"));
    PathBuf::from(raw)
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.written + buf.len() as u64 > inner.max_size {
            inner.rotate()?;
        }
        let written = inner.file.write(buf)?;
        inner.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Render a byte buffer as a classic hex + ascii dump for trace logs.
pub fn hexdump(data: &[u8]) -> String {
    const WIDTH: usize = 16;

    let mut out = format!("{:010} bytes ({:#08x})\n", data.len(), data.len());

    for (row, chunk) in data.chunks(WIDTH).enumerate() {
        let _ = write!(out, "{:04x}:  ", row * WIDTH);

        for index in 0..WIDTH {
            match chunk.get(index) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
        }

        out.push_str("    ");
        for byte in chunk {
            out.push(if byte.is_ascii_graphic() || *byte == b' ' {
                *byte as char
            } else {
                '.'
            });
        }
        out.push('\n');
    }

    out
}

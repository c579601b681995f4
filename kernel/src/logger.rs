//! The module containing the dual-sink (stdout/warn-file) logger implementation.

// Inspired by the teacher's UART logger: a manual `log::Log` implementation
// wrapping a locked writer, with a single `init_*` entry point.

use crate::config::LOGGING_LEVEL;
use std::{
    fs::File,
    io::{self, Stderr, Stdout, Write},
    path::Path,
    sync::Mutex,
};

/// Initializes the global logger, routing `Warn`-and-above records to the
/// `-w` sink (or stderr if none was given) and everything else to the `-o`
/// sink (or stdout).
pub(crate) fn init_file_logger(output: Option<&Path>, warn: Option<&Path>) -> io::Result<()> {
    let primary = open_sink(output, Sink::Stdout)?;
    let warn_sink = open_sink(warn, Sink::Stderr)?;
    let logger = Box::leak(Box::new(FileLogger {
        primary: Mutex::new(primary),
        warn: Mutex::new(warn_sink),
    }));
    log::set_logger(logger)
        .map(|()| log::set_max_level(LOGGING_LEVEL))
        .expect("logger already initialized");
    Ok(())
}

enum Sink {
    Stdout,
    Stderr,
}

enum Writer {
    File(File),
    Stdout(Stdout),
    Stderr(Stderr),
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::File(f) => f.write(buf),
            Self::Stdout(s) => s.write(buf),
            Self::Stderr(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::File(f) => f.flush(),
            Self::Stdout(s) => s.flush(),
            Self::Stderr(s) => s.flush(),
        }
    }
}

fn open_sink(path: Option<&Path>, default: Sink) -> io::Result<Writer> {
    match path {
        Some(path) => Ok(Writer::File(File::create(path)?)),
        None => Ok(match default {
            Sink::Stdout => Writer::Stdout(io::stdout()),
            Sink::Stderr => Writer::Stderr(io::stderr()),
        }),
    }
}

struct FileLogger {
    primary: Mutex<Writer>,
    warn: Mutex<Writer>,
}

impl log::Log for FileLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= LOGGING_LEVEL
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut sink = if record.level() <= log::Level::Warn {
            self.warn.lock().unwrap()
        } else {
            self.primary.lock().unwrap()
        };
        let _ = writeln!(sink, "[{}] {}: {}", record.level(), record.target(), record.args());
    }

    fn flush(&self) {
        let _ = self.primary.lock().unwrap().flush();
        let _ = self.warn.lock().unwrap().flush();
    }
}

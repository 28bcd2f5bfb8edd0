use std::fs::{File, OpenOptions};
use std::io;

use anyhow::Result;
use slog::{o, Drain, Record};

use crate::conf::logging::{Level, To};

pub use slog::Logger;

/// Routes the `log` facade into `logger`.
pub fn logger_init(logger: Logger, level: Level) -> Result<()> {
    log::set_boxed_logger(Box::new(LoggerEx(logger))).map_err(|e| anyhow::Error::msg(e.to_string()))?;
    log::set_max_level(slog_log_to_level(level.inner()).to_level_filter());
    Ok(())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: r.target() };
        self.0.log(&Record::new(&s, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    slog::RecordLocation {
        file: r.file_static().unwrap_or("<unknown>"),
        line: r.line().unwrap_or_default(),
        column: 0,
        function: "",
        module: r.module_path_static().unwrap_or("<unknown>"),
    }
}

fn timestamp(io: &mut dyn io::Write) -> io::Result<()> {
    write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Builds the async root logger writing to console and/or `filename`.
pub fn config_logger(filename: String, to: To, level: Level) -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(WriteFilter::new(filename, to));
    let drain = slog_term::FullFormat::new(decorator).use_custom_timestamp(timestamp).build().fuse();
    let drain = LevelFilter { drain, level: level.inner() }.fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

struct LevelFilter<D> {
    drain: D,
    level: slog::Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(&self, record: &Record, values: &slog::OwnedKVList) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

/// Console and/or file sink. The file is opened on first write.
struct WriteFilter {
    filename: String,
    to: To,
    file: Option<File>,
    console: io::Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Self {
        Self { filename, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(open_file(&self.filename)?);
        }
        self.file.as_mut().ok_or_else(|| io::Error::other("log file unavailable"))
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.to {
            To::Console => self.console.write(buf),
            To::File => self.file()?.write(buf),
            To::Both => {
                self.console.write_all(buf)?;
                self.file()?.write(buf)
            }
            To::Off => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.to {
            To::Console => self.console.flush(),
            To::File => self.file()?.flush(),
            To::Both => {
                self.console.flush()?;
                self.file()?.flush()
            }
            To::Off => Ok(()),
        }
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(filename).map_err(|e| {
        io::Error::new(e.kind(), format!("logger file config error, filename: {}, {:?}", filename, e))
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_write_filter_to_file() {
        let path = std::env::temp_dir().join(format!("rjms-logger-{}.log", std::process::id()));
        let filename = path.to_string_lossy().to_string();
        let mut w = WriteFilter::new(filename.clone(), To::File);
        w.write_all(b"hello\n").unwrap();
        w.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\n");
        let _ = std::fs::remove_file(&path);

        let mut off = WriteFilter::new("/nonexistent/dir/x.log".into(), To::Off);
        assert_eq!(off.write(b"dropped").unwrap(), 7);
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(slog_log_to_level(slog::Level::Critical), log::Level::Error);
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
    }
}

use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};

use anyhow::anyhow;
use slog::{b, o, Drain};

use crate::conf::{Format, Log, To};
use crate::Result;

pub use slog::Logger;

/// Routes the `log` facade into `logger`, capped at the configured level.
pub fn logger_init(logger: &Logger, cfg: &Log) -> Result<()> {
    log::set_boxed_logger(Box::new(LoggerEx(logger.clone())))
        .map_err(|e| anyhow!("logger init error, {}", e))?;
    log::set_max_level(slog_log_to_level(cfg.level.inner()).to_level_filter());
    Ok(())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, b!()))
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
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

/// Builds the root logger: terminal or JSON lines, written asynchronously to the
/// console, the log file or both.
pub fn config_logger(cfg: &Log) -> Result<Logger> {
    let out = WriteFilter::new(cfg)?;
    let level = cfg.level.inner();
    let logger = match cfg.format {
        Format::Text => {
            let decorator = slog_term::PlainDecorator::new(out);
            let drain = slog_term::FullFormat::new(decorator)
                .use_custom_timestamp(|io: &mut dyn io::Write| {
                    write!(io, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
                })
                .build()
                .fuse();
            root(drain, level)
        }
        Format::Json => root(slog_json::Json::new(out).add_default_keys().build().fuse(), level),
    };
    Ok(logger)
}

fn root<D>(drain: D, level: slog::Level) -> Logger
where
    D: Drain<Ok = (), Err = slog::Never> + Send + 'static,
{
    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Logger::root(drain.filter_level(level).fuse(), o!())
}

struct WriteFilter {
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(cfg: &Log) -> Result<Self> {
        let file = if cfg.to.file() { Some(open_file(cfg)?) } else { None };
        Ok(Self { to: cfg.to, file, console: io::stdout() })
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.to.console() {
            self.console.write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(cfg: &Log) -> Result<File> {
    let filename = cfg.filename();
    if filename.is_empty() {
        return Err(anyhow!("logger file config error, no file name"));
    }
    if !cfg.dir.is_empty() {
        std::fs::create_dir_all(&cfg.dir)
            .map_err(|e| anyhow!("logger dir config error, dir: {}, {:?}", cfg.dir, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&filename)
        .map_err(|e| anyhow!("logger file config error, filename: {}, {:?}", filename, e))
}

//! Provide tracing, tailored to this program.
//!
//! At startup, the program calls [`init_journald_or_stdout`] to install a
//! subscriber. The rest of the program can include
//! `use crate::tracing::prelude::*` for the `trace!()`, `debug!()`,
//! `info!()`, `warn!()` and `error!()` macros.
//!
//! On stdout every event is one line:
//!
//! ```text
//! 14:02:11 INFO  stratum_v1::client: Share accepted job_id=4d2 nonce=0x1a2b3c4d
//! ```

use std::{env, fmt};
use time::OffsetDateTime;
use time::format_description::FormatItem;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
    },
    prelude::*,
    registry::LookupSpan,
};

#[cfg(target_os = "linux")]
use std::{io, os::unix::io::AsRawFd};

#[cfg(target_os = "linux")]
use nix::libc;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const CRATE_PREFIX: &str = "stratum_miner::";

const TIME_FORMAT: &[FormatItem<'static>] =
    time::macros::format_description!("[hour]:[minute]:[second]");

/// Check if stderr is connected to the systemd journal.
///
/// JOURNAL_STREAM holds `device:inode` of the journal socket; it only counts
/// if stderr still refers to that same file, since the variable survives
/// redirection.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    let Ok(journal_stream) = env::var("JOURNAL_STREAM") else {
        return false;
    };
    let Some((dev, ino)) = parse_journal_stream(&journal_stream) else {
        return false;
    };

    let fd = io::stderr().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }

    stat.st_dev as u64 == dev && stat.st_ino as u64 == ino
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_journal_stream(value: &str) -> Option<(u64, u64)> {
    let (dev, ino) = value.split_once(':')?;
    Some((dev.parse().ok()?, ino.parse().ok()?))
}

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            match tracing_journald::layer() {
                Ok(layer) => {
                    tracing_subscriber::registry()
                        .with(env_filter())
                        .with(layer)
                        .init();
                    return;
                }
                Err(e) => eprintln!("Failed to initialize journald logging, using stdout: {e}"),
            }
        }
    }

    use_stdout();
}

// Filter according to RUST_LOG, defaulting to INFO rather than ERROR.
fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .fmt_fields(DefaultFields::new())
                .event_format(LineFormatter),
        )
        .init();
    trace!("Logging to stdout");
}

/// Single-line event formatter: time, level, short target, message, fields.
struct LineFormatter;

#[derive(Default)]
struct FieldCollector {
    fields: Vec<(&'static str, String)>,
    message: Option<String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            self.fields.push((field.name(), unwrap_some(&formatted).to_string()));
        }
    }
}

/// `Some(x)` reads as `x` in a log line.
fn unwrap_some(formatted: &str) -> &str {
    formatted
        .strip_prefix("Some(")
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(formatted)
}

/// Our own modules lose the crate prefix; dependencies keep full paths.
fn short_target<'a>(target: &'a str, fields: &'a [(&'static str, String)]) -> &'a str {
    if let Some(stripped) = target.strip_prefix(CRATE_PREFIX) {
        return stripped;
    }
    if target == "log" {
        if let Some((_, real)) = fields.iter().find(|(k, _)| *k == "log.target") {
            return real.trim_matches('"');
        }
    }
    target
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (color, level) = match *event.metadata().level() {
            Level::ERROR => ("\x1b[31m", "ERROR"),
            Level::WARN => ("\x1b[33m", "WARN "),
            Level::INFO => ("\x1b[32m", "INFO "),
            Level::DEBUG => ("\x1b[34m", "DEBUG"),
            Level::TRACE => ("\x1b[35m", "TRACE"),
        };
        write!(writer, " {}{}\x1b[0m ", color, level)?;
        write!(writer, "{}: ", short_target(event.metadata().target(), &visitor.fields))?;

        if let Some(msg) = &visitor.message {
            write!(writer, "{}", msg)?;
        }

        let mut fields = visitor.fields.iter().filter(|(k, _)| !k.starts_with("log.")).peekable();
        if fields.peek().is_some() {
            write!(writer, "\x1b[90m")?;
            for (key, value) in fields {
                write!(writer, " {}={}", key, value.trim_matches('"'))?;
            }
            write!(writer, "\x1b[0m")?;
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now.format(TIME_FORMAT).map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}

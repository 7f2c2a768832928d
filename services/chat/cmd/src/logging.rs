//! Console log formatting for the chat binary.
//!
//! One line per event: wall clock, level, the subsystem the event came
//! from, the message, then any remaining fields as key=value pairs. The
//! subsystem defaults to the crate the event originated in; a `component`
//! field on the event overrides it, which the binary uses to group its
//! own task output.

use std::fmt::{self, Write as _};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const SUBSYSTEM_WIDTH: usize = 12;

const ANSI_RESET: &str = "\x1b[0m";
const ANSI_DIM: &str = "\x1b[90m";

/// Event formatter for the binary's console output
pub struct ChatLogFormatter {
    ansi: bool,
}

impl ChatLogFormatter {
    pub fn new() -> Self {
        Self { ansi: use_ansi() }
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.ansi {
            return "";
        }
        match *level {
            Level::ERROR => "\x1b[91m",
            Level::WARN => "\x1b[93m",
            Level::INFO => "\x1b[32m",
            Level::DEBUG | Level::TRACE => ANSI_DIM,
        }
    }
}

impl Default for ChatLogFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, N> FormatEvent<S, N> for ChatLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();

        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let subsystem = match fields.component.as_deref() {
            Some(component) => component.to_string(),
            None => subsystem_of(meta.target()),
        };

        let color = self.level_color(meta.level());
        let reset = if self.ansi { ANSI_RESET } else { "" };
        let dim = if self.ansi { ANSI_DIM } else { "" };

        write!(
            writer,
            "{} {}{:>5}{} {}{:<width$}{} {}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            color,
            meta.level().as_str(),
            reset,
            dim,
            clip(&subsystem),
            reset,
            fields.message,
            width = SUBSYSTEM_WIDTH,
        )?;
        if !fields.extras.is_empty() {
            write!(writer, "{}{}{}", dim, fields.extras, reset)?;
        }
        writeln!(writer)
    }
}

/// Collects the event's message, the `component` override, and everything
/// else into a key=value tail
#[derive(Default)]
struct FieldCollector {
    message: String,
    component: Option<String>,
    extras: String,
}

impl tracing::field::Visit for FieldCollector {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => {
                let _ = write!(self.extras, " {}={}", name, value);
            }
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => self.component = Some(strip_quotes(&format!("{:?}", value))),
            name => {
                let _ = write!(self.extras, " {}={:?}", name, value);
            }
        }
    }
}

/// Crate an event originated in, without the workspace prefix
fn subsystem_of(target: &str) -> String {
    let krate = target.split("::").next().unwrap_or(target);
    krate
        .strip_prefix("chat_")
        .unwrap_or(krate)
        .replace('_', "-")
}

fn clip(name: &str) -> String {
    if name.len() > SUBSYSTEM_WIDTH {
        format!("{}~", &name[..SUBSYSTEM_WIDTH - 1])
    } else {
        name.to_string()
    }
}

fn strip_quotes(s: &str) -> String {
    s.trim_matches('"').to_string()
}

fn use_ansi() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => false,
    }
}

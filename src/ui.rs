//! Log setup and the structured event surface. The engine emits a
//! fixed vocabulary of events (copying, deleting, adding_flags, ...)
//! through tracing; the machine format renders each line as
//! URL-encoded key=value pairs so wrappers can parse it.

use std::fmt;

use tracing::field::{Field, Visit};
use tracing::{error, info, Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::types::Uid;

pub const EVENT_TARGET: &str = "tern::event";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoFormat {
    Line,
    Machine,
}

impl std::str::FromStr for InfoFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "line" => Ok(Self::Line),
            "machine" => Ok(Self::Machine),
            other => Err(format!("unknown info format {other:?}")),
        }
    }
}

pub fn init_tracing(format: InfoFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        InfoFormat::Line => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(filter)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        InfoFormat::Machine => {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(filter)
                .event_format(MachineFormat)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}

struct MachineFormat;

impl<S, N> FormatEvent<S, N> for MachineFormat
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
        let mut visitor = PairVisitor::default();
        event.record(&mut visitor);
        writeln!(
            writer,
            "{}:{}:{}",
            event.metadata().level(),
            event.metadata().target(),
            visitor.encoded()
        )
    }
}

#[derive(Default)]
struct PairVisitor {
    pairs: Vec<(String, String)>,
}

impl PairVisitor {
    fn encoded(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl Visit for PairVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.pairs
            .push((field.name().to_string(), format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.pairs.push((field.name().to_string(), value.to_string()));
    }
}

// The event vocabulary. Kept as plain functions so call sites stay
// uniform and the field names never drift.

pub fn copying(account: &str, folder: &str, uid: Uid, num: usize, total: usize) {
    info!(
        target: EVENT_TARGET,
        event = "copying",
        account,
        folder,
        uid,
        num,
        total,
        "copying message"
    );
}

pub fn ignoring_copy(account: &str, folder: &str, uid: Uid) {
    info!(
        target: EVENT_TARGET,
        event = "ignoring_copy",
        account,
        folder,
        uid,
        "skipping ignored message"
    );
}

pub fn deleting(account: &str, folder: &str, uids: &[Uid]) {
    info!(
        target: EVENT_TARGET,
        event = "deleting",
        account,
        folder,
        count = uids.len(),
        uids = %crate::codec::sequence::format(uids),
        "deleting messages"
    );
}

pub fn adding_flags(account: &str, folder: &str, flag: char, uids: &[Uid]) {
    info!(
        target: EVENT_TARGET,
        event = "adding_flags",
        account,
        folder,
        flag = %flag,
        count = uids.len(),
        "adding flags"
    );
}

pub fn removing_flags(account: &str, folder: &str, flag: char, uids: &[Uid]) {
    info!(
        target: EVENT_TARGET,
        event = "removing_flags",
        account,
        folder,
        flag = %flag,
        count = uids.len(),
        "removing flags"
    );
}

pub fn thread_exited(account: &str, folder: &str, ok: bool) {
    info!(
        target: EVENT_TARGET,
        event = "thread_exited",
        account,
        folder,
        ok,
        "folder worker finished"
    );
}

pub fn main_exception(err: &dyn std::fmt::Display) {
    error!(
        target: EVENT_TARGET,
        event = "main_exception",
        error = %err,
        "fatal error"
    );
}

//! The single consumer of decoded records: pairs VFS entry and exit records
//! and turns every record into one structured log line.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use ovlsnoop_common::{FileEvent, OvlInuseEvent};

use crate::{
    events::{Event, ReaderStats, Tracer},
    ksyms::Ksyms,
    pairing::{Pairing, VfsPairer},
};

/// Resolved fields of one file operation log line.
struct FileReport {
    op: &'static str,
    phase: Option<&'static str>,
    path: String,
    stack: Option<String>,
    error: Option<String>,
}

pub struct Reporter {
    ksyms: Option<Ksyms>,
    pairer: VfsPairer,
}

impl Reporter {
    /// `ksyms` renders the captured kernel stacks; without it the frames are
    /// printed as raw addresses.
    pub fn new(ksyms: Option<Ksyms>, pair_window: Duration) -> Self {
        Self {
            ksyms,
            pairer: VfsPairer::new(pair_window),
        }
    }

    /// Reports records until every reader is gone.
    pub async fn run(&mut self, rx: &mut mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            self.handle(&event);
        }
    }

    pub fn handle(&mut self, event: &Event) {
        match event {
            Event::File(event) => self.report_file(event),
            Event::OvlInuse(event) => report_ovl_inuse(event),
        }
    }

    fn format_stack(&self, stack: &[u64]) -> String {
        match &self.ksyms {
            Some(ksyms) => ksyms.format_stack(stack),
            None => stack
                .iter()
                .map(|addr| format!("{addr:#x}"))
                .collect::<Vec<_>>()
                .join(" <- "),
        }
    }

    /// Pairs `event` and resolves the fields of its log line. VFS exits take
    /// the path and stack of their paired entry.
    fn file_report(&mut self, event: &FileEvent) -> Option<FileReport> {
        let op = match event.file_op() {
            Ok(op) => op,
            Err(e) => {
                warn!(target: "fileops", tgid = event.tgid, error = %e, "unknown operation");
                return None;
            }
        };

        let (phase, entry) = match self.pairer.observe(event) {
            Pairing::Passthrough => (None, None),
            Pairing::Entry => (Some("entry"), None),
            Pairing::Exit(entry) => (Some("exit"), entry),
        };
        let origin = entry.as_ref().unwrap_or(event);

        let stack = if origin.stack_size > 0 {
            Some(self.format_stack(origin.stack()))
        } else {
            None
        };
        let error = if event.error != 0 {
            Some(event.error_name().into_owned())
        } else {
            None
        };

        Some(FileReport {
            op: op.name(event.flags),
            phase,
            path: origin.path().into_owned(),
            stack,
            error,
        })
    }

    fn report_file(&mut self, event: &FileEvent) {
        let Some(report) = self.file_report(event) else {
            return;
        };
        info!(
            target: "fileops",
            op = report.op,
            phase = report.phase,
            path = %report.path,
            path2 = %event.path2(),
            flags = %format_args!("{:#x}", event.flags),
            error = report.error.as_deref(),
            tgid = event.tgid,
            process = %event.comm(),
            duration_ns = event.duration_ns,
            stack = report.stack.as_deref(),
            "file operation"
        );
    }

    /// Logs the pairing counters together with the reader counters.
    pub fn log_stats(&self, readers: &[(Tracer, &ReaderStats)]) {
        for (tracer, stats) in readers {
            match tracer {
                Tracer::FileOps => info!(
                    tracer = tracer.as_str(),
                    received = stats.received(),
                    malformed = stats.malformed(),
                    failed = stats.failed(),
                    paired = self.pairer.paired(),
                    orphaned = self.pairer.orphaned() + self.pairer.pending() as u64,
                    "statistics"
                ),
                Tracer::OvlInuse => info!(
                    tracer = tracer.as_str(),
                    received = stats.received(),
                    malformed = stats.malformed(),
                    failed = stats.failed(),
                    "statistics"
                ),
            }
        }
    }

    pub fn pairer(&self) -> &VfsPairer {
        &self.pairer
    }
}

fn report_ovl_inuse(event: &OvlInuseEvent) {
    warn!(
        target: "ovlinuse",
        inuse_path = %event.inuse_path(),
        mntns = event.mntns,
        tgid = event.tgid,
        process = %event.comm(),
        mount_src = %event.mount_src(),
        mount_dst = %event.mount_dst(),
        mount_data = %event.mount_data(),
        "OVERLAY IN-USE DETECTED"
    );
}

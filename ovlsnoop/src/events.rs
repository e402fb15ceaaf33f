//! Ring buffer readers. Each tracer gets one reader task which drains its
//! `EVENTS` ring buffer on readiness and forwards decoded records to the
//! consumer.

use std::{
    fmt,
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use aya::{
    maps::{MapData, MapError, RingBuf},
    Ebpf,
};
use thiserror::Error;
use tokio::{io::unix::AsyncFd, sync::mpsc};
use tracing::{debug, error, warn};

use ovlsnoop_common::{DecodeError, FileEvent, OvlInuseEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracer {
    FileOps,
    OvlInuse,
}

impl Tracer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tracer::FileOps => "fileops",
            Tracer::OvlInuse => "ovlinuse",
        }
    }
}

impl fmt::Display for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded ring buffer record.
#[derive(Clone, Copy)]
pub enum Event {
    File(FileEvent),
    OvlInuse(OvlInuseEvent),
}

impl Event {
    /// Decodes a raw record published by the given tracer.
    pub fn decode(tracer: Tracer, buf: &[u8]) -> Result<Self, DecodeError> {
        match tracer {
            Tracer::FileOps => FileEvent::from_bytes(buf).map(Event::File),
            Tracer::OvlInuse => OvlInuseEvent::from_bytes(buf).map(Event::OvlInuse),
        }
    }
}

/// Counters kept by a reader task.
#[derive(Debug, Default)]
pub struct ReaderStats {
    received: AtomicU64,
    malformed: AtomicU64,
    failed: AtomicBool,
}

impl ReaderStats {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Whether the reader ended with an error.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    IO(#[from] io::Error),

    #[error("map EVENTS not found in the eBPF object")]
    MapNotFound,
}

/// Takes the `EVENTS` ring buffer out of a loaded program, so that it can be
/// moved into a reader task.
pub fn take_ring_buf(ebpf: &mut Ebpf) -> Result<RingBuf<MapData>, ReaderError> {
    let map = ebpf.take_map("EVENTS").ok_or(ReaderError::MapNotFound)?;
    Ok(RingBuf::try_from(map)?)
}

/// Decodes every record of a drained batch, counting and skipping the
/// malformed ones.
fn decode_batch<'a, I>(tracer: Tracer, records: I, stats: &ReaderStats) -> Vec<Event>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut events = Vec::new();
    for record in records {
        stats.received.fetch_add(1, Ordering::Relaxed);
        match Event::decode(tracer, record) {
            Ok(event) => events.push(event),
            Err(e) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    tracer = tracer.as_str(),
                    len = record.len(),
                    error = e.to_string().as_str(),
                    "dropping malformed record"
                );
            }
        }
    }
    events
}

/// Drains the ring buffer each time it becomes readable and forwards the
/// records to `tx`. Returns when the consumer goes away; a readiness error
/// ends the reader.
pub async fn read_events(
    tracer: Tracer,
    ring_buf: RingBuf<MapData>,
    tx: mpsc::Sender<Event>,
    stats: Arc<ReaderStats>,
) -> Result<(), ReaderError> {
    let mut poll = AsyncFd::new(ring_buf)?;
    debug!(tracer = tracer.as_str(), "reading events");

    loop {
        let records = {
            let mut guard = poll.readable_mut().await?;
            let ring_buf = guard.get_inner_mut();

            let mut records = Vec::new();
            while let Some(item) = ring_buf.next() {
                records.push(item.to_vec());
            }
            guard.clear_ready();
            records
        };

        let events = decode_batch(tracer, records.iter().map(Vec::as_slice), &stats);
        for event in events {
            if tx.send(event).await.is_err() {
                debug!(tracer = tracer.as_str(), "consumer gone, stopping reader");
                return Ok(());
            }
        }
    }
}

/// Runs a reader to completion and reports its failure as soon as it
/// happens, since the tracer stops delivering records from then on.
pub async fn supervise_reader<F>(
    tracer: Tracer,
    stats: Arc<ReaderStats>,
    reader: F,
) -> Result<(), ReaderError>
where
    F: Future<Output = Result<(), ReaderError>>,
{
    let res = reader.await;
    if let Err(e) = &res {
        stats.failed.store(true, Ordering::Relaxed);
        error!(
            tracer = tracer.as_str(),
            error = e.to_string().as_str(),
            "reader failed, no more records from this tracer"
        );
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::mem::size_of;

    use ovlsnoop_common::FileOp;

    fn as_bytes<T>(v: &T) -> &[u8] {
        unsafe { std::slice::from_raw_parts(v as *const T as *const u8, size_of::<T>()) }
    }

    fn file_event() -> FileEvent {
        let mut event: FileEvent = unsafe { std::mem::zeroed() };
        event.op = FileOp::Mkdirat as u32;
        event.tgid = 42;
        event
    }

    #[test]
    fn decode_batch_skips_malformed() {
        let stats = ReaderStats::default();
        let event = file_event();
        let good = as_bytes(&event);
        let short = &good[..FileEvent::SIZE - 1];

        let events = decode_batch(Tracer::FileOps, [good, short, good], &stats);
        assert_eq!(events.len(), 2);
        assert_eq!(stats.received(), 3);
        assert_eq!(stats.malformed(), 1);
        assert!(matches!(events[0], Event::File(e) if e.tgid == 42));
    }

    #[test]
    fn decode_by_tracer() {
        let event = file_event();
        // A file operation record is shorter than an in-use record.
        assert!(Event::decode(Tracer::OvlInuse, as_bytes(&event)).is_err());

        let inuse: OvlInuseEvent = unsafe { std::mem::zeroed() };
        assert!(matches!(
            Event::decode(Tracer::OvlInuse, as_bytes(&inuse)),
            Ok(Event::OvlInuse(_))
        ));
    }

    #[tokio::test]
    async fn supervised_reader_failure_is_recorded() {
        let stats = Arc::new(ReaderStats::default());
        let res = supervise_reader(Tracer::OvlInuse, stats.clone(), async {
            Err(ReaderError::MapNotFound)
        })
        .await;
        assert!(matches!(res, Err(ReaderError::MapNotFound)));
        assert!(stats.failed());

        let stats = Arc::new(ReaderStats::default());
        let res = supervise_reader(Tracer::FileOps, stats.clone(), async { Ok(()) }).await;
        assert!(res.is_ok());
        assert!(!stats.failed());
    }

    #[test]
    fn tracer_names() {
        assert_eq!(Tracer::FileOps.to_string(), "fileops");
        assert_eq!(Tracer::OvlInuse.as_str(), "ovlinuse");
    }
}

//! Pairing of `vfs_mkdir` / `vfs_rmdir` entry snapshots with their exit
//! records. The two records share no identifier, so they are matched by
//! `(tgid, op)` and time.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use ovlsnoop_common::FileEvent;

pub const DEFAULT_PAIR_WINDOW: Duration = Duration::from_secs(1);

/// What the pairer did with an observed record.
#[derive(Clone, Copy)]
pub enum Pairing {
    /// Not a VFS operation.
    Passthrough,
    /// A VFS entry snapshot, held until its exit shows up.
    Entry,
    /// A VFS exit, with the matching entry snapshot if one was pending.
    Exit(Option<FileEvent>),
}

#[derive(Debug)]
pub struct VfsPairer {
    window_ns: u64,
    pending: HashMap<(u32, u32), VecDeque<FileEvent>>,
    paired: u64,
    orphaned: u64,
}

impl VfsPairer {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ns: window.as_nanos() as u64,
            pending: HashMap::new(),
            paired: 0,
            orphaned: 0,
        }
    }

    pub fn observe(&mut self, event: &FileEvent) -> Pairing {
        match event.file_op() {
            Ok(op) if op.is_vfs() => {}
            _ => return Pairing::Passthrough,
        }

        self.expire(event.timestamp_ns);

        let key = (event.tgid, event.op);
        if event.is_vfs_entry() {
            self.pending.entry(key).or_default().push_back(*event);
            return Pairing::Entry;
        }

        let entry = self.take_entry(key, event);
        if entry.is_some() {
            self.paired += 1;
        }
        Pairing::Exit(entry)
    }

    /// Removes the entry snapshot matching `exit`. The kernel stamps the
    /// entry with the same clock reading the exit's duration is measured
    /// from, so an exact match is preferred over the most recent entry
    /// within the window.
    fn take_entry(&mut self, key: (u32, u32), exit: &FileEvent) -> Option<FileEvent> {
        let queue = self.pending.get_mut(&key)?;
        let start = exit.timestamp_ns.saturating_sub(exit.duration_ns);

        let idx = queue
            .iter()
            .rposition(|entry| entry.timestamp_ns == start)
            .or_else(|| {
                queue.iter().rposition(|entry| {
                    entry.timestamp_ns <= exit.timestamp_ns
                        && exit.timestamp_ns - entry.timestamp_ns <= self.window_ns
                })
            })?;
        let entry = queue.remove(idx);
        if queue.is_empty() {
            self.pending.remove(&key);
        }
        entry
    }

    /// Drops the entry snapshots older than the window relative to
    /// `now_ns`, counting them as orphans. Returns how many were dropped.
    pub fn expire(&mut self, now_ns: u64) -> u64 {
        let window_ns = self.window_ns;
        let mut expired = 0;
        self.pending.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|entry| entry.timestamp_ns.saturating_add(window_ns) >= now_ns);
            expired += (before - queue.len()) as u64;
            !queue.is_empty()
        });
        self.orphaned += expired;
        expired
    }

    /// Number of entry snapshots waiting for their exit.
    pub fn pending(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    pub fn paired(&self) -> u64 {
        self.paired
    }

    pub fn orphaned(&self) -> u64 {
        self.orphaned
    }
}

impl Default for VfsPairer {
    fn default() -> Self {
        Self::new(DEFAULT_PAIR_WINDOW)
    }
}

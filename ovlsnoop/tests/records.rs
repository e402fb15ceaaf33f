//! Decoding and pairing of synthetic ring buffer records through the public
//! API.

use std::{mem::size_of, time::Duration};

use ovlsnoop::{
    events::{Event, Tracer},
    pairing::{Pairing, VfsPairer},
};
use ovlsnoop_common::{
    DecodeError, FileEvent, FileOp, OvlInuseEvent, AT_REMOVEDIR, MAX_STACK_DEPTH, VFS_ENTRY_FLAG,
};

fn to_bytes<T>(v: &T) -> Vec<u8> {
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, size_of::<T>()) }.to_vec()
}

fn put(dst: &mut [u8], s: &str) {
    dst[..s.len()].copy_from_slice(s.as_bytes());
}

fn file_event(op: FileOp) -> FileEvent {
    let mut event: FileEvent = unsafe { std::mem::zeroed() };
    event.op = op as u32;
    event.tgid = 4242;
    put(&mut event.comm, "rm");
    event
}

#[test]
fn unlinkat_of_directory() {
    let mut event = file_event(FileOp::Unlinkat);
    event.timestamp_ns = 5_000;
    event.duration_ns = 1_200;
    event.flags = AT_REMOVEDIR;
    put(&mut event.path, "/tmp/a/b");

    // Ring buffer records are padded to 8 bytes; trailing bytes are ignored.
    let mut record = to_bytes(&event);
    record.extend_from_slice(&[0; 8]);

    let decoded = match Event::decode(Tracer::FileOps, &record).unwrap() {
        Event::File(decoded) => decoded,
        Event::OvlInuse(_) => unreachable!(),
    };
    let op = decoded.file_op().unwrap();
    assert_eq!(op.name(decoded.flags), "RMDIR");
    assert_eq!(decoded.path(), "/tmp/a/b");
    assert_eq!(decoded.comm(), "rm");
    assert_eq!(decoded.error_name(), "");
    assert!(decoded.stack().is_empty());
}

#[test]
fn failed_mount() {
    let mut event = file_event(FileOp::Mount);
    event.error = -16;
    put(&mut event.path, "/merged");
    put(&mut event.path2, "lowerdir=/l,upperdir=/u,workdir=/w");

    let decoded = FileEvent::from_bytes(&to_bytes(&event)).unwrap();
    assert_eq!(decoded.error_name(), "EBUSY");
    assert!(decoded.path2().contains("upperdir=/u"));
}

#[test]
fn truncated_records_are_rejected() {
    let record = to_bytes(&file_event(FileOp::Stat));
    assert_eq!(
        FileEvent::from_bytes(&record[..100]).err(),
        Some(DecodeError::Truncated {
            expected: FileEvent::SIZE,
            actual: 100
        })
    );
    assert!(Event::decode(Tracer::OvlInuse, &record).is_err());
}

#[test]
fn overlay_conflict() {
    let mut event: OvlInuseEvent = unsafe { std::mem::zeroed() };
    event.tgid = 77;
    event.mntns = 4026531841;
    put(&mut event.comm, "containerd");
    put(&mut event.d0, "upper");
    put(&mut event.d1, "layer1");
    put(&mut event.d2, "snapshots");
    put(&mut event.mount_src, "overlay");
    put(&mut event.mount_dst, "/run/ctr/rootfs");
    put(&mut event.mount_data, "lowerdir=/l,upperdir=/s/layer1/upper");

    let decoded = match Event::decode(Tracer::OvlInuse, &to_bytes(&event)).unwrap() {
        Event::OvlInuse(decoded) => decoded,
        Event::File(_) => unreachable!(),
    };
    assert_eq!(decoded.inuse_path(), "snapshots/layer1/upper");
    assert_eq!(decoded.mount_dst(), "/run/ctr/rootfs");
    assert!(decoded.mount_data().contains("upperdir="));
}

#[test]
fn vfs_entry_and_exit_pair() {
    let mut entry = file_event(FileOp::VfsRmdir);
    entry.timestamp_ns = 10_000;
    entry.flags = VFS_ENTRY_FLAG;
    entry.stack_size = 3;
    entry.stack[..3].copy_from_slice(&[0xffffffff81001000, 0xffffffff81002000, 0xffffffff81003000]);
    put(&mut entry.path, "a/b");

    let mut exit = file_event(FileOp::VfsRmdir);
    exit.timestamp_ns = 12_500;
    exit.duration_ns = 2_500;
    exit.error = -39;

    let entry = FileEvent::from_bytes(&to_bytes(&entry)).unwrap();
    let exit = FileEvent::from_bytes(&to_bytes(&exit)).unwrap();
    assert!(entry.is_vfs_entry());
    assert!(!exit.is_vfs_entry());
    assert_eq!(entry.stack().len(), 3);
    assert!(entry.stack().len() <= MAX_STACK_DEPTH);

    let mut pairer = VfsPairer::new(Duration::from_millis(1));
    assert!(matches!(pairer.observe(&entry), Pairing::Entry));
    match pairer.observe(&exit) {
        Pairing::Exit(Some(paired)) => {
            assert_eq!(paired.path(), "a/b");
            assert_eq!(exit.error_name(), "ENOTEMPTY");
        }
        _ => panic!("exit was not paired with its entry"),
    }
    assert_eq!(pairer.paired(), 1);
}

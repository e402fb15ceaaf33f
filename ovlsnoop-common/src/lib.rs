#![cfg_attr(not(feature = "user"), no_std)]

/// Length of the task command name, including the trailing NUL.
pub const TASK_COMM_LEN: usize = 16;

/// Bound of the path slots in file operation records.
pub const MAX_PATH_LEN: usize = 128;

/// Number of kernel stack frames captured for VFS entry events.
pub const MAX_STACK_DEPTH: usize = 16;

/// Bound of a single dentry name read while synthesizing a file operation
/// path (name and parent).
pub const DENTRY_READ_LEN: usize = 48;

/// Bound of each dentry name slot in overlay in-use records.
pub const DENTRY_NAME_LEN: usize = 64;

/// Bound of the source and destination strings captured from `mount(2)`.
pub const MOUNT_PATH_LEN: usize = 256;

/// Bound of the data (options) string captured from `mount(2)`.
pub const MOUNT_DATA_LEN: usize = 512;

/// `unlinkat(2)` flag marking a directory removal.
pub const AT_REMOVEDIR: u32 = 0x200;

/// Value of `FileEvent::flags` marking a VFS entry snapshot.
pub const VFS_ENTRY_FLAG: u32 = 1;

/// Number of correlation entries kept per map.
pub const CTX_MAX_ENTRIES: u32 = 10240;

/// Size of each ring buffer, in bytes.
pub const RING_BUF_SIZE: u32 = 256 * 1024;

/// Largest errno the kernel encodes in a return value.
pub const MAX_ERRNO: i64 = 4095;

/// Extracts the negative errno from a syscall or kernel function return
/// value, 0 on success. Pointer returns are errors only inside the
/// `-MAX_ERRNO..=-1` range.
#[inline(always)]
pub const fn ret_error(ret: i64) -> i32 {
    if ret < 0 && ret >= -MAX_ERRNO {
        ret as i32
    } else {
        0
    }
}

/// Operations observed by the file operations tracer. The discriminants are
/// the `op` values carried in `FileEvent`.
#[cfg_attr(feature = "user", derive(Debug, PartialEq, Eq, Hash))]
#[derive(Copy, Clone)]
#[repr(u32)]
pub enum FileOp {
    Mount = 1,
    Umount = 2,
    Unlinkat = 3,
    Mkdirat = 4,
    Stat = 5,
    OvlWorkdirCreate = 6,
    OvlWorkdirCleanup = 7,
    VfsMkdir = 8,
    VfsRmdir = 9,
}

impl FileOp {
    /// Whether the operation is observed through a `vfs_*` kprobe, which
    /// emits an entry snapshot in addition to the exit record.
    pub const fn is_vfs(self) -> bool {
        matches!(self, FileOp::VfsMkdir | FileOp::VfsRmdir)
    }
}

/// Record published on the file operations ring buffer, one per completed
/// operation (plus one entry snapshot for `vfs_mkdir` / `vfs_rmdir`).
#[derive(Copy, Clone)]
#[repr(C)]
pub struct FileEvent {
    pub timestamp_ns: u64,
    pub duration_ns: u64,
    pub stack: [u64; MAX_STACK_DEPTH],
    /// Negative errno, or 0 on success.
    pub error: i32,
    pub tgid: u32,
    pub op: u32,
    /// Syscall flags, `mkdirat` mode, or `VFS_ENTRY_FLAG` for VFS entry
    /// snapshots.
    pub flags: u32,
    pub stack_size: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub path: [u8; MAX_PATH_LEN],
    pub path2: [u8; MAX_PATH_LEN],
}

/// Record published on the overlay in-use ring buffer when an overlay
/// mount admission predicate reports a conflict.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct OvlInuseEvent {
    pub timestamp_ns: u64,
    pub mntns: u32,
    pub tgid: u32,
    pub comm: [u8; TASK_COMM_LEN],
    /// The dentry itself.
    pub d0: [u8; DENTRY_NAME_LEN],
    /// Its parent.
    pub d1: [u8; DENTRY_NAME_LEN],
    /// Its grandparent.
    pub d2: [u8; DENTRY_NAME_LEN],
    pub mount_src: [u8; MOUNT_PATH_LEN],
    pub mount_dst: [u8; MOUNT_PATH_LEN],
    pub mount_data: [u8; MOUNT_DATA_LEN],
}

/// State saved between a syscall's entry and exit tracepoints.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct SyscallCtx {
    pub start_ns: u64,
    pub op: u32,
    pub flags: u32,
    pub path: [u8; MAX_PATH_LEN],
    pub path2: [u8; MAX_PATH_LEN],
}

/// State saved between a kprobe and its kretprobe.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct KprobeCtx {
    pub start_ns: u64,
    pub op: u32,
    pub _pad: u32,
}

/// Arguments of an in-flight `mount(2)` call.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct MountArgs {
    pub src: [u8; MOUNT_PATH_LEN],
    pub dst: [u8; MOUNT_PATH_LEN],
    pub data: [u8; MOUNT_DATA_LEN],
    pub mntns: u32,
}

/// Runtime switches of the overlay in-use tracer.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct OvlConfig {
    /// Emit events from `ovl_is_inuse` (non-zero) or only from
    /// `ovl_inuse_trylock` (zero).
    pub trace_is_inuse: u32,
}

/// Process name filter of the file operations tracer. An empty name (first
/// byte NUL) disables tracing.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TargetComm {
    pub comm: [u8; TASK_COMM_LEN],
}

impl TargetComm {
    /// Compares the filter with a task command name byte-wise up to the
    /// first NUL of the filter. An empty filter never matches.
    #[inline(always)]
    pub fn matches(&self, comm: &[u8; TASK_COMM_LEN]) -> bool {
        if self.comm[0] == 0 {
            return false;
        }
        for i in 0..TASK_COMM_LEN {
            if self.comm[i] != comm[i] {
                return false;
            }
            if self.comm[i] == 0 {
                break;
            }
        }
        true
    }
}

#[cfg(feature = "user")]
pub use user::*;

#[cfg(feature = "user")]
mod user {
    use std::{borrow::Cow, mem, ptr};

    use nix::errno::Errno;

    use super::*;

    unsafe impl aya::Pod for TargetComm {}
    unsafe impl aya::Pod for OvlConfig {}
    unsafe impl aya::Pod for SyscallCtx {}
    unsafe impl aya::Pod for KprobeCtx {}
    unsafe impl aya::Pod for MountArgs {}

    #[derive(thiserror::Error, Debug, PartialEq, Eq)]
    pub enum DecodeError {
        #[error("truncated record: expected {expected} bytes, got {actual}")]
        Truncated { expected: usize, actual: usize },
    }

    #[derive(thiserror::Error, Debug, PartialEq, Eq)]
    #[error("unknown file operation {0}")]
    pub struct UnknownFileOp(pub u32);

    impl TryFrom<u32> for FileOp {
        type Error = UnknownFileOp;

        fn try_from(op: u32) -> Result<Self, Self::Error> {
            Ok(match op {
                1 => FileOp::Mount,
                2 => FileOp::Umount,
                3 => FileOp::Unlinkat,
                4 => FileOp::Mkdirat,
                5 => FileOp::Stat,
                6 => FileOp::OvlWorkdirCreate,
                7 => FileOp::OvlWorkdirCleanup,
                8 => FileOp::VfsMkdir,
                9 => FileOp::VfsRmdir,
                _ => return Err(UnknownFileOp(op)),
            })
        }
    }

    impl FileOp {
        /// Human readable name. `unlinkat` is reported as `RMDIR` or
        /// `UNLINK` depending on `AT_REMOVEDIR`.
        pub fn name(self, flags: u32) -> &'static str {
            match self {
                FileOp::Mount => "MOUNT",
                FileOp::Umount => "UMOUNT",
                FileOp::Unlinkat if flags & AT_REMOVEDIR != 0 => "RMDIR",
                FileOp::Unlinkat => "UNLINK",
                FileOp::Mkdirat => "MKDIR",
                FileOp::Stat => "STAT",
                FileOp::OvlWorkdirCreate => "OVL_WORKDIR_CREATE",
                FileOp::OvlWorkdirCleanup => "OVL_WORKDIR_CLEANUP",
                FileOp::VfsMkdir => "VFS_MKDIR",
                FileOp::VfsRmdir => "VFS_RMDIR",
            }
        }
    }

    impl TargetComm {
        /// Builds the filter from a process name. Names longer than the
        /// kernel's comm field are truncated the way the kernel truncates
        /// them, keeping the trailing NUL.
        pub fn new(name: &str) -> Self {
            let mut comm = [0u8; TASK_COMM_LEN];
            let bytes = name.as_bytes();
            let len = bytes.len().min(TASK_COMM_LEN - 1);
            comm[..len].copy_from_slice(&bytes[..len]);
            TargetComm { comm }
        }

        pub fn disabled() -> Self {
            TargetComm {
                comm: [0u8; TASK_COMM_LEN],
            }
        }

        pub fn is_disabled(&self) -> bool {
            self.comm[0] == 0
        }

        pub fn as_str(&self) -> Cow<'_, str> {
            c_str(&self.comm)
        }
    }

    /// Reads a fixed-size record out of a ring buffer item. The item may be
    /// longer than the record (ring buffer samples are 8-byte rounded).
    fn read_record<T: Copy>(buf: &[u8]) -> Result<T, DecodeError> {
        let expected = mem::size_of::<T>();
        if buf.len() < expected {
            return Err(DecodeError::Truncated {
                expected,
                actual: buf.len(),
            });
        }
        // SAFETY: the length is checked above and the record types consist
        // of plain integers and byte arrays, for which every bit pattern is
        // valid.
        Ok(unsafe { ptr::read_unaligned(buf.as_ptr() as *const T) })
    }

    /// Interprets a NUL-padded byte array as a string, stopping at the first
    /// NUL (or the end of the array).
    pub fn c_str(buf: &[u8]) -> Cow<'_, str> {
        let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..len])
    }

    /// Symbolic name of a negative errno as returned by a syscall or kernel
    /// function. Returns an empty string for non-negative values.
    pub fn errno_name(error: i32) -> Cow<'static, str> {
        if error >= 0 {
            return Cow::Borrowed("");
        }
        let errno = match error.checked_neg() {
            Some(errno) => Errno::from_raw(errno),
            None => return format!("errno {error}").into(),
        };
        match errno {
            Errno::ENOENT => "ENOENT".into(),
            Errno::EACCES => "EACCES".into(),
            Errno::EPERM => "EPERM".into(),
            Errno::ENOTDIR => "ENOTDIR".into(),
            Errno::EISDIR => "EISDIR".into(),
            Errno::EEXIST => "EEXIST".into(),
            Errno::ENOTEMPTY => "ENOTEMPTY".into(),
            Errno::EBUSY => "EBUSY".into(),
            Errno::EINVAL => "EINVAL".into(),
            Errno::EROFS => "EROFS".into(),
            Errno::UnknownErrno => format!("errno {}", -error).into(),
            other => other.desc().into(),
        }
    }

    impl FileEvent {
        pub const SIZE: usize = mem::size_of::<Self>();

        pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
            read_record(buf)
        }

        pub fn file_op(&self) -> Result<FileOp, UnknownFileOp> {
            FileOp::try_from(self.op)
        }

        /// Whether this is the entry snapshot of a `vfs_mkdir` / `vfs_rmdir`
        /// call rather than its exit record.
        pub fn is_vfs_entry(&self) -> bool {
            matches!(self.file_op(), Ok(op) if op.is_vfs())
                && self.flags == VFS_ENTRY_FLAG
                && self.duration_ns == 0
        }

        /// Captured kernel frames, bounded by `stack_size` and cut at the
        /// first zero address.
        pub fn stack(&self) -> &[u64] {
            let size = (self.stack_size as usize).min(MAX_STACK_DEPTH);
            let frames = &self.stack[..size];
            let len = frames.iter().position(|&a| a == 0).unwrap_or(size);
            &frames[..len]
        }

        pub fn error_name(&self) -> Cow<'static, str> {
            errno_name(self.error)
        }

        pub fn comm(&self) -> Cow<'_, str> {
            c_str(&self.comm)
        }

        pub fn path(&self) -> Cow<'_, str> {
            c_str(&self.path)
        }

        pub fn path2(&self) -> Cow<'_, str> {
            c_str(&self.path2)
        }
    }

    impl OvlInuseEvent {
        pub const SIZE: usize = mem::size_of::<Self>();

        pub fn from_bytes(buf: &[u8]) -> Result<Self, DecodeError> {
            read_record(buf)
        }

        /// Joins the captured dentry names, outermost first.
        pub fn inuse_path(&self) -> String {
            let names = [c_str(&self.d2), c_str(&self.d1), c_str(&self.d0)];
            names
                .iter()
                .filter(|name| !name.is_empty())
                .map(|name| &**name)
                .collect::<Vec<_>>()
                .join("/")
        }

        pub fn comm(&self) -> Cow<'_, str> {
            c_str(&self.comm)
        }

        pub fn mount_src(&self) -> Cow<'_, str> {
            c_str(&self.mount_src)
        }

        pub fn mount_dst(&self) -> Cow<'_, str> {
            c_str(&self.mount_dst)
        }

        pub fn mount_data(&self) -> Cow<'_, str> {
            c_str(&self.mount_data)
        }
    }
}

#[cfg(all(test, feature = "user"))]
mod tests {
    use core::mem::{offset_of, size_of};

    use super::*;

    fn file_event(op: FileOp) -> FileEvent {
        FileEvent {
            timestamp_ns: 1_000,
            duration_ns: 0,
            stack: [0; MAX_STACK_DEPTH],
            error: 0,
            tgid: 42,
            op: op as u32,
            flags: 0,
            stack_size: 0,
            comm: [0; TASK_COMM_LEN],
            path: [0; MAX_PATH_LEN],
            path2: [0; MAX_PATH_LEN],
        }
    }

    fn as_bytes<T>(v: &T) -> &[u8] {
        unsafe { core::slice::from_raw_parts(v as *const T as *const u8, size_of::<T>()) }
    }

    #[test]
    fn file_event_layout() {
        assert_eq!(offset_of!(FileEvent, stack), 16);
        assert_eq!(offset_of!(FileEvent, error), 144);
        assert_eq!(offset_of!(FileEvent, tgid), 148);
        assert_eq!(offset_of!(FileEvent, op), 152);
        assert_eq!(offset_of!(FileEvent, flags), 156);
        assert_eq!(offset_of!(FileEvent, stack_size), 160);
        assert_eq!(offset_of!(FileEvent, comm), 164);
        assert_eq!(offset_of!(FileEvent, path), 180);
        assert_eq!(offset_of!(FileEvent, path2), 308);
        assert_eq!(size_of::<FileEvent>(), 440);
    }

    #[test]
    fn ovl_inuse_event_layout() {
        assert_eq!(offset_of!(OvlInuseEvent, mntns), 8);
        assert_eq!(offset_of!(OvlInuseEvent, tgid), 12);
        assert_eq!(offset_of!(OvlInuseEvent, comm), 16);
        assert_eq!(offset_of!(OvlInuseEvent, d0), 32);
        assert_eq!(offset_of!(OvlInuseEvent, d2), 160);
        assert_eq!(offset_of!(OvlInuseEvent, mount_src), 224);
        assert_eq!(offset_of!(OvlInuseEvent, mount_dst), 480);
        assert_eq!(offset_of!(OvlInuseEvent, mount_data), 736);
        assert_eq!(size_of::<OvlInuseEvent>(), 1248);
    }

    #[test]
    fn map_value_sizes() {
        assert_eq!(size_of::<SyscallCtx>(), 272);
        assert_eq!(size_of::<KprobeCtx>(), 16);
        assert_eq!(size_of::<MountArgs>(), 1028);
    }

    #[test]
    fn target_comm_truncates_and_pads() {
        let comm = TargetComm::new("a-very-long-process-name");
        assert_eq!(comm.as_str(), "a-very-long-pro");
        assert_eq!(comm.comm[15], 0);

        let comm = TargetComm::new("mkdir");
        assert_eq!(&comm.comm[..6], b"mkdir\0");
        assert!(!comm.is_disabled());
        assert!(TargetComm::new("").is_disabled());
        assert!(TargetComm::disabled().is_disabled());
    }

    #[test]
    fn target_comm_matching() {
        let filter = TargetComm::new("rm");
        assert!(filter.matches(&TargetComm::new("rm").comm));
        assert!(!filter.matches(&TargetComm::new("rmdir").comm));
        assert!(!filter.matches(&TargetComm::new("r").comm));
        assert!(!TargetComm::disabled().matches(&TargetComm::new("rm").comm));
        assert!(!TargetComm::disabled().matches(&TargetComm::disabled().comm));

        let full = TargetComm::new("fifteen-chars-x");
        assert!(full.matches(&TargetComm::new("fifteen-chars-x").comm));
    }

    #[test]
    fn file_op_names() {
        assert_eq!(FileOp::Unlinkat.name(AT_REMOVEDIR), "RMDIR");
        assert_eq!(FileOp::Unlinkat.name(0), "UNLINK");
        assert_eq!(FileOp::Mkdirat.name(0o755), "MKDIR");
        assert_eq!(FileOp::Stat.name(0), "STAT");
        assert_eq!(FileOp::try_from(9), Ok(FileOp::VfsRmdir));
        assert_eq!(FileOp::try_from(10), Err(UnknownFileOp(10)));
        assert_eq!(FileOp::try_from(0), Err(UnknownFileOp(0)));
    }

    #[test]
    fn decode_file_event() {
        let mut event = file_event(FileOp::Mkdirat);
        event.path[..7].copy_from_slice(b"/tmp/a\0");
        event.comm[..5].copy_from_slice(b"mkdir");
        event.error = -17;

        let mut buf = as_bytes(&event).to_vec();
        // ring buffer samples are rounded up; trailing bytes are ignored
        buf.extend_from_slice(&[0xff; 8]);
        let decoded = FileEvent::from_bytes(&buf).unwrap();
        assert_eq!(decoded.path(), "/tmp/a");
        assert_eq!(decoded.comm(), "mkdir");
        assert_eq!(decoded.tgid, 42);
        assert_eq!(decoded.error_name(), "EEXIST");
        assert_eq!(decoded.file_op(), Ok(FileOp::Mkdirat));
    }

    #[test]
    fn decode_truncated_record() {
        let event = file_event(FileOp::Stat);
        let buf = &as_bytes(&event)[..100];
        assert_eq!(
            FileEvent::from_bytes(buf).err(),
            Some(DecodeError::Truncated {
                expected: 440,
                actual: 100
            })
        );
        assert!(OvlInuseEvent::from_bytes(&[0u8; 1247]).is_err());
    }

    #[test]
    fn vfs_entry_detection() {
        let mut event = file_event(FileOp::VfsMkdir);
        event.flags = VFS_ENTRY_FLAG;
        assert!(event.is_vfs_entry());

        event.duration_ns = 10;
        assert!(!event.is_vfs_entry());

        // flags == 1 on a syscall op is a syscall flag, not the sentinel
        let mut event = file_event(FileOp::Umount);
        event.flags = VFS_ENTRY_FLAG;
        assert!(!event.is_vfs_entry());
    }

    #[test]
    fn stack_frames_are_bounded() {
        let mut event = file_event(FileOp::VfsRmdir);
        event.stack[0] = 0xffff_ffff_8100_0000;
        event.stack[1] = 0xffff_ffff_8100_0010;
        event.stack_size = 2;
        assert_eq!(event.stack().len(), 2);

        event.stack_size = 64;
        assert_eq!(event.stack().len(), 2);

        event.stack_size = 0;
        assert!(event.stack().is_empty());
    }

    #[test]
    fn inuse_path_joins_ancestors() {
        let mut event: OvlInuseEvent = unsafe { core::mem::zeroed() };
        event.d0[..5].copy_from_slice(b"upper");
        assert_eq!(event.inuse_path(), "upper");
        event.d1[..2].copy_from_slice(b"42");
        assert_eq!(event.inuse_path(), "42/upper");
        event.d2[..9].copy_from_slice(b"snapshots");
        assert_eq!(event.inuse_path(), "snapshots/42/upper");
    }

    #[test]
    fn errno_names() {
        assert_eq!(errno_name(0), "");
        assert_eq!(errno_name(-16), "EBUSY");
        assert_eq!(errno_name(-2), "ENOENT");
        assert_eq!(errno_name(-39), "ENOTEMPTY");
        assert_eq!(errno_name(-28), "No space left on device");
        assert_eq!(errno_name(i32::MIN), format!("errno {}", i32::MIN));
    }

    #[test]
    fn ret_error_decodes_errors_only() {
        assert_eq!(ret_error(0), 0);
        assert_eq!(ret_error(3), 0);
        assert_eq!(ret_error(-16), -16);
        assert_eq!(ret_error(-MAX_ERRNO), -4095);
        assert_eq!(ret_error(-MAX_ERRNO - 1), 0);
        // A successful pointer return whose low half is negative as i32.
        assert_eq!(ret_error(0xffff_8881_8000_0000_u64 as i64), 0);
        assert_eq!(ret_error(i64::MIN), 0);
    }
}

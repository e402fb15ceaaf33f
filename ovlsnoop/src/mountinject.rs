//! Grafting a host directory tree into the mount namespace of a running
//! process: the tree is cloned into a detached mount while still in the
//! host namespace, then moved onto the target path from inside the
//! process' namespace.

use std::{
    ffi::{CString, NulError},
    fmt,
    fs::File,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    mount::{umount2, MntFlags},
    sched::{setns, unshare, CloneFlags},
    sys::stat::Mode,
    unistd::{mkdir, Pid},
};
use thiserror::Error;

const OPEN_TREE_CLONE: libc::c_uint = 1;
const OPEN_TREE_CLOEXEC: libc::c_uint = libc::O_CLOEXEC as libc::c_uint;
const AT_RECURSIVE: libc::c_uint = 0x8000;
const MOVE_MOUNT_F_EMPTY_PATH: libc::c_uint = 0x4;

/// Steps of the injection, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    OpenTree,
    Unshare,
    OpenNamespace,
    Setns,
    Mkdir,
    Umount,
    MoveMount,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::OpenTree => "open_tree",
            Step::Unshare => "unshare",
            Step::OpenNamespace => "open mount namespace",
            Step::Setns => "setns",
            Step::Mkdir => "mkdir",
            Step::Umount => "umount",
            Step::MoveMount => "move_mount",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum MountInjectError {
    #[error("{step}: {source}")]
    Step {
        step: Step,
        #[source]
        source: io::Error,
    },

    #[error("invalid path {0:?}: {1}")]
    InvalidPath(PathBuf, NulError),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UsageError {
    #[error("expected 3 arguments, got {0}")]
    ArgumentCount(usize),

    #[error("invalid pid {0:?}")]
    InvalidPid(String),
}

pub const USAGE: &str = "usage: ovlsnoop-mount-inject <pid> <source> <target>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInjection {
    pid: Pid,
    source: PathBuf,
    target: PathBuf,
}

/// Wraps the error of a failed step.
fn step_error<E: Into<io::Error>>(step: Step) -> impl FnOnce(E) -> MountInjectError {
    move |e| MountInjectError::Step {
        step,
        source: e.into(),
    }
}

fn to_cstring(path: &Path) -> Result<CString, MountInjectError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| MountInjectError::InvalidPath(path.to_path_buf(), e))
}

#[cfg(feature = "debug-steps")]
fn progress(step: Step) {
    eprintln!("{step}");
}

#[cfg(not(feature = "debug-steps"))]
fn progress(_step: Step) {}

impl MountInjection {
    pub fn new<S, T>(pid: Pid, source: S, target: T) -> Self
    where
        S: Into<PathBuf>,
        T: Into<PathBuf>,
    {
        Self {
            pid,
            source: source.into(),
            target: target.into(),
        }
    }

    /// Parses the `<pid> <source> <target>` command line (without the
    /// program name).
    pub fn from_args<I>(args: I) -> Result<Self, UsageError>
    where
        I: IntoIterator<Item = String>,
    {
        let args: Vec<String> = args.into_iter().collect();
        if args.len() != 3 {
            return Err(UsageError::ArgumentCount(args.len()));
        }
        let pid = match args[0].parse::<i32>() {
            Ok(pid) if pid > 0 => Pid::from_raw(pid),
            _ => return Err(UsageError::InvalidPid(args[0].clone())),
        };
        Ok(Self::new(pid, &args[1], &args[2]))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Runs all steps. Switches the mount namespace of the calling process,
    /// so it must be single-threaded.
    pub fn run(&self) -> Result<(), MountInjectError> {
        let tree = self.open_tree()?;

        progress(Step::Unshare);
        unshare(CloneFlags::CLONE_FS).map_err(step_error(Step::Unshare))?;

        progress(Step::OpenNamespace);
        let ns = File::open(format!("/proc/{}/ns/mnt", self.pid))
            .map_err(step_error(Step::OpenNamespace))?;

        progress(Step::Setns);
        setns(&ns, CloneFlags::CLONE_NEWNS).map_err(step_error(Step::Setns))?;

        progress(Step::Mkdir);
        match mkdir(&self.target, Mode::from_bits_truncate(0o755)) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(e) => return Err(step_error(Step::Mkdir)(e)),
        }

        progress(Step::Umount);
        match umount2(&self.target, MntFlags::MNT_DETACH) {
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
            Err(e) => return Err(step_error(Step::Umount)(e)),
        }

        self.move_mount(&tree)
    }

    /// Clones the source tree, submounts included, into a detached mount.
    fn open_tree(&self) -> Result<OwnedFd, MountInjectError> {
        progress(Step::OpenTree);
        let source = to_cstring(&self.source)?;
        let fd = unsafe {
            libc::syscall(
                libc::SYS_open_tree,
                libc::AT_FDCWD,
                source.as_ptr(),
                OPEN_TREE_CLONE | OPEN_TREE_CLOEXEC | AT_RECURSIVE,
            )
        };
        if fd < 0 {
            return Err(step_error(Step::OpenTree)(io::Error::last_os_error()));
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
    }

    /// Attaches the detached mount onto the target path.
    fn move_mount(&self, tree: &OwnedFd) -> Result<(), MountInjectError> {
        progress(Step::MoveMount);
        let target = to_cstring(&self.target)?;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_move_mount,
                tree.as_raw_fd(),
                c"".as_ptr(),
                libc::AT_FDCWD,
                target.as_ptr(),
                MOVE_MOUNT_F_EMPTY_PATH,
            )
        };
        if ret < 0 {
            return Err(step_error(Step::MoveMount)(io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn from_args_when_correct() {
        let injection = MountInjection::from_args(args(&["1234", "/host/data", "/mnt/x"])).unwrap();
        assert_eq!(injection.pid(), Pid::from_raw(1234));
        assert_eq!(injection.source(), Path::new("/host/data"));
        assert_eq!(injection.target(), Path::new("/mnt/x"));
    }

    #[test]
    fn from_args_wrong_count() {
        assert_eq!(
            MountInjection::from_args(args(&["1234", "/host/data"])),
            Err(UsageError::ArgumentCount(2))
        );
        assert_eq!(
            MountInjection::from_args(args(&["1", "2", "3", "4"])),
            Err(UsageError::ArgumentCount(4))
        );
    }

    #[test]
    fn from_args_invalid_pid() {
        for pid in ["abc", "0", "-5", ""] {
            assert_eq!(
                MountInjection::from_args(args(&[pid, "/a", "/b"])),
                Err(UsageError::InvalidPid(pid.to_string()))
            );
        }
    }

    #[test]
    fn step_errors_name_the_step() {
        let err = step_error(Step::MoveMount)(Errno::ENOENT);
        assert!(err.to_string().starts_with("move_mount: "));
        let err = step_error(Step::OpenNamespace)(io::Error::from(io::ErrorKind::NotFound));
        assert!(err.to_string().starts_with("open mount namespace: "));
    }

    #[test]
    fn nul_in_path_is_rejected() {
        let err = to_cstring(Path::new("/a\0b")).unwrap_err();
        assert!(matches!(err, MountInjectError::InvalidPath(..)));
    }

    #[test]
    fn open_tree_of_missing_source() {
        let injection = MountInjection::new(Pid::this(), "/nonexistent/ovlsnoop", "/tmp/x");
        match injection.open_tree() {
            Err(MountInjectError::Step { step, .. }) => assert_eq!(step, Step::OpenTree),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

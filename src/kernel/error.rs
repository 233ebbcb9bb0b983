use core::fmt;

// Error kinds the core reports to its callers. Transient shortages (no
// free frame, no free cache slot) are retried internally and never show
// up here; fatal conditions (swap exhaustion, broken cache invariants)
// panic instead of returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    DiskFull,
    NotFound,
    AlreadyExists,
    NotADirectory,
    DirectoryNotEmpty,
    InUse,
    InvalidPath,
    FileTooLarge,
    InvalidArgument,
    InvalidUserAccess,
    PermissionViolation,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::DiskFull => "no free sectors left on the filesystem device",
            KernelError::NotFound => "no such file or directory",
            KernelError::AlreadyExists => "file exists",
            KernelError::NotADirectory => "not a directory",
            KernelError::DirectoryNotEmpty => "directory not empty",
            KernelError::InUse => "resource busy",
            KernelError::InvalidPath => "invalid path",
            KernelError::FileTooLarge => "file too large",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::InvalidUserAccess => "invalid user memory access",
            KernelError::PermissionViolation => "permission violation",
        };
        write!(f, "{}", msg)
    }
}

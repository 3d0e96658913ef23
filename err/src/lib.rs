#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] IoError),
    #[error("FS: {0}")]
    Fs(#[from] FsError),
    #[error("Corrupt: {0}")]
    Corrupt(#[from] CorruptError),
}

/// Device family: propagated unchanged from the flash driver, plus the
/// resource exhaustion conditions that end an operation.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    #[error("Device error")]
    Device,
    #[error("No space left on device")]
    NoSpace,
    #[error("No memory available")]
    NoMemory,
    #[error("No data on device, should format")]
    NoData,
}

/// Logical family: surfaced to the caller, the filesystem state is untouched.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("No id left")]
    NoId,
    #[error("Name too long")]
    NameTooLong,
    #[error("Too many open files or directories")]
    TooManyOpen,
    #[error("Parent directory does not exist")]
    NoFather,
    #[error("No such entry")]
    NoEntry,
    #[error("Entry already exists")]
    Exists,
    #[error("Not a directory")]
    NotDir,
    #[error("Is a directory")]
    IsDir,
    #[error("Directory not empty")]
    NotEmpty,
    #[error("Bad descriptor")]
    BadDescriptor,
    #[error("File too large")]
    FileTooBig,
    #[error("Invalid parameter")]
    Invalid,
    #[error("Directory is not open")]
    DirNotOpen,
    #[error("File is not open")]
    FileNotOpen,
}

/// Corruption family: an on-media invariant was violated, the operation
/// aborts.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptError {
    #[error("Corrupted data")]
    Data,
    #[error("Calculation mismatch")]
    Calculation,
    #[error("Configuration does not match media")]
    Config,
    #[error("Bad header")]
    Head,
    #[error("Bad program")]
    Program,
    #[error("Not in list")]
    NotInList,
    #[error("Directory hash mismatch")]
    DirHash,
    #[error("Cannot delete, still referenced")]
    CantDelete,
    #[error("Tree entry not found")]
    TreeEntry,
}

pub type Result<T> = core::result::Result<T, Error>;

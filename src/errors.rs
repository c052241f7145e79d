use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// How far an error should unwind. Ordered ascending; the pass loop
/// swallows `Message`, breaks the folder on `Folder`, and re-raises
/// anything above that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Message,
    Folder,
    FolderRetry,
    Repo,
    Critical,
}

#[derive(Error, Debug)]
pub enum SyncError {
    /// One message failed; the folder sync keeps going.
    #[error("message error: {0}")]
    Message(String),

    /// The folder cannot be synced further; the account keeps going.
    #[error("folder error: {0}")]
    Folder(String),

    /// The server's UID space was reset; manual recovery required.
    #[error("uidvalidity changed for {folder}: cached {cached}, server has {current}")]
    UidValidity {
        folder: String,
        cached: u32,
        current: u32,
    },

    /// Transport failure, worth retrying on a fresh connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Account-wide failure (auth, TLS setup, bad endpoint).
    #[error("account error: {0}")]
    Repo(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn severity(&self) -> Severity {
        match self {
            Self::Message(_) | Self::Unsupported(_) => Severity::Message,
            Self::Folder(_) | Self::UidValidity { .. } | Self::Io(_) => Severity::Folder,
            Self::Transport(_) => Severity::FolderRetry,
            Self::Repo(_) | Self::Config(_) => Severity::Repo,
        }
    }

    /// Classify an async-imap error: connection loss is retriable, any
    /// protocol-level response is not.
    pub fn from_imap(err: async_imap::error::Error) -> Self {
        match err {
            async_imap::error::Error::ConnectionLost => {
                Self::Transport("connection lost".into())
            }
            async_imap::error::Error::Io(e) => Self::Transport(e.to_string()),
            other => Self::Folder(other.to_string()),
        }
    }
}

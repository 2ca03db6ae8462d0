use thiserror::Error;

pub type Result<T> = std::result::Result<T, StrataError>;

#[derive(Debug, Error)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("blob {0} is protected by retention and cannot be deleted")]
    BlobProtected(String),

    #[error("invalid blob id: '{0}'")]
    InvalidBlobId(String),

    #[error("invalid content id: '{0}'")]
    InvalidContentId(String),

    #[error("content not found: {0}")]
    ContentNotFound(String),

    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("invalid repository format: {0}")]
    InvalidFormat(String),

    #[error("index blob decode error: {0}")]
    IndexDecode(String),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("unknown object type tag: {0}")]
    UnknownObjectType(u8),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("epoch manager is not active for this repository")]
    EpochManagerNotActive,

    #[error("no changes requested")]
    NoChanges,

    #[error("index format cannot be downgraded from v{from} to v{to}")]
    IndexVersionDowngrade { from: u8, to: u8 },

    #[error("an upgrade lock is already held by '{0}'")]
    UpgradeLockAlreadyHeld(String),

    #[error("no upgrade lock is held")]
    UpgradeLockNotHeld,

    #[error("repository upgrade in progress: {0}")]
    UpgradeInProgress(String),

    #[error("index validation found {0} mismatch(es), repository stays locked")]
    IndexValidationFailed(usize),

    #[error("refusing unsafe operation: {0}")]
    DangerousOperation(String),

    #[error("repository requires unsupported feature '{0}'")]
    UnsupportedFeature(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StrataError>,
    },

    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// Wrap this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        StrataError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error beneath any `Context` wrappers.
    pub fn root(&self) -> &StrataError {
        let mut err = self;
        while let StrataError::Context { source, .. } = err {
            err = source;
        }
        err
    }
}

/// Attach operation context to the error side of a `Result`.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}

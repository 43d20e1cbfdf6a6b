use std::fmt;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Log sequence number. Strictly monotonic, 64-bit; `NO_LSN` (-1) means
/// "no LSN" (fresh page, first record of a transaction).
pub type Lsn = i64;

/// Sentinel for an absent LSN.
pub const NO_LSN: Lsn = -1;

/// Logical page identifier. Signed so that -1 can mark an invalid page
/// (empty tree root, reset page buffer, control log records).
pub type PageId = i32;

/// Sentinel for an absent page.
pub const INVALID_PAGE_ID: PageId = -1;

/// Transaction identifier, allocated monotonically per engine instance.
pub type TxnId = u32;

/// Pseudo-transaction that owns pre-existing state. Versions created by it
/// are committed before every real transaction.
pub const BOOTSTRAP_TXN: TxnId = 0;

// ---------------------------------------------------------------------------
// Page geometry
// ---------------------------------------------------------------------------

/// Fixed page size. The on-disk file is a sequence of images this large.
pub const PAGE_SIZE: usize = 4096;

/// Bytes of typed page header: page id (i32), kind (u8), page LSN (i64),
/// 3 reserved bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Bytes available to node payloads after the page header.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Component tag carried by errors so callers can see where a failure
/// originated without parsing the message.
pub type Component = &'static str;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database handle is closed")]
    Closed,

    #[error("I/O failure in {component}: {source}")]
    Io {
        component: Component,
        #[source]
        source: std::io::Error,
    },

    #[error("corruption in {component}: {detail}")]
    Corrupted { component: Component, detail: String },

    #[error("fatal engine failure: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn io(component: Component, source: std::io::Error) -> Self {
        Self::Io { component, source }
    }

    pub fn corrupted(component: Component, detail: impl Into<String>) -> Self {
        Self::Corrupted {
            component,
            detail: detail.into(),
        }
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::InvalidArgument(detail.into())
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        Self::Fatal(detail.into())
    }

    /// True for errors that poison the handle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Small display helpers shared by logging call sites
// ---------------------------------------------------------------------------

/// Wrapper rendering an optional LSN as a number or "-".
pub struct DisplayLsn(pub Lsn);

impl fmt::Display for DisplayLsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == NO_LSN {
            write!(f, "-")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

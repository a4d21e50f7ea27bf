use pilcrow_primitives::decimal::DecimalOutOfRange;
use pilcrow_primitives::time::{InvalidTimeQuantum, InvalidTimeUnit, TimeOutOfRange};
use pilcrow_primitives::InvalidShardWidth;
use thiserror::Error;

/// The classified kind surfaced in the result envelope. Every error the
/// executor returns maps onto exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    PreconditionFailed,
    OutOfRange,
    Conflict,
    ResourceExhausted,
    Unavailable,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

/// Schema lookups and definitions.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("index `{0}` not found")]
    IndexNotFound(String),
    #[error("index `{0}` already exists")]
    IndexExists(String),
    #[error("field `{0}.{1}` not found")]
    FieldNotFound(String, String),
    #[error("field `{0}.{1}` already exists")]
    FieldExists(String, String),
    #[error("field `{0}.{1}` has no min/max bounds")]
    NoBounds(String, String),
    #[error(transparent)]
    ShardWidth(#[from] InvalidShardWidth),
    #[error(transparent)]
    TimeQuantum(#[from] InvalidTimeQuantum),
    #[error(transparent)]
    TimeUnit(#[from] InvalidTimeUnit),
}

/// Call-tree validation: unknown operators, arity and argument shape.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CallError {
    #[error("unknown call `{0}`")]
    Unknown(String),
    #[error("`{call}` argument `{arg}`: {detail}")]
    BadArg { call: &'static str, arg: &'static str, detail: String },
    #[error("`{call}` requires at least one operand")]
    EmptyOperands { call: &'static str },
    #[error("string row key on unkeyed field `{0}`")]
    KeyOnUnkeyedField(String),
    #[error("string column key on unkeyed index `{0}`")]
    KeyOnUnkeyedIndex(String),
    #[error("`Rows` is not supported on integer-typed field `{0}`")]
    RowsOnIntField(String),
    #[error("`{call}` argument `{arg}` conflicts with `{other}`")]
    ConflictingArgs { call: &'static str, arg: &'static str, other: &'static str },
}

/// Key/ID translation.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TranslateError {
    #[error("cannot allocate key `{key}` in a read-only query")]
    ReadOnlyAllocation { key: String },
}

/// Transport failures from the internal RPC client. The router retries the
/// retriable ones on the next replica until the per-shard budget runs out.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("node `{node}` unavailable: {detail}")]
    Unavailable { node: String, detail: String },
    #[error("connection to `{node}` reset")]
    ConnectionReset { node: String },
    #[error("request to `{node}` timed out before acknowledgement")]
    Timeout { node: String },
    #[error("node `{node}` rejected the request: {source}")]
    Remote {
        node: String,
        #[source]
        source: Box<ExecError>,
    },
}

impl RpcError {
    /// Whether the router may retry this failure on another replica.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RpcError::Unavailable { .. } | RpcError::ConnectionReset { .. } | RpcError::Timeout { .. }
        )
    }
}

/// The executor's top-level error.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("existence tracking required on index `{0}` for this operation")]
    ExistenceRequired(String),
    #[error("`ClearRow` is not supported on integer-typed field `{0}`")]
    ClearRowOnBsi(String),
    #[error("`TopN` requires a ranked cache on field `{0}`")]
    CacheNone(String),
    #[error("no external store configured for `ExternalLookup`")]
    ExternalStoreNotConfigured,

    #[error("value {value} outside field `{field}` bounds [{min}, {max}]")]
    ValueOutOfRange { field: String, value: i64, min: i64, max: i64 },
    #[error("decimal out of range on field `{field}`")]
    DecimalOutOfRange { field: String },
    #[error("timestamp outside the representable window for field `{field}`")]
    TimestampOutOfRange { field: String },
    #[error("aggregate overflow on field `{field}`")]
    AggregateOutOfRange { field: String },

    #[error("query exceeded the {limit}-byte memory budget")]
    MemoryExhausted { limit: u64 },
    #[error("request exceeded the {limit}-write budget")]
    TooManyWrites { limit: u64 },

    #[error("query cancelled")]
    Cancelled,
    #[error("query deadline exceeded")]
    DeadlineExceeded,

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Schema(SchemaError::IndexNotFound(_) | SchemaError::FieldNotFound(..)) => ErrorKind::NotFound,
            ExecError::Schema(SchemaError::IndexExists(_) | SchemaError::FieldExists(..)) => ErrorKind::Conflict,
            ExecError::Schema(SchemaError::ShardWidth(_)) => ErrorKind::PreconditionFailed,
            ExecError::Schema(_) => ErrorKind::InvalidArgument,
            ExecError::Call(_) | ExecError::Translate(_) => ErrorKind::InvalidArgument,
            ExecError::Rpc(RpcError::Remote { source, .. }) => source.kind(),
            ExecError::Rpc(_) => ErrorKind::Unavailable,
            ExecError::ExistenceRequired(_)
            | ExecError::ClearRowOnBsi(_)
            | ExecError::CacheNone(_)
            | ExecError::ExternalStoreNotConfigured => ErrorKind::PreconditionFailed,
            ExecError::ValueOutOfRange { .. }
            | ExecError::DecimalOutOfRange { .. }
            | ExecError::TimestampOutOfRange { .. }
            | ExecError::AggregateOutOfRange { .. } => ErrorKind::OutOfRange,
            ExecError::MemoryExhausted { .. } | ExecError::TooManyWrites { .. } => ErrorKind::ResourceExhausted,
            ExecError::Cancelled => ErrorKind::Cancelled,
            ExecError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            ExecError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Cancellation is not recorded as a query failure by reducers; every
    /// other kind is.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecError::Cancelled | ExecError::DeadlineExceeded)
    }
}

impl From<DecimalOutOfRange> for ExecError {
    fn from(_: DecimalOutOfRange) -> Self {
        ExecError::DecimalOutOfRange { field: String::new() }
    }
}

impl From<TimeOutOfRange> for ExecError {
    fn from(_: TimeOutOfRange) -> Self {
        ExecError::TimestampOutOfRange { field: String::new() }
    }
}

pub type Result<T, E = ExecError> = std::result::Result<T, E>;

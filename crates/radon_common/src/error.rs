use thiserror::Error;

/// Convenience alias for `Result<T, RadonError>`.
pub type RadonResult<T> = Result<T, RadonError>;

/// MySQL error numbers surfaced to clients.
pub mod codes {
    pub const ER_CON_COUNT_ERROR: u16 = 1040;
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_BAD_DB_ERROR: u16 = 1049;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
    pub const ER_NO_SUCH_TABLE: u16 = 1146;
    pub const ER_SYNTAX_ERROR: u16 = 1149;
    pub const ER_SPECIFIC_ACCESS_DENIED_ERROR: u16 = 1227;
    pub const ER_OPTION_PREVENTS_STATEMENT: u16 = 1290;
    pub const ER_QUERY_INTERRUPTED: u16 = 1317;
    pub const ER_XAER_NOTA: u16 = 1397;
    pub const ER_DB_CREATE_EXISTS: u16 = 1007;
    pub const ER_DB_DROP_EXISTS: u16 = 1008;
    pub const ER_TABLE_EXISTS_ERROR: u16 = 1050;
    pub const ER_BAD_TABLE_ERROR: u16 = 1051;
    pub const ER_NO_SUCH_THREAD: u16 = 1094;
    pub const ER_WRONG_VALUE_FOR_VAR: u16 = 1231;
}

/// Error classification used by the front desk to decide how loudly to log.
///
/// - `UserError`  : bad SQL, unknown schema, denied statement
/// - `Backend`    : a shard rejected the statement; passed through verbatim
/// - `Transient`  : timeout, kill, disk pressure; the client may retry
/// - `InternalBug`: invariant violation inside the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Backend,
    Transient,
    InternalBug,
}

/// Every failure the proxy can surface to a client.
#[derive(Error, Debug)]
pub enum RadonError {
    #[error("{0}")]
    Parse(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Too many connections")]
    TooManyConnections,

    #[error("Access denied; you need (at least one of) the {0} privilege(s) for this operation")]
    SpecificAccessDenied(String),

    #[error("Unknown database '{0}'")]
    SchemaMissing(String),

    #[error("Table '{0}' doesn't exist")]
    TableMissing(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("no space left on device")]
    DiskFull,

    #[error("The MySQL server is running with the --read-only option so it cannot execute this statement")]
    ReadOnly,

    /// A shard error, passed through with its original code.
    #[error("{message} (errno {code}) (sqlstate {state})")]
    Backend {
        code: u16,
        state: String,
        message: String,
    },

    #[error("Transaction aborted: {0}")]
    TxnAbort(String),

    #[error("Query execution was interrupted, timeout[{0}ms] exceeded")]
    Timeout(u64),

    /// A per-statement resource cap (result bytes, join rows) was exceeded.
    #[error("Query execution was interrupted, {0}")]
    Interrupted(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RadonError {
    pub fn backend(code: u16, state: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            code,
            state: state.into(),
            message: message.into(),
        }
    }

    /// Classify this error for logging and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_)
            | Self::AccessDenied(_)
            | Self::SpecificAccessDenied(_)
            | Self::SchemaMissing(_)
            | Self::TableMissing(_)
            | Self::Unsupported(_)
            | Self::ReadOnly => ErrorKind::UserError,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::TooManyConnections
            | Self::DiskFull
            | Self::TxnAbort(_)
            | Self::Timeout(_)
            | Self::Interrupted(_)
            | Self::Io(_) => ErrorKind::Transient,
            Self::Internal(_) | Self::Config(_) | Self::Serde(_) => ErrorKind::InternalBug,
        }
    }

    /// The MySQL error number reported to the client.
    pub fn mysql_code(&self) -> u16 {
        match self {
            Self::Parse(_) => codes::ER_SYNTAX_ERROR,
            Self::AccessDenied(_) => codes::ER_ACCESS_DENIED_ERROR,
            Self::TooManyConnections => codes::ER_CON_COUNT_ERROR,
            Self::SpecificAccessDenied(_) => codes::ER_SPECIFIC_ACCESS_DENIED_ERROR,
            Self::SchemaMissing(_) => codes::ER_BAD_DB_ERROR,
            Self::TableMissing(_) => codes::ER_NO_SUCH_TABLE,
            Self::ReadOnly => codes::ER_OPTION_PREVENTS_STATEMENT,
            Self::Backend { code, .. } => *code,
            Self::TxnAbort(_) | Self::Timeout(_) | Self::Interrupted(_) => {
                codes::ER_QUERY_INTERRUPTED
            }
            _ => codes::ER_UNKNOWN_ERROR,
        }
    }

    /// Five-character SQLSTATE reported alongside [`Self::mysql_code`].
    pub fn sql_state(&self) -> &str {
        match self {
            Self::Parse(_) => "42000",
            Self::AccessDenied(_) => "28000",
            Self::TooManyConnections => "08004",
            Self::SpecificAccessDenied(_) => "42000",
            Self::SchemaMissing(_) => "42000",
            Self::TableMissing(_) => "42S02",
            Self::ReadOnly => "HY000",
            Self::Backend { state, .. } => state.as_str(),
            Self::TxnAbort(_) | Self::Timeout(_) | Self::Interrupted(_) => "70100",
            _ => "HY000",
        }
    }

    /// The branch was already forgotten by the shard (XA ROLLBACK after completion).
    pub fn is_xaer_nota(&self) -> bool {
        matches!(self, Self::Backend { code, .. } if *code == codes::ER_XAER_NOTA)
    }

    /// The shard reported a backend error with this code.
    pub fn is_backend_code(&self, want: u16) -> bool {
        matches!(self, Self::Backend { code, .. } if *code == want)
    }
}

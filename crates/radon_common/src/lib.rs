//! Shared building blocks for the Radon proxy: the value model (`Datum`,
//! `Field`, `QueryResult`), the error type, configuration records and the
//! shutdown signal used by background loops.

pub mod config;
pub mod datum;
pub mod error;
pub mod request;
pub mod result;
pub mod shutdown;

pub use datum::Datum;
pub use error::{ErrorKind, RadonError, RadonResult};
pub use request::{QueryTuple, ReqMode, RequestContext, TxnMode};
pub use result::{Field, FieldType, QueryResult, Row};

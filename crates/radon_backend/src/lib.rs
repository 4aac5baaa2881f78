//! Backend side of the proxy.
//!
//! - [`Scatter`] is the registry of backend shards and the factory of
//!   [`Transaction`]s.
//! - [`Transaction`] fans physical fragments out to backends in parallel and
//!   coordinates XA two-phase commit.
//! - [`pool::Pool`] keeps a bounded set of connections per backend.
//! - [`fakedb::FakeDb`] is a scriptable in-memory backend used by tests.

pub mod connection;
pub mod fakedb;
#[cfg(feature = "mysql")]
pub mod mysql_conn;
pub mod pool;
pub mod scatter;
pub mod stats;
pub mod txn;
pub mod xa;

pub use connection::{Connection, Connector};
pub use scatter::{Backend, Scatter};
pub use stats::{QueryRates, TxnCounters, TxnCountersSnapshot};
pub use txn::{Transaction, TxnState};
pub use xa::{XaAction, XaRecovery, XaSweeperHandle};

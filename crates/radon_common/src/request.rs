//! Envelope carried from the planner down to the transaction layer.

use serde::Serialize;

/// One physical fragment: SQL bound to the backend that must run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryTuple {
    pub query: String,
    pub backend: String,
    /// Slot or list range of the physical table, for EXPLAIN.
    pub range: String,
}

impl QueryTuple {
    pub fn new(query: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            backend: backend.into(),
            range: String::new(),
        }
    }
}

/// How the fragments of a request are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReqMode {
    /// Run each `QueryTuple` on its own backend.
    Normal,
    /// Run `raw_query` on every backend.
    ScatterRequest,
    /// Run `raw_query` on one backend chosen deterministically.
    SingleRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxnMode {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub mode: ReqMode,
    pub txn_mode: TxnMode,
    pub querys: Vec<QueryTuple>,
    pub raw_query: String,
}

impl RequestContext {
    pub fn new(txn_mode: TxnMode, querys: Vec<QueryTuple>) -> Self {
        Self {
            mode: ReqMode::Normal,
            txn_mode,
            querys,
            raw_query: String::new(),
        }
    }

    pub fn raw(mode: ReqMode, txn_mode: TxnMode, raw_query: impl Into<String>) -> Self {
        Self {
            mode,
            txn_mode,
            querys: Vec::new(),
            raw_query: raw_query.into(),
        }
    }

    /// Distinct backends this request touches, sorted.
    pub fn backends(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.querys.iter().map(|q| q.backend.as_str()).collect();
        v.sort_unstable();
        v.dedup();
        v
    }
}

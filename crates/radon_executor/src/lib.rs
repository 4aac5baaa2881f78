//! Runtime twin of the planner's plan trees.
//!
//! [`Tree`] runs the plans of one client statement in order against a
//! [`Transaction`]. Select and union plans are walked by [`engine`]: merge
//! leaves dispatch their fragments, join and union nodes combine their
//! children, and every node finishes with its sub-plans in the order
//! Aggregate, OrderBy, Limit.

pub mod engine;
pub mod join;
pub mod merge;
pub mod operator;
pub mod tree;
pub mod union;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use radon_backend::Transaction;

pub use tree::Tree;

/// Everything an engine needs besides the plan.
#[derive(Clone)]
pub struct ExecContext {
    pub txn: Arc<Transaction>,
    /// Workers for the cartesian step of a merge join.
    pub join_workers: usize,
}

impl ExecContext {
    pub fn new(txn: Arc<Transaction>) -> Self {
        Self { txn, join_workers: 4 }
    }

    pub fn with_join_workers(mut self, workers: usize) -> Self {
        self.join_workers = workers.max(1);
        self
    }

    pub fn max_join_rows(&self) -> usize {
        self.txn.max_join_rows()
    }
}

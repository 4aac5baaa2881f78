//! `XA` admin statements over the recovery sweeper.

use radon_common::{QueryResult, RadonError, RadonResult};

use crate::spanner::Spanner;

impl Spanner {
    /// `XA RECOVER` lists prepared branches of one backend; `XA COMMIT` and
    /// `XA ROLLBACK` without an xid resolve every branch older than the
    /// recovery horizon and report how many xids were touched.
    pub(crate) fn handle_xa(&self, sql: &str) -> RadonResult<QueryResult> {
        let words: Vec<String> = sql.split_whitespace().map(str::to_ascii_lowercase).collect();
        match words.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["xa", "recover", ..] => self.xa.recover(),
            ["xa", "commit"] => {
                let n = self.xa.commit()?;
                tracing::info!(xids = n, "xa commit sweep by admin");
                Ok(QueryResult::affected(n as u64))
            }
            ["xa", "rollback"] => {
                let n = self.xa.rollback()?;
                tracing::info!(xids = n, "xa rollback sweep by admin");
                Ok(QueryResult::affected(n as u64))
            }
            _ => Err(RadonError::Unsupported(format!("unsupported: {sql}"))),
        }
    }
}

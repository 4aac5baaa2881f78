use radon_common::config::BackendConfig;
use radon_common::result::datum_size;
use radon_common::{QueryResult, RadonResult};

/// One authenticated session to a backend shard.
pub trait Connection: Send {
    /// Server-side connection id, the target of `KILL`.
    fn id(&self) -> u32;

    fn execute(&mut self, sql: &str) -> RadonResult<QueryResult>;

    /// Deliver the result in chunks of roughly `chunk_bytes`.
    ///
    /// The first chunk always carries the field list, even when no row
    /// follows. `on_chunk` failing stops the read.
    fn execute_stream(
        &mut self,
        sql: &str,
        chunk_bytes: usize,
        on_chunk: &mut dyn FnMut(QueryResult) -> RadonResult<()>,
    ) -> RadonResult<()> {
        let result = self.execute(sql)?;
        for chunk in chunk_by_bytes(result, chunk_bytes) {
            on_chunk(chunk)?;
        }
        Ok(())
    }

    fn ping(&mut self) -> RadonResult<()>;

    /// The session is unusable and must not return to the idle list.
    fn is_broken(&self) -> bool;
}

/// Opens connections to backends.
pub trait Connector: Send + Sync {
    fn connect(&self, backend: &BackendConfig, address: &str) -> RadonResult<Box<dyn Connection>>;

    /// Terminate the backend session `conn_id` from a side connection.
    fn kill(&self, backend: &BackendConfig, address: &str, conn_id: u32) -> RadonResult<()> {
        let mut conn = self.connect(backend, address)?;
        conn.execute(&format!("KILL {conn_id}")).map(|_| ())
    }
}

/// Split a result into chunks of at least one row and roughly `chunk_bytes`.
/// Only the first chunk carries affected rows and insert id.
pub fn chunk_by_bytes(result: QueryResult, chunk_bytes: usize) -> Vec<QueryResult> {
    let QueryResult {
        fields,
        rows,
        rows_affected,
        insert_id,
        warnings,
    } = result;
    let mut chunks = Vec::new();
    let mut current = QueryResult {
        fields: fields.clone(),
        rows_affected,
        insert_id,
        warnings,
        ..Default::default()
    };
    let mut size = 0usize;
    for row in rows {
        size += row.iter().map(datum_size).sum::<usize>();
        current.rows.push(row);
        if size >= chunk_bytes.max(1) {
            let next = QueryResult::new(fields.clone(), Vec::new());
            chunks.push(std::mem::replace(&mut current, next));
            size = 0;
        }
    }
    if !current.rows.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use radon_common::{Datum, Field, FieldType};

    #[test]
    fn test_chunking_keeps_every_row_once() {
        let rows: Vec<_> = (0..10).map(|i| vec![Datum::Int64(i)]).collect();
        let result = QueryResult::new(vec![Field::new("a", FieldType::LongLong)], rows.clone());
        let chunks = chunk_by_bytes(result, 24);
        assert_eq!(chunks.len(), 4);
        let joined: Vec<_> = chunks.iter().flat_map(|c| c.rows.clone()).collect();
        assert_eq!(joined, rows);
        assert!(chunks.iter().all(|c| c.fields.len() == 1));
    }

    #[test]
    fn test_empty_result_still_yields_fields() {
        let result = QueryResult::new(vec![Field::new("a", FieldType::LongLong)], vec![]);
        let chunks = chunk_by_bytes(result, 1024);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].rows.is_empty());
        assert_eq!(chunks[0].fields.len(), 1);
    }
}

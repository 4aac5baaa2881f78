//! Backend connections over the MySQL text protocol, via the `mysql` client.

use mysql::consts::{ColumnFlags, ColumnType};
use mysql::prelude::Queryable;
use mysql::{Column, Conn, OptsBuilder, Value};
use radon_common::config::BackendConfig;
use radon_common::{Datum, Field, FieldType, QueryResult, RadonError, RadonResult, Row};

use crate::connection::{Connection, Connector};

const CR_SERVER_LOST: u16 = 2013;

#[derive(Debug, Default, Clone, Copy)]
pub struct MysqlConnector;

fn split_address(address: &str) -> RadonResult<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| RadonError::Config(format!("backend address[{address}] must be host:port")))?;
    let port = port
        .parse()
        .map_err(|_| RadonError::Config(format!("backend address[{address}] has a bad port")))?;
    Ok((host.to_string(), port))
}

fn map_err(e: mysql::Error, broken: &mut bool) -> RadonError {
    match e {
        mysql::Error::MySqlError(me) => RadonError::backend(me.code, me.state, me.message),
        other => {
            *broken = true;
            RadonError::backend(CR_SERVER_LOST, "HY000", other.to_string())
        }
    }
}

impl Connector for MysqlConnector {
    fn connect(&self, backend: &BackendConfig, address: &str) -> RadonResult<Box<dyn Connection>> {
        let (host, port) = split_address(address)?;
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(host))
            .tcp_port(port)
            .user(Some(backend.user.clone()))
            .pass(Some(backend.password.clone()))
            .db_name((!backend.database.is_empty()).then(|| backend.database.clone()));
        let mut broken = false;
        let mut conn = Conn::new(opts).map_err(|e| map_err(e, &mut broken))?;
        if !backend.charset.is_empty() {
            conn.query_drop(format!("SET NAMES {}", backend.charset))
                .map_err(|e| map_err(e, &mut broken))?;
        }
        let id = conn.connection_id();
        tracing::debug!(backend = %backend.name, address, conn_id = id, "backend connection opened");
        Ok(Box::new(MysqlConn { conn, id, broken }))
    }
}

pub struct MysqlConn {
    conn: Conn,
    id: u32,
    broken: bool,
}

fn field_type(t: ColumnType) -> FieldType {
    use ColumnType::*;
    match t {
        MYSQL_TYPE_TINY => FieldType::Tiny,
        MYSQL_TYPE_SHORT => FieldType::Short,
        MYSQL_TYPE_INT24 => FieldType::Int24,
        MYSQL_TYPE_LONG => FieldType::Long,
        MYSQL_TYPE_LONGLONG => FieldType::LongLong,
        MYSQL_TYPE_FLOAT => FieldType::Float,
        MYSQL_TYPE_DOUBLE => FieldType::Double,
        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => FieldType::NewDecimal,
        MYSQL_TYPE_YEAR => FieldType::Year,
        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => FieldType::Date,
        MYSQL_TYPE_TIME | MYSQL_TYPE_TIME2 => FieldType::Time,
        MYSQL_TYPE_DATETIME | MYSQL_TYPE_DATETIME2 => FieldType::Datetime,
        MYSQL_TYPE_TIMESTAMP | MYSQL_TYPE_TIMESTAMP2 => FieldType::Timestamp,
        MYSQL_TYPE_VARCHAR => FieldType::Varchar,
        MYSQL_TYPE_VAR_STRING => FieldType::VarString,
        MYSQL_TYPE_STRING => FieldType::String,
        MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB | MYSQL_TYPE_BLOB => FieldType::Blob,
        MYSQL_TYPE_JSON => FieldType::Json,
        MYSQL_TYPE_BIT => FieldType::Bit,
        MYSQL_TYPE_ENUM => FieldType::Enum,
        MYSQL_TYPE_SET => FieldType::Set,
        _ => FieldType::Null,
    }
}

fn to_field(c: &Column) -> Field {
    Field {
        name: c.name_str().into_owned(),
        table: c.table_str().into_owned(),
        org_table: c.org_table_str().into_owned(),
        database: c.schema_str().into_owned(),
        field_type: field_type(c.column_type()),
        decimals: c.decimals(),
        unsigned: c.flags().contains(ColumnFlags::UNSIGNED_FLAG),
    }
}

fn to_datum(v: &Value, f: &Field) -> Datum {
    match v {
        Value::NULL => Datum::Null,
        Value::Bytes(b) => Datum::from_mysql_text(Some(b), f.field_type, f.unsigned),
        Value::Int(i) => Datum::Int64(*i),
        Value::UInt(u) => Datum::UInt64(*u),
        Value::Float(x) => Datum::Float64(f64::from(*x)),
        Value::Double(x) => Datum::Float64(*x),
        other => Datum::Text(other.as_sql(true).trim_matches('\'').to_string()),
    }
}

fn to_row(row: &mysql::Row, fields: &[Field]) -> Row {
    fields
        .iter()
        .enumerate()
        .map(|(i, f)| row.as_ref(i).map_or(Datum::Null, |v| to_datum(v, f)))
        .collect()
}

impl MysqlConn {
    fn run(
        &mut self,
        sql: &str,
        chunk_bytes: Option<usize>,
        on_chunk: &mut dyn FnMut(QueryResult) -> RadonResult<()>,
    ) -> RadonResult<()> {
        let broken = &mut self.broken;
        let mut result = self.conn.query_iter(sql).map_err(|e| map_err(e, broken))?;
        let fields: Vec<Field> = result.columns().as_ref().iter().map(to_field).collect();
        let mut current = QueryResult::new(fields.clone(), Vec::new());
        let mut size = 0usize;
        let mut delivered = false;
        for row in result.by_ref() {
            let row = row.map_err(|e| map_err(e, broken))?;
            let row = to_row(&row, &fields);
            size += row.iter().map(radon_common::result::datum_size).sum::<usize>();
            current.rows.push(row);
            if let Some(limit) = chunk_bytes {
                if size >= limit.max(1) {
                    on_chunk(std::mem::replace(&mut current, QueryResult::new(fields.clone(), Vec::new())))?;
                    delivered = true;
                    size = 0;
                }
            }
        }
        current.rows_affected = result.affected_rows();
        current.insert_id = result.last_insert_id().unwrap_or(0);
        current.warnings = result.warnings();
        if !delivered || !current.rows.is_empty() {
            on_chunk(current)?;
        }
        Ok(())
    }
}

impl Connection for MysqlConn {
    fn id(&self) -> u32 {
        self.id
    }

    fn execute(&mut self, sql: &str) -> RadonResult<QueryResult> {
        let mut out = QueryResult::default();
        self.run(sql, None, &mut |r| {
            out = r;
            Ok(())
        })?;
        Ok(out)
    }

    fn execute_stream(
        &mut self,
        sql: &str,
        chunk_bytes: usize,
        on_chunk: &mut dyn FnMut(QueryResult) -> RadonResult<()>,
    ) -> RadonResult<()> {
        self.run(sql, Some(chunk_bytes), on_chunk)
    }

    fn ping(&mut self) -> RadonResult<()> {
        let broken = &mut self.broken;
        self.conn.ping().map_err(|e| map_err(e, broken))
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("127.0.0.1:3306").unwrap(), ("127.0.0.1".to_string(), 3306));
        assert!(split_address("nohost").is_err());
        assert!(split_address("h:port").is_err());
    }
}

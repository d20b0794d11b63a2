//! SQL rendering and parameter binding for the SQLite-backed engine.
//!
//! Identifiers are always quoted; values are always bound as parameters,
//! except column defaults, which SQLite requires as literals in DDL.

use super::schema::{ColumnDef, IndexDef, KeyStrategy, TableSchema};
use super::statement::{Filter, Select, SortOrder};
use crate::error::{StoreError, StoreResult};
use crate::value::{Cell, ColumnType};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(Value::Null),
            Cell::Integer(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            Cell::Real(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Cell::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
        })
    }
}

impl FromSql for Cell {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Cell::Null),
            ValueRef::Integer(value) => Ok(Cell::Integer(value)),
            ValueRef::Real(value) => Ok(Cell::Real(value)),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map(|text| Cell::Text(text.to_string()))
                .map_err(|err| FromSqlError::Other(Box::new(err))),
            ValueRef::Blob(_) => Err(FromSqlError::InvalidType),
        }
    }
}

/// Quote an identifier
pub(crate) fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Declared STRICT type for a column type
fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Integer | ColumnType::Boolean => "INTEGER",
        ColumnType::Real => "REAL",
        ColumnType::Text | ColumnType::Timestamp | ColumnType::Json => "TEXT",
    }
}

fn literal(cell: &Cell) -> StoreResult<String> {
    match cell {
        Cell::Null => Ok("NULL".to_string()),
        Cell::Integer(value) => Ok(value.to_string()),
        Cell::Real(value) if value.is_finite() => Ok(format!("{value:?}")),
        Cell::Real(value) => Err(StoreError::InvalidStatement(format!(
            "default {value} is not a finite number"
        ))),
        Cell::Text(value) => Ok(format!("'{}'", value.replace('\'', "''"))),
    }
}

pub(crate) fn column_definition(column: &ColumnDef) -> StoreResult<String> {
    let name = ident(&column.name);
    let mut sql = format!("{name} {}", sql_type(column.column_type));
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&literal(default)?);
    }
    if column.column_type == ColumnType::Boolean {
        sql.push_str(&format!(" CHECK ({name} IN (0, 1))"));
    }
    Ok(sql)
}

pub(crate) fn create_table(schema: &TableSchema) -> StoreResult<String> {
    let mut columns = Vec::with_capacity(schema.columns.len());
    for column in &schema.columns {
        if column.name != schema.primary_key {
            columns.push(column_definition(column)?);
            continue;
        }
        let key = match schema.key_strategy {
            KeyStrategy::AutoIncrement => {
                format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", ident(&column.name))
            }
            KeyStrategy::Provided => format!("{} PRIMARY KEY", column_definition(column)?),
        };
        columns.push(key);
    }
    Ok(format!(
        "CREATE TABLE {} ({}) STRICT",
        ident(&schema.name),
        columns.join(", ")
    ))
}

pub(crate) fn create_index(index: &IndexDef) -> String {
    let columns: Vec<String> = index.columns.iter().map(|column| ident(column)).collect();
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        ident(&index.name),
        ident(&index.table),
        columns.join(", ")
    )
}

/// `WHERE` clause for `filter`, pushing its bound values onto `params`
pub(crate) fn where_clause<'a>(filter: &'a Filter, params: &mut Vec<&'a Cell>) -> String {
    if filter.is_empty() {
        return String::new();
    }
    let conditions: Vec<String> = filter
        .conditions
        .iter()
        .map(|(column, cell)| {
            if cell.is_null() {
                format!("{} IS NULL", ident(column))
            } else {
                params.push(cell);
                format!("{} = ?", ident(column))
            }
        })
        .collect();
    format!(" WHERE {}", conditions.join(" AND "))
}

/// Full `SELECT` over every schema column, ties broken by primary key
pub(crate) fn select<'a>(
    schema: &TableSchema,
    select: &'a Select,
    params: &mut Vec<&'a Cell>,
) -> String {
    let columns: Vec<String> = schema.column_names().map(ident).collect();
    let mut sql = format!(
        "SELECT {} FROM {}{}",
        columns.join(", "),
        ident(&schema.name),
        where_clause(&select.filter, params)
    );

    let mut order: Vec<String> = select
        .order_by
        .iter()
        .map(|(column, direction)| {
            let direction = match direction {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            format!("{} {direction}", ident(column))
        })
        .collect();
    order.push(format!("{} ASC", ident(&schema.primary_key)));
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));

    let limit = select
        .limit
        .and_then(|limit| i64::try_from(limit).ok())
        .unwrap_or(-1);
    let offset = i64::try_from(select.offset).unwrap_or(i64::MAX);
    sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
    sql
}

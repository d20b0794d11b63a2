//! Typed statements accepted by the engine. Values are carried as cells and
//! never rendered into statement text.

use super::schema::{ColumnDef, IndexDef, TableSchema};
use crate::value::Cell;
use std::collections::BTreeMap;

/// Column values keyed by column name
pub type Values = BTreeMap<String, Cell>;

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        schema: TableSchema,
        if_not_exists: bool,
    },
    DropTable {
        name: String,
        if_exists: bool,
    },
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    CreateIndex {
        index: IndexDef,
        if_not_exists: bool,
    },
    Insert {
        table: String,
        values: Values,
    },
    Update {
        table: String,
        set: Values,
        filter: Filter,
    },
    Delete {
        table: String,
        filter: Filter,
    },
    Begin,
    Commit,
    Rollback,
}

impl Statement {
    pub fn create_table(schema: TableSchema) -> Self {
        Statement::CreateTable {
            schema,
            if_not_exists: false,
        }
    }

    pub fn create_index(index: IndexDef) -> Self {
        Statement::CreateIndex {
            index,
            if_not_exists: false,
        }
    }

    pub fn insert(table: impl Into<String>, values: Values) -> Self {
        Statement::Insert {
            table: table.into(),
            values,
        }
    }

    pub fn update(table: impl Into<String>, set: Values, filter: Filter) -> Self {
        Statement::Update {
            table: table.into(),
            set,
            filter,
        }
    }

    pub fn delete(table: impl Into<String>, filter: Filter) -> Self {
        Statement::Delete {
            table: table.into(),
            filter,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Statement::CreateTable { .. } => "CREATE TABLE",
            Statement::DropTable { .. } => "DROP TABLE",
            Statement::AddColumn { .. } => "ALTER TABLE ADD COLUMN",
            Statement::CreateIndex { .. } => "CREATE INDEX",
            Statement::Insert { .. } => "INSERT",
            Statement::Update { .. } => "UPDATE",
            Statement::Delete { .. } => "DELETE",
            Statement::Begin => "BEGIN",
            Statement::Commit => "COMMIT",
            Statement::Rollback => "ROLLBACK",
        }
    }
}

/// Conjunction of equality conditions. An empty filter matches every row;
/// a `Null` operand matches rows where the column is null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<(String, Cell)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Cell>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    pub filter: Filter,
    pub order_by: Vec<(String, SortOrder)>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Select {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Filter::all(),
            order_by: Vec::new(),
            limit: None,
            offset: 0,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Cell>) -> Self {
        self.filter = self.filter.eq(column, value);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, order: SortOrder) -> Self {
        self.order_by.push((column.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

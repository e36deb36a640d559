//! Table column metadata discovered by a describe query

use serde::{Deserialize, Serialize};

/// One column as reported by the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: String,
    pub nullable: bool,
    /// Key marker, e.g. `PRI`, `UNI`, `MUL` or empty
    pub key: String,
    pub default: Option<String>,
    /// Extra attributes, e.g. `auto_increment`
    pub extra: String,
}

impl ColumnInfo {
    /// Column with only a name and type known
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            nullable: true,
            key: String::new(),
            default: None,
            extra: String::new(),
        }
    }

    pub fn is_primary_key(&self) -> bool {
        self.key.eq_ignore_ascii_case("PRI")
    }
}

/// Columns of one table, cached for the lifetime of a model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    table: String,
    columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            table: table.into(),
            columns,
        }
    }

    /// Schema from bare column names
    pub fn from_names<I, S>(table: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns = names
            .into_iter()
            .map(|name| ColumnInfo::new(name, ""))
            .collect();
        Self::new(table, columns)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn primary_key(&self) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.is_primary_key())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let mut id = ColumnInfo::new("id", "int unsigned");
        id.key = "PRI".into();
        id.extra = "auto_increment".into();
        let schema = TableSchema::new("orders", vec![id, ColumnInfo::new("total", "decimal(10,2)")]);

        assert!(schema.contains("total"));
        assert!(!schema.contains("Total"));
        assert_eq!(schema.column_names(), vec!["id", "total"]);
        assert_eq!(schema.primary_key().map(|c| c.name.as_str()), Some("id"));
    }
}

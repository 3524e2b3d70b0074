//! Table metadata
//!
//! Column and index definitions are read with `SHOW FULL COLUMNS` and
//! `SHOW INDEX`. Binlog rows carry no column names and no signedness on
//! older servers, so this metadata is what turns a positional row into
//! something a handler can use.

use super::command::CommandExecutor;
use crate::common::{CanalError, Result};
use crate::mysql::{ResultSet, RowValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `ER_NO_SUCH_TABLE`
const ER_NO_SUCH_TABLE: u16 = 1146;

/// Table whose metadata RDS cannot describe; it gets a fixed shape instead.
pub const HA_HEALTH_CHECK_TABLE: &str = "mysql.ha_health_check";

/// Coarse column classification used for value coercion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Number,
    MediumInt,
    Float,
    Decimal,
    Enum,
    Set,
    String,
    Binary,
    DateTime,
    Timestamp,
    Date,
    Time,
    Bit,
    Json,
    Point,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub kind: ColumnKind,
    /// Declared type, e.g. `int(10) unsigned`
    pub raw_type: String,
    pub collation: String,
    pub is_unsigned: bool,
    pub is_nullable: bool,
    pub is_auto: bool,
    pub is_virtual: bool,
    pub is_stored: bool,
    pub enum_values: Vec<String>,
    pub set_values: Vec<String>,
    /// Declared length of `char(n)`
    pub fixed_size: u32,
    /// Declared length of `varchar(n)`
    pub max_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    pub cardinality: Vec<u64>,
    pub non_unique: bool,
}

impl Index {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            cardinality: Vec::new(),
            non_unique: false,
        }
    }
}

/// Column and index layout of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub schema: String,
    pub name: String,
    pub columns: Vec<TableColumn>,
    pub indexes: Vec<Index>,
    /// Indices into `columns` forming the primary key
    pub pk_columns: Vec<usize>,
    /// Indices into `columns` of unsigned numeric columns
    pub unsigned_columns: Vec<usize>,
}

impl Table {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            pk_columns: Vec::new(),
            unsigned_columns: Vec::new(),
        }
    }

    /// Cache key, `schema.table`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Append a column from its `SHOW FULL COLUMNS` description.
    pub fn add_column(&mut self, name: &str, raw_type: &str, collation: &str, extra: &str) {
        let column = classify_column(name, raw_type, collation, extra);
        if column.is_unsigned {
            self.unsigned_columns.push(self.columns.len());
        }
        self.columns.push(column);
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn is_primary_key(&self, column: usize) -> bool {
        self.pk_columns.contains(&column)
    }

    /// Primary key values of `row`, in key order.
    pub fn pk_values<'a>(&self, row: &'a [RowValue]) -> Result<Vec<&'a RowValue>> {
        self.pk_columns
            .iter()
            .map(|&i| {
                row.get(i).ok_or_else(|| {
                    CanalError::invariant(format!(
                        "row of {} has {} columns, primary key column {} is missing",
                        self.key(),
                        row.len(),
                        i
                    ))
                })
            })
            .collect()
    }

    /// Build the table from `SHOW FULL COLUMNS` and `SHOW INDEX` replies.
    pub fn from_result_sets(
        schema: impl Into<String>,
        name: impl Into<String>,
        columns: &ResultSet,
        indexes: &ResultSet,
    ) -> Result<Self> {
        let mut table = Self::new(schema, name);

        for row in 0..columns.rows.len() {
            let field = columns.get(row, "Field").ok_or_else(|| {
                CanalError::protocol(format!("SHOW FULL COLUMNS for {} lacks Field", table.key()))
            })?;
            let raw_type = columns.get(row, "Type").unwrap_or_default();
            let collation = columns.get(row, "Collation").unwrap_or_default();
            let extra = columns.get(row, "Extra").unwrap_or_default();
            table.add_column(field, raw_type, collation, extra);
            if let Some(column) = table.columns.last_mut() {
                column.is_nullable = columns
                    .get(row, "Null")
                    .is_some_and(|v| v.eq_ignore_ascii_case("YES"));
            }
        }

        for row in 0..indexes.rows.len() {
            let key_name = indexes.get(row, "Key_name").unwrap_or_default();
            if table.indexes.last().map(|i| i.name.as_str()) != Some(key_name) {
                table.indexes.push(Index::new(key_name));
            }
            let column = indexes.get(row, "Column_name").unwrap_or_default().to_string();
            let cardinality = indexes
                .get(row, "Cardinality")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let non_unique = indexes.get(row, "Non_unique").is_some_and(|v| v != "0");
            if let Some(index) = table.indexes.last_mut() {
                index.columns.push(column);
                index.cardinality.push(cardinality);
                index.non_unique = non_unique;
            }
        }

        table.pk_columns = match table.indexes.first() {
            Some(index) if index.name == "PRIMARY" => index
                .columns
                .iter()
                .filter_map(|c| table.find_column(c))
                .collect(),
            _ => Vec::new(),
        };

        Ok(table)
    }

    /// Read the table definition over the command connection.
    pub async fn fetch(executor: &dyn CommandExecutor, schema: &str, name: &str) -> Result<Self> {
        let quoted = format!("{}.{}", quote_identifier(schema), quote_identifier(name));
        let columns = match executor
            .execute(&format!("SHOW FULL COLUMNS FROM {}", quoted))
            .await
        {
            Ok(rs) => rs,
            Err(CanalError::Server { code, .. }) if code == ER_NO_SUCH_TABLE => {
                return Err(CanalError::TableNotExist(format!("{}.{}", schema, name)));
            }
            Err(e) => return Err(e),
        };
        let indexes = executor.execute(&format!("SHOW INDEX FROM {}", quoted)).await?;
        Self::from_result_sets(schema, name, &columns, &indexes)
    }

    /// Fixed shape used for [`HA_HEALTH_CHECK_TABLE`].
    pub fn ha_health_check(schema: &str, name: &str) -> Self {
        let mut table = Self::new(schema, name);
        table.add_column("id", "bigint(20)", "", "");
        table.add_column("type", "char(1)", "", "");
        table
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Backtick-quote an identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn classify_column(name: &str, raw_type: &str, collation: &str, extra: &str) -> TableColumn {
    let lower = raw_type.to_ascii_lowercase();
    let mut column = TableColumn {
        name: name.to_string(),
        kind: ColumnKind::String,
        raw_type: raw_type.to_string(),
        collation: collation.to_string(),
        is_unsigned: false,
        is_nullable: false,
        is_auto: false,
        is_virtual: false,
        is_stored: false,
        enum_values: Vec::new(),
        set_values: Vec::new(),
        fixed_size: 0,
        max_size: 0,
    };

    column.kind = if lower.starts_with("float") || lower.starts_with("double") {
        ColumnKind::Float
    } else if lower.starts_with("decimal") {
        ColumnKind::Decimal
    } else if lower.starts_with("enum") {
        column.enum_values = parse_value_list(&lower, raw_type, "enum(");
        ColumnKind::Enum
    } else if lower.starts_with("set") {
        column.set_values = parse_value_list(&lower, raw_type, "set(");
        ColumnKind::Set
    } else if lower.starts_with("binary") || lower.starts_with("varbinary") {
        ColumnKind::Binary
    } else if lower.starts_with("datetime") {
        ColumnKind::DateTime
    } else if lower.starts_with("timestamp") {
        ColumnKind::Timestamp
    } else if lower.starts_with("time") {
        ColumnKind::Time
    } else if lower == "date" {
        ColumnKind::Date
    } else if lower.starts_with("bit") {
        ColumnKind::Bit
    } else if lower.starts_with("json") {
        ColumnKind::Json
    } else if lower.contains("point") {
        ColumnKind::Point
    } else if lower.contains("mediumint") {
        ColumnKind::MediumInt
    } else if lower.contains("int") || lower.starts_with("year") {
        ColumnKind::Number
    } else {
        if lower.starts_with("char") {
            column.fixed_size = declared_length(&lower);
        } else if lower.starts_with("varchar") {
            column.max_size = declared_length(&lower);
        }
        ColumnKind::String
    };

    column.is_unsigned = lower.contains("unsigned") || lower.contains("zerofill");
    column.is_auto = extra.eq_ignore_ascii_case("auto_increment");
    let extra_upper = extra.to_ascii_uppercase();
    column.is_virtual = extra_upper.contains("VIRTUAL GENERATED");
    column.is_stored = extra_upper.contains("STORED GENERATED");
    column
}

/// Values of `enum('a','b')` or `set('x','y')`, keeping the declared case.
fn parse_value_list(lower: &str, raw: &str, prefix: &str) -> Vec<String> {
    if !lower.starts_with(prefix) {
        return Vec::new();
    }
    let inner = &raw[prefix.len()..];
    let inner = inner.strip_suffix(')').unwrap_or(inner);
    inner
        .split(',')
        .map(|v| v.trim().trim_matches('\'').to_string())
        .collect()
}

fn declared_length(lower: &str) -> u32 {
    lower
        .split_once('(')
        .and_then(|(_, rest)| rest.split_once(')'))
        .and_then(|(n, _)| n.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canal::command::tests::{result_set, ScriptedExecutor};
    use pretty_assertions::assert_eq;

    const COLUMN_HEADERS: &[&str] = &[
        "Field", "Type", "Collation", "Null", "Key", "Default", "Extra", "Privileges", "Comment",
    ];
    const INDEX_HEADERS: &[&str] = &[
        "Table",
        "Non_unique",
        "Key_name",
        "Seq_in_index",
        "Column_name",
        "Collation",
        "Cardinality",
    ];

    fn columns_reply() -> ResultSet {
        result_set(
            COLUMN_HEADERS,
            &[
                &[Some("id"), Some("int(10) unsigned"), None, Some("NO"), Some("PRI"), None, Some("auto_increment"), None, None],
                &[Some("name"), Some("varchar(256)"), Some("utf8mb4_general_ci"), Some("YES"), None, None, Some(""), None, None],
                &[Some("mi"), Some("mediumint(8) unsigned"), None, Some("YES"), None, None, Some(""), None, None],
                &[Some("state"), Some("enum('Active','Closed')"), None, Some("YES"), None, None, Some(""), None, None],
                &[Some("tags"), Some("set('a','b')"), None, Some("YES"), None, None, Some(""), None, None],
                &[Some("price"), Some("decimal(10,2)"), None, Some("YES"), None, None, Some(""), None, None],
                &[Some("code"), Some("char(4)"), None, Some("YES"), None, None, Some(""), None, None],
                &[Some("v"), Some("int(11)"), None, Some("YES"), None, None, Some("VIRTUAL GENERATED"), None, None],
            ],
        )
    }

    fn index_reply() -> ResultSet {
        result_set(
            INDEX_HEADERS,
            &[
                &[Some("t"), Some("0"), Some("PRIMARY"), Some("1"), Some("id"), Some("A"), Some("3")],
                &[Some("t"), Some("1"), Some("name_idx"), Some("1"), Some("name"), Some("A"), Some("2")],
                &[Some("t"), Some("1"), Some("name_idx"), Some("2"), Some("code"), Some("A"), None],
            ],
        )
    }

    #[test]
    fn test_from_result_sets() {
        let table = Table::from_result_sets("shop", "t", &columns_reply(), &index_reply()).unwrap();

        assert_eq!(table.key(), "shop.t");
        assert_eq!(table.columns.len(), 8);
        assert_eq!(table.pk_columns, vec![0]);
        assert_eq!(table.unsigned_columns, vec![0, 2]);

        let id = &table.columns[0];
        assert_eq!(id.kind, ColumnKind::Number);
        assert!(id.is_auto);
        assert!(!id.is_nullable);

        assert_eq!(table.columns[1].max_size, 256);
        assert!(table.columns[1].is_nullable);
        assert_eq!(table.columns[2].kind, ColumnKind::MediumInt);
        assert_eq!(table.columns[3].enum_values, vec!["Active", "Closed"]);
        assert_eq!(table.columns[4].set_values, vec!["a", "b"]);
        assert_eq!(table.columns[5].kind, ColumnKind::Decimal);
        assert_eq!(table.columns[6].fixed_size, 4);
        assert!(table.columns[7].is_virtual);

        assert_eq!(table.indexes.len(), 2);
        assert_eq!(table.indexes[1].columns, vec!["name", "code"]);
        assert_eq!(table.indexes[1].cardinality, vec![2, 0]);
        assert!(table.indexes[1].non_unique);
    }

    #[test]
    fn test_column_classification() {
        let cases = [
            ("double", ColumnKind::Float),
            ("datetime(6)", ColumnKind::DateTime),
            ("timestamp", ColumnKind::Timestamp),
            ("time(3)", ColumnKind::Time),
            ("date", ColumnKind::Date),
            ("bit(8)", ColumnKind::Bit),
            ("json", ColumnKind::Json),
            ("point", ColumnKind::Point),
            ("varbinary(16)", ColumnKind::Binary),
            ("year(4)", ColumnKind::Number),
            ("bigint(20)", ColumnKind::Number),
            ("longtext", ColumnKind::String),
        ];
        for (raw, kind) in cases {
            assert_eq!(classify_column("c", raw, "", "").kind, kind, "{}", raw);
        }
        assert!(classify_column("c", "int(5) zerofill", "", "").is_unsigned);
    }

    #[test]
    fn test_no_primary_key() {
        let indexes = result_set(
            INDEX_HEADERS,
            &[&[Some("t"), Some("1"), Some("name_idx"), Some("1"), Some("name"), Some("A"), Some("2")]],
        );
        let table = Table::from_result_sets("shop", "t", &columns_reply(), &indexes).unwrap();
        assert!(table.pk_columns.is_empty());
    }

    #[test]
    fn test_pk_values() {
        let table = Table::from_result_sets("shop", "t", &columns_reply(), &index_reply()).unwrap();
        let row = vec![RowValue::UInt32(7), RowValue::String("a".into())];
        assert_eq!(table.pk_values(&row).unwrap(), vec![&RowValue::UInt32(7)]);
        assert!(table.pk_values(&[]).is_err());
        assert!(table.is_primary_key(0));
        assert_eq!(table.find_column("NAME"), Some(1));
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("a`b"), "`a``b`");
    }

    #[tokio::test]
    async fn test_fetch() {
        let exec = ScriptedExecutor::default();
        exec.respond("SHOW FULL COLUMNS FROM `shop`.`t`", columns_reply());
        exec.respond("SHOW INDEX FROM `shop`.`t`", index_reply());

        let table = Table::fetch(&exec, "shop", "t").await.unwrap();
        assert_eq!(table.columns.len(), 8);
        assert_eq!(
            exec.executed(),
            vec!["SHOW FULL COLUMNS FROM `shop`.`t`", "SHOW INDEX FROM `shop`.`t`"]
        );
    }

    #[tokio::test]
    async fn test_fetch_missing_table() {
        let exec = ScriptedExecutor::default();
        exec.fail("SHOW FULL COLUMNS FROM `shop`.`gone`", 1146);
        let err = Table::fetch(&exec, "shop", "gone").await.unwrap_err();
        assert!(matches!(err, CanalError::TableNotExist(ref t) if t == "shop.gone"));
    }

    #[test]
    fn test_ha_health_check_shape() {
        let table = Table::ha_health_check("mysql", "ha_health_check");
        assert_eq!(table.key(), HA_HEALTH_CHECK_TABLE);
        assert_eq!(table.columns.len(), 2);
    }
}

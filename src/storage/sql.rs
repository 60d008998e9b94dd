//! Translation of the SQL subset understood by [`super::MemoryAdapter`].
//!
//! Unit-of-work scripts are parsed with `sqlparser` (PostgreSQL dialect).
//! `CREATE TABLE`, `DROP TABLE`, `INSERT ... VALUES` and unfiltered
//! `DELETE FROM` are executable; anything else parses but is rejected at
//! execution time.

use crate::core::{AppError, Column, ColumnDefault, DataType, Result, TableSchema, Value};
use chrono::Utc;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MemoryStatement {
    CreateTable {
        schema: TableSchema,
        if_not_exists: bool,
    },
    DropTable {
        names: Vec<String>,
        if_exists: bool,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Value>>,
    },
    Delete {
        table: String,
    },
}

/// Parse a script and return the number of statements it contains.
///
/// Only syntax is checked; the statements may still be unsupported by a
/// particular adapter.
pub fn check_syntax(sql: &str) -> Result<usize> {
    let statements =
        Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| AppError::Parse(e.to_string()))?;
    Ok(statements.len())
}

pub(crate) fn parse_script(sql: &str) -> Result<Vec<MemoryStatement>> {
    let statements =
        Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| AppError::Parse(e.to_string()))?;

    statements.into_iter().map(convert_statement).collect()
}

fn convert_statement(stmt: sql_ast::Statement) -> Result<MemoryStatement> {
    match stmt {
        sql_ast::Statement::CreateTable(create) => {
            let table = object_name(&create.name);
            let columns = create
                .columns
                .iter()
                .map(convert_column_def)
                .collect::<Result<Vec<_>>>()?;

            Ok(MemoryStatement::CreateTable {
                schema: TableSchema {
                    name: table,
                    columns,
                },
                if_not_exists: create.if_not_exists,
            })
        }
        sql_ast::Statement::Drop {
            object_type,
            names,
            if_exists,
            ..
        } => {
            if let sql_ast::ObjectType::Table = object_type {
                Ok(MemoryStatement::DropTable {
                    names: names.iter().map(object_name).collect(),
                    if_exists,
                })
            } else {
                Err(AppError::UnsupportedOperation(format!(
                    "Only DROP TABLE supported, got: {:?}",
                    object_type
                )))
            }
        }
        sql_ast::Statement::Insert(insert) => {
            let table = insert.table.to_string().replace('"', "");
            let columns = if insert.columns.is_empty() {
                None
            } else {
                Some(insert.columns.into_iter().map(|id| id.value).collect())
            };

            let rows = match insert.source {
                Some(source) => {
                    if let sql_ast::SetExpr::Values(vals) = *source.body {
                        vals.rows
                            .iter()
                            .map(|row| row.iter().map(literal).collect::<Result<Vec<_>>>())
                            .collect::<Result<Vec<_>>>()?
                    } else {
                        return Err(AppError::UnsupportedOperation(
                            "Only VALUES clause supported".into(),
                        ));
                    }
                }
                None => Vec::new(),
            };

            Ok(MemoryStatement::Insert {
                table,
                columns,
                rows,
            })
        }
        sql_ast::Statement::Delete(delete) => {
            if delete.selection.is_some() {
                return Err(AppError::UnsupportedOperation(
                    "DELETE with WHERE is not supported".into(),
                ));
            }
            let tables = match delete.from {
                sql_ast::FromTable::WithFromKeyword(tables) => tables,
                sql_ast::FromTable::WithoutKeyword(tables) => tables,
            };
            let table = match tables.first().map(|t| &t.relation) {
                Some(sql_ast::TableFactor::Table { name, .. }) => object_name(name),
                _ => {
                    return Err(AppError::UnsupportedOperation(
                        "DELETE requires a single plain table".into(),
                    ));
                }
            };
            Ok(MemoryStatement::Delete { table })
        }
        other => Err(AppError::UnsupportedOperation(format!(
            "Statement not supported by the memory adapter: {}",
            other
        ))),
    }
}

fn object_name(name: &sql_ast::ObjectName) -> String {
    name.to_string().replace('"', "")
}

fn convert_column_def(col: &sql_ast::ColumnDef) -> Result<Column> {
    let type_name = col.data_type.to_string().to_uppercase();
    let data_type = map_data_type(&type_name);
    let mut column = Column::new(col.name.value.clone(), data_type);

    if type_name.contains("SERIAL") {
        column = column.increments();
    }

    for option in &col.options {
        let rendered = option.option.to_string().to_uppercase();
        match &option.option {
            sql_ast::ColumnOption::NotNull => column = column.not_null(),
            sql_ast::ColumnOption::Default(expr) => {
                column.default = Some(if is_now(expr) {
                    ColumnDefault::Now
                } else {
                    ColumnDefault::Value(literal(expr)?)
                });
            }
            _ if rendered.starts_with("PRIMARY KEY") => {
                column.primary_key = true;
                column.nullable = false;
            }
            _ if rendered.contains("AUTOINCREMENT")
                || rendered.contains("AUTO_INCREMENT")
                || rendered.contains("IDENTITY") =>
            {
                column = column.increments();
            }
            _ => {}
        }
    }

    Ok(column)
}

fn map_data_type(type_name: &str) -> DataType {
    if type_name.contains("INT") || type_name.contains("SERIAL") {
        DataType::Integer
    } else if type_name.contains("BOOL") {
        DataType::Boolean
    } else if type_name.contains("FLOAT")
        || type_name.contains("REAL")
        || type_name.contains("DOUBLE")
        || type_name.contains("NUMERIC")
        || type_name.contains("DECIMAL")
    {
        DataType::Float
    } else if type_name.contains("TIMESTAMP") || type_name.contains("DATE") {
        DataType::Timestamp
    } else {
        DataType::Text
    }
}

fn is_now(expr: &sql_ast::Expr) -> bool {
    let rendered = expr.to_string().to_uppercase();
    rendered == "CURRENT_TIMESTAMP" || rendered == "NOW()"
}

fn literal(expr: &sql_ast::Expr) -> Result<Value> {
    if is_now(expr) {
        return Ok(Value::Timestamp(Utc::now()));
    }

    match expr {
        sql_ast::Expr::Value(val) => convert_value(&val.value),
        sql_ast::Expr::UnaryOp {
            op: sql_ast::UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Value::Integer(i) => Ok(Value::Integer(-i)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(AppError::Parse(format!(
                "Cannot negate {}",
                other.type_name()
            ))),
        },
        sql_ast::Expr::Nested(inner) => literal(inner),
        other => Err(AppError::UnsupportedOperation(format!(
            "Only literal values are supported, got: {}",
            other
        ))),
    }
}

fn convert_value(val: &sql_ast::Value) -> Result<Value> {
    match val {
        sql_ast::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::Integer(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Value::Float(f))
            } else {
                Err(AppError::Parse(format!("Invalid number: {}", n)))
            }
        }
        sql_ast::Value::SingleQuotedString(s) | sql_ast::Value::DoubleQuotedString(s) => {
            Ok(Value::Text(s.clone()))
        }
        sql_ast::Value::Boolean(b) => Ok(Value::Boolean(*b)),
        sql_ast::Value::Null => Ok(Value::Null),
        _ => Err(AppError::UnsupportedOperation(format!(
            "Unsupported value: {}",
            val
        ))),
    }
}

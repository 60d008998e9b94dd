pub mod error;
pub mod types;
pub mod value;

pub use error::{AppError, ErrorKind, InvalidUnit, Result};
pub use types::{
    AlterOp, Column, ColumnDefault, Condition, DataType, Filter, QueryResult, Record, TableSchema,
};
pub use value::Value;

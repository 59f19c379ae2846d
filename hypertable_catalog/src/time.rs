//! Encoding of internal time values as SQL literals of a hypertable's time column type.
//!
//! Internal time is an `i64`. Integer time columns store it as-is; timestamp and date columns
//! store microseconds since the Unix epoch.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeColumnType {
    SmallInt,
    Integer,
    BigInt,
    Timestamp,
    TimestampTz,
    Date,
}

impl TimeColumnType {
    /// Render `internal_time` as a SQL literal for a column of this type
    pub fn to_literal_sql(&self, internal_time: i64) -> Result<String> {
        match self {
            Self::SmallInt => i16::try_from(internal_time)
                .map(|v| v.to_string())
                .map_err(|_| self.out_of_range(internal_time)),
            Self::Integer => i32::try_from(internal_time)
                .map(|v| v.to_string())
                .map_err(|_| self.out_of_range(internal_time)),
            Self::BigInt => Ok(internal_time.to_string()),
            Self::Timestamp => {
                let ts = DateTime::<Utc>::from_timestamp_micros(internal_time)
                    .ok_or_else(|| self.out_of_range(internal_time))?;
                Ok(format!(
                    "'{}'::timestamp",
                    ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f")
                ))
            }
            Self::TimestampTz => {
                let ts = DateTime::<Utc>::from_timestamp_micros(internal_time)
                    .ok_or_else(|| self.out_of_range(internal_time))?;
                Ok(format!(
                    "'{}+00'::timestamptz",
                    ts.format("%Y-%m-%d %H:%M:%S%.6f")
                ))
            }
            Self::Date => {
                let ts = DateTime::<Utc>::from_timestamp_micros(internal_time)
                    .ok_or_else(|| self.out_of_range(internal_time))?;
                Ok(format!("'{}'::date", ts.date_naive().format("%Y-%m-%d")))
            }
        }
    }

    fn out_of_range(&self, value: i64) -> Error {
        Error::TimeLiteralOutOfRange {
            column_type: *self,
            value,
        }
    }
}

impl Display for TimeColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SmallInt => write!(f, "smallint"),
            Self::Integer => write!(f, "integer"),
            Self::BigInt => write!(f, "bigint"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::TimestampTz => write!(f, "timestamptz"),
            Self::Date => write!(f, "date"),
        }
    }
}

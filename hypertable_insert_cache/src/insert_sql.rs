//! Synthesis of the statement that moves staged rows into a chunk's destination tables.
//!
//! The statement is a single data-modifying CTE:
//!
//! ```text
//! WITH selected AS (DELETE FROM ONLY <staging> WHERE <predicate> RETURNING *),
//!      i_1 AS (INSERT INTO <dest 1> SELECT * FROM selected),
//!      ...
//! SELECT 1
//! ```
//!
//! The predicate restricts the deleted rows to the chunk's partition keyspace and time bounds.

use std::{borrow::Cow, fmt::Display, sync::Arc};

use hypertable_catalog::{Chunk, ChunkRouting, Epoch, Hypertable, Partition, TableRef};
use hypertable_clap_blocks::chunk_cache::EmptyDestinationPolicy;
use sqlparser::keywords::ALL_KEYWORDS;
use tracing::warn;

use crate::{Error, Result};

/// Quote `ident` for use in SQL text if it needs quoting.
///
/// An identifier is left bare only if it consists of lower case letters, digits and underscores,
/// does not start with a digit, and is not a keyword. Otherwise it is wrapped in double quotes
/// with any embedded double quotes doubled.
pub fn quote_identifier(ident: &str) -> Cow<'_, str> {
    let safe = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && ALL_KEYWORDS
            .binary_search(&ident.to_ascii_uppercase().as_str())
            .is_err();
    if safe {
        Cow::Borrowed(ident)
    } else {
        Cow::Owned(format!("\"{}\"", ident.replace('"', "\"\"")))
    }
}

fn qualified(table: &TableRef) -> String {
    format!(
        "{}.{}",
        quote_identifier(&table.schema_name),
        quote_identifier(&table.table_name)
    )
}

/// Immutable text of a movement statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    sql: Arc<str>,
    num_destinations: usize,
    param_count: usize,
}

impl InsertStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn num_destinations(&self) -> usize {
        self.num_destinations
    }

    /// Number of positional parameters the statement takes
    pub fn param_count(&self) -> usize {
        self.param_count
    }
}

impl Display for InsertStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Accumulates the clauses of an [`InsertStatement`]
#[derive(Debug, Clone)]
pub struct InsertStatementBuilder {
    staging: TableRef,
    predicates: Vec<String>,
    destinations: Vec<TableRef>,
}

impl InsertStatementBuilder {
    pub fn new(staging: TableRef) -> Self {
        Self {
            staging,
            predicates: Vec::new(),
            destinations: Vec::new(),
        }
    }

    /// AND a parenthesized clause onto the staging predicate
    pub fn predicate(mut self, clause: impl Into<String>) -> Self {
        self.predicates.push(clause.into());
        self
    }

    /// Add an insertion step into `table`
    pub fn destination(mut self, table: TableRef) -> Self {
        self.destinations.push(table);
        self
    }

    pub fn destinations(mut self, tables: impl IntoIterator<Item = TableRef>) -> Self {
        self.destinations.extend(tables);
        self
    }

    pub fn build(self) -> InsertStatement {
        let mut sql = format!(
            "WITH selected AS (DELETE FROM ONLY {} WHERE TRUE",
            qualified(&self.staging)
        );
        for clause in &self.predicates {
            sql.push_str(" AND ");
            sql.push_str(clause);
        }
        sql.push_str(" RETURNING *)");
        for (i, table) in self.destinations.iter().enumerate() {
            sql.push_str(&format!(
                ", i_{} AS (INSERT INTO {} SELECT * FROM selected)",
                i + 1,
                qualified(table)
            ));
        }
        sql.push_str(" SELECT 1");

        InsertStatement {
            sql: sql.into(),
            num_destinations: self.destinations.len(),
            param_count: 0,
        }
    }
}

/// Metadata a movement statement is synthesized from
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub hypertable: &'a Hypertable,
    pub epoch: &'a Epoch,
    pub partition: &'a Partition,
    pub chunk: &'a Chunk,
}

/// Synthesize the statement moving staged rows of `ctx.chunk` into its destination tables.
///
/// The destination tables are looked up through `routing` on every call.
pub fn build_insert_statement<R>(
    ctx: BuildContext<'_>,
    routing: &R,
    policy: EmptyDestinationPolicy,
) -> Result<InsertStatement>
where
    R: ChunkRouting + ?Sized,
{
    let chunk_id = ctx.chunk.id;
    let hypertable = ctx.hypertable;
    let mut builder = InsertStatementBuilder::new(hypertable.staging_table());

    if ctx.epoch.num_partitions > 1 {
        let partitioning = ctx
            .epoch
            .partitioning
            .as_ref()
            .ok_or_else(|| Error::CompileError {
                chunk_id,
                reason: format!(
                    "epoch {} has {} partitions but no partitioning function",
                    ctx.epoch.id, ctx.epoch.num_partitions
                ),
            })?;
        builder = builder.predicate(format!(
            "({}.{}({}::TEXT, {}) BETWEEN {} AND {})",
            quote_identifier(&partitioning.func.schema_name),
            quote_identifier(&partitioning.func.name),
            quote_identifier(&partitioning.column_name),
            partitioning.func.modulo,
            ctx.partition.keyspace_start,
            ctx.partition.keyspace_end,
        ));
    }

    let time_column = quote_identifier(&hypertable.time_column_name);
    let literal = |t: i64| {
        hypertable
            .time_column_type
            .to_literal_sql(t)
            .map_err(|e| Error::CompileError {
                chunk_id,
                reason: e.to_string(),
            })
    };
    if let Some(start) = ctx.chunk.range.start {
        builder = builder.predicate(format!("({time_column} >= {})", literal(start)?));
    }
    if let Some(end) = ctx.chunk.range.end {
        builder = builder.predicate(format!("({time_column} <= {})", literal(end)?));
    }

    let destinations = routing.destination_tables(chunk_id)?;
    if destinations.is_empty() {
        match policy {
            EmptyDestinationPolicy::Warn => warn!(
                chunk_id = %chunk_id,
                staging = %hypertable.staging_table(),
                "chunk has no destination tables, staged rows will be discarded"
            ),
            EmptyDestinationPolicy::Reject => return Err(Error::NoDestinationTables(chunk_id)),
        }
    }

    Ok(builder.destinations(destinations).build())
}

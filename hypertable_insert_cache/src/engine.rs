//! The execution engine seam: compiling statement text into reusable plans.

use std::{
    fmt::{Debug, Display},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use hashbrown::HashMap;
use hypertable_catalog::{RelationLookup, TableRef};
use parking_lot::Mutex;
use sqlparser::{
    dialect::PostgreSqlDialect,
    keywords::Keyword,
    tokenizer::{Token, Tokenizer, Word},
};
use tracing::{debug, warn};

/// Opaque handle to a compiled plan held by a [`PlanEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanHandle(u64);

impl PlanHandle {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl Display for PlanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "plan#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("syntax error: {message}")]
    Syntax { message: String },

    #[error("relation {0} does not exist")]
    UnknownRelation(TableRef),
}

impl EngineError {
    fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax {
            message: message.into(),
        }
    }
}

/// Compiles statement text into plans and frees them again.
pub trait PlanEngine: Debug + Send + Sync + 'static {
    /// Compile `sql`, which takes `param_count` positional parameters, into a reusable plan.
    fn prepare(&self, sql: &str, param_count: usize) -> Result<PlanHandle, EngineError>;

    /// Free the resources held by `plan`. Every handle returned by [`prepare`] must be released
    /// exactly once.
    ///
    /// [`prepare`]: PlanEngine::prepare
    fn release(&self, plan: PlanHandle);
}

/// A plan prepared by [`MemPlanEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPlan {
    pub sql: Arc<str>,
    pub param_count: usize,
    /// Number of times the plan was released. Anything other than 0 or 1 is a caller bug.
    pub releases: usize,
}

/// An in-memory [`PlanEngine`].
///
/// Statements are tokenized with the PostgreSQL dialect, parentheses must balance, positional
/// parameters may not exceed the declared count, and, given a [`RelationLookup`], every
/// schema-qualified relation following `INTO` or `ONLY` must exist. Every prepared plan is kept
/// after release so that tests can assert on how plans were used.
pub struct MemPlanEngine {
    relations: Option<Arc<dyn RelationLookup>>,
    next_handle: AtomicU64,
    plans: Mutex<HashMap<PlanHandle, PreparedPlan>>,
}

impl Debug for MemPlanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemPlanEngine")
            .field("relations", &self.relations)
            .field("n_plans", &self.plans.lock().len())
            .finish()
    }
}

impl Default for MemPlanEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemPlanEngine {
    /// An engine that does not check relations
    pub fn new() -> Self {
        Self {
            relations: None,
            next_handle: AtomicU64::new(1),
            plans: Default::default(),
        }
    }

    /// An engine that rejects statements referencing relations unknown to `relations`
    pub fn with_relations(relations: Arc<dyn RelationLookup>) -> Self {
        Self {
            relations: Some(relations),
            ..Self::new()
        }
    }

    /// Total number of plans prepared so far
    pub fn prepare_count(&self) -> usize {
        self.plans.lock().len()
    }

    /// Number of times `plan` was released, `None` if it was never prepared
    pub fn release_count(&self, plan: PlanHandle) -> Option<usize> {
        self.plans.lock().get(&plan).map(|p| p.releases)
    }

    /// Handles of prepared plans that have not been released, in preparation order
    pub fn live_plans(&self) -> Vec<PlanHandle> {
        let mut live: Vec<_> = self
            .plans
            .lock()
            .iter()
            .filter(|(_, p)| p.releases == 0)
            .map(|(h, _)| *h)
            .collect();
        live.sort();
        live
    }

    pub fn plan(&self, plan: PlanHandle) -> Option<PreparedPlan> {
        self.plans.lock().get(&plan).cloned()
    }

    fn validate(&self, sql: &str, param_count: usize) -> Result<(), EngineError> {
        let dialect = PostgreSqlDialect {};
        let tokens: Vec<Token> = Tokenizer::new(&dialect, sql)
            .tokenize()
            .map_err(|e| EngineError::syntax(e.to_string()))?
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_)))
            .collect();
        if tokens.is_empty() {
            return Err(EngineError::syntax("empty statement"));
        }

        let mut depth = 0usize;
        for token in &tokens {
            match token {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| EngineError::syntax("unbalanced ')'"))?;
                }
                Token::Placeholder(p) => {
                    let n: usize = p
                        .strip_prefix('$')
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| EngineError::syntax(format!("bad parameter {p}")))?;
                    if n == 0 || n > param_count {
                        return Err(EngineError::syntax(format!(
                            "parameter {p} is out of range for {param_count} parameters"
                        )));
                    }
                }
                _ => {}
            }
        }
        if depth != 0 {
            return Err(EngineError::syntax("unbalanced '('"));
        }

        if let Some(relations) = &self.relations {
            for table in referenced_relations(&tokens) {
                if !relations.relation_exists(&table) {
                    return Err(EngineError::UnknownRelation(table));
                }
            }
        }
        Ok(())
    }
}

/// Schema-qualified relations named directly after `INTO` or `ONLY`
fn referenced_relations(tokens: &[Token]) -> Vec<TableRef> {
    tokens
        .windows(4)
        .filter_map(|w| match w {
            [
                Token::Word(Word {
                    keyword: Keyword::INTO | Keyword::ONLY,
                    quote_style: None,
                    ..
                }),
                Token::Word(schema),
                Token::Period,
                Token::Word(table),
            ] => Some(TableRef::new(identifier(schema), identifier(table))),
            _ => None,
        })
        .collect()
}

/// Unquoted identifiers fold to lower case
fn identifier(word: &Word) -> String {
    match word.quote_style {
        Some(_) => word.value.clone(),
        None => word.value.to_lowercase(),
    }
}

impl PlanEngine for MemPlanEngine {
    fn prepare(&self, sql: &str, param_count: usize) -> Result<PlanHandle, EngineError> {
        self.validate(sql, param_count)?;
        let handle = PlanHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.plans.lock().insert(
            handle,
            PreparedPlan {
                sql: sql.into(),
                param_count,
                releases: 0,
            },
        );
        debug!(%handle, "prepared plan");
        Ok(handle)
    }

    fn release(&self, plan: PlanHandle) {
        match self.plans.lock().get_mut(&plan) {
            Some(prepared) => {
                prepared.releases += 1;
                if prepared.releases > 1 {
                    warn!(
                        handle = %plan,
                        releases = prepared.releases,
                        "plan released more than once"
                    );
                }
            }
            None => warn!(handle = %plan, "release of unknown plan"),
        }
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashSet;
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Default)]
    struct Relations(HashSet<TableRef>);

    impl RelationLookup for Relations {
        fn relation_exists(&self, table: &TableRef) -> bool {
            self.0.contains(table)
        }
    }

    #[test]
    fn prepare_and_release() {
        let engine = MemPlanEngine::new();
        let a = engine.prepare("SELECT 1", 0).unwrap();
        let b = engine.prepare("SELECT 2", 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(2, engine.prepare_count());
        assert_eq!(vec![a, b], engine.live_plans());

        engine.release(a);
        assert_eq!(Some(1), engine.release_count(a));
        assert_eq!(Some(0), engine.release_count(b));
        assert_eq!(vec![b], engine.live_plans());
        assert_eq!("SELECT 2", engine.plan(b).unwrap().sql.as_ref());

        // double and unknown releases are recorded, not fatal
        engine.release(a);
        assert_eq!(Some(2), engine.release_count(a));
        engine.release(PlanHandle::new(999));
        assert_eq!(None, engine.release_count(PlanHandle::new(999)));
    }

    #[test]
    fn rejects_malformed_statements() {
        let engine = MemPlanEngine::new();
        for sql in ["", "   ", "SELECT (1", "SELECT 1)", "SELECT 'unterminated"] {
            assert!(
                matches!(engine.prepare(sql, 0), Err(EngineError::Syntax { .. })),
                "{sql:?} should not prepare"
            );
        }
        assert_eq!(0, engine.prepare_count());
    }

    #[test]
    fn checks_parameter_count() {
        let engine = MemPlanEngine::new();
        assert!(matches!(
            engine.prepare("SELECT $1", 0),
            Err(EngineError::Syntax { .. })
        ));
        engine.prepare("SELECT $1, $2", 2).unwrap();
    }

    #[test]
    fn resolves_relations() {
        let mut known = Relations::default();
        known.0.insert(TableRef::new("ts_data", "chunk_a"));
        known.0.insert(TableRef::new("_hypertable_internal", "Staging"));
        let engine = MemPlanEngine::with_relations(Arc::new(known));

        engine
            .prepare(
                r#"WITH s AS (DELETE FROM ONLY _hypertable_internal."Staging" RETURNING *) INSERT INTO TS_DATA.chunk_a SELECT * FROM s"#,
                0,
            )
            .unwrap();

        let err = engine
            .prepare("INSERT INTO ts_data.chunk_b SELECT 1", 0)
            .unwrap_err();
        assert_eq!(
            EngineError::UnknownRelation(TableRef::new("ts_data", "chunk_b")),
            err
        );
    }
}

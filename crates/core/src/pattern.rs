//! Pattern-query gateway.
//!
//! Text queries are checked for basic well-formedness here, then handed to a
//! pluggable [`PatternEngine`] together with a [`FactSnapshot`]. The gateway
//! never mutates the knowledge base.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::fact_store::FactSnapshot;
use crate::{KbError, KnowledgeBase, Result};

/// One bound value in a result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// An individual, class or property name from the knowledge base itself.
    Name(String),
    /// Any other IRI.
    Iri(String),
    /// A literal's lexical form.
    Literal(String),
    /// A blank node label.
    Blank(String),
}

/// Variable name → bound value, in engine order.
pub type Bindings = Vec<(String, Binding)>;

/// One gateway result row: variable name → value.
pub type Row = BTreeMap<String, String>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PatternEngineError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("{0}")]
    Engine(String),
}

/// Black-box executor of pattern queries over a fact snapshot.
pub trait PatternEngine: Send + Sync {
    fn execute(
        &self,
        query: &PatternQuery,
        facts: &FactSnapshot,
    ) -> std::result::Result<Vec<Bindings>, PatternEngineError>;
}

impl<E: PatternEngine + ?Sized> PatternEngine for Arc<E> {
    fn execute(
        &self,
        query: &PatternQuery,
        facts: &FactSnapshot,
    ) -> std::result::Result<Vec<Bindings>, PatternEngineError> {
        (**self).execute(query, facts)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryForm {
    Select,
    Ask,
    Construct,
    Describe,
}

/// A query that passed the gateway's well-formedness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternQuery {
    text: String,
    form: QueryForm,
}

impl PatternQuery {
    /// Check that `text` names a query form and has balanced brackets.
    ///
    /// This is not a full parser; the engine still reports its own syntax
    /// errors.
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(KbError::QueryExecution("query is empty".into()));
        }
        let form = query_form(text)?;
        check_brackets(text)?;
        Ok(Self {
            text: text.to_string(),
            form,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn form(&self) -> QueryForm {
        self.form
    }
}

/// Skips the `PREFIX`/`BASE` prolog, each declaration ending at its `<iri>`,
/// and reads the query form keyword.
fn query_form(text: &str) -> Result<QueryForm> {
    let mut tokens = strip_comments(text)
        .split_whitespace()
        .map(str::to_string)
        .collect::<Vec<_>>()
        .into_iter();
    while let Some(token) = tokens.next() {
        let word: String = token
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect::<String>()
            .to_ascii_uppercase();
        match word.as_str() {
            "PREFIX" | "BASE" => {
                let mut last = token;
                while !last.ends_with('>') {
                    match tokens.next() {
                        Some(next) => last = next,
                        None => break,
                    }
                }
            }
            "SELECT" => return Ok(QueryForm::Select),
            "ASK" => return Ok(QueryForm::Ask),
            "CONSTRUCT" => return Ok(QueryForm::Construct),
            "DESCRIBE" => return Ok(QueryForm::Describe),
            _ => {
                return Err(KbError::QueryExecution(format!(
                    "expected SELECT, ASK, CONSTRUCT or DESCRIBE, found {token:?}"
                )))
            }
        }
    }
    Err(KbError::QueryExecution("query has no query form".into()))
}

/// `#` opens a comment only at the start of a token, so IRI fragments survive.
fn strip_comments(text: &str) -> String {
    text.lines()
        .map(|line| {
            let mut prev_ws = true;
            let mut quote: Option<char> = None;
            for (i, c) in line.char_indices() {
                match quote {
                    Some(q) if c == q => quote = None,
                    Some(_) => {}
                    None if c == '"' || c == '\'' => quote = Some(c),
                    None if c == '#' && prev_ws => return &line[..i],
                    None => {}
                }
                prev_ws = c.is_whitespace();
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn check_brackets(text: &str) -> Result<()> {
    let body = strip_comments(text);
    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in body.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' | '(' | '[' => stack.push(c),
            '}' | ')' | ']' => {
                let open = match c {
                    '}' => '{',
                    ')' => '(',
                    _ => '[',
                };
                if stack.pop() != Some(open) {
                    return Err(KbError::QueryExecution(format!("unbalanced {c:?}")));
                }
            }
            _ => {}
        }
    }
    if quote.is_some() {
        return Err(KbError::QueryExecution("unterminated string literal".into()));
    }
    if let Some(open) = stack.pop() {
        return Err(KbError::QueryExecution(format!("unclosed {open:?}")));
    }
    Ok(())
}

/// Text after the last `#`, else after the last `/`.
pub fn local_name(iri: &str) -> &str {
    match iri.rfind('#') {
        Some(i) => &iri[i + 1..],
        None => iri.rsplit('/').next().unwrap_or(iri),
    }
}

/// Runs pattern queries against the knowledge base's current facts.
pub struct QueryGateway {
    engine: Box<dyn PatternEngine>,
}

impl QueryGateway {
    pub fn new(engine: Box<dyn PatternEngine>) -> Self {
        Self { engine }
    }

    /// Run `text` over the asserted facts plus the last derived entailments.
    pub fn run_query(&self, kb: &KnowledgeBase, text: &str) -> Result<Vec<Row>> {
        let query = PatternQuery::parse(text)?;
        let snapshot = kb.query_snapshot()?;
        let started = Instant::now();

        let rows = self.engine.execute(&query, &snapshot).map_err(|e| {
            warn!(error = %e, "pattern query failed");
            KbError::QueryExecution(e.to_string())
        })?;

        let rows: Vec<Row> = rows
            .into_iter()
            .map(|bindings| {
                bindings
                    .into_iter()
                    .map(|(var, value)| {
                        let value = match value {
                            Binding::Iri(iri) => local_name(&iri).to_string(),
                            Binding::Name(s) | Binding::Literal(s) | Binding::Blank(s) => s,
                        };
                        (var, value)
                    })
                    .collect()
            })
            .collect();

        debug!(
            form = ?query.form(),
            rows = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pattern query finished"
        );
        Ok(rows)
    }
}

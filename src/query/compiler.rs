use serde::{Serialize, Deserialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{Collection, SqlValue};
use crate::query::ast::{Combinator, MatchOperator, ParsedClause};
use crate::query::grammar::GrammarMatcher;

/// One predicate fragment with its `?` placeholders and the values bound to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub fragment: String,
    pub params: Vec<SqlValue>,
}

/// Output of the compiler, ready for a prepared statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub collection: Collection,
    pub conditions: Vec<Condition>,
    /// `combinators[i]` joins `conditions[i + 1]` to everything before it.
    pub combinators: Vec<Combinator>,
}

impl CompiledQuery {
    pub fn all_rows(collection: Collection) -> Self {
        CompiledQuery {
            collection,
            conditions: Vec::new(),
            combinators: Vec::new(),
        }
    }

    pub fn collection_name(&self) -> &'static str {
        self.collection.name()
    }

    pub fn params(&self) -> Vec<SqlValue> {
        self.conditions.iter().flat_map(|c| c.params.iter().cloned()).collect()
    }

    /// Render as `SELECT * FROM <collection> [WHERE ...]` plus the flattened
    /// parameter list. Values never appear in the statement text.
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut sql = format!("SELECT * FROM {}", self.collection.name());

        if let Some((first, rest)) = self.conditions.split_first() {
            sql.push_str(" WHERE ");
            sql.push_str(&first.fragment);
            for (combinator, condition) in self.combinators.iter().zip(rest) {
                sql.push(' ');
                sql.push_str(combinator.sql());
                sql.push(' ');
                sql.push_str(&condition.fragment);
            }
        }

        (sql, self.params())
    }
}

/// Turns parsed clauses into parameterized predicates against a collection.
pub struct QueryCompiler {
    matcher: GrammarMatcher,
}

impl QueryCompiler {
    pub fn new() -> Result<Self> {
        Ok(QueryCompiler {
            matcher: GrammarMatcher::new()?,
        })
    }

    pub fn matcher(&self) -> &GrammarMatcher {
        &self.matcher
    }

    /// Parse and compile every clause of `input`.
    pub fn compile(&self, input: &str) -> Result<Vec<CompiledQuery>> {
        let parsed = self.matcher.parse(input).ok_or_else(|| {
            Error::new(ErrorKind::Parse, format!("cannot search with '{}'", input))
        })?;

        parsed.iter().map(|clause| self.compile_clause(clause)).collect()
    }

    pub fn compile_clause(&self, parsed: &ParsedClause) -> Result<CompiledQuery> {
        let clause = &parsed.clause;
        let collection = match &clause.collection_alias {
            Some(alias) => Collection::from_alias(alias).ok_or_else(|| Error::unknown_alias(alias))?,
            None => Collection::DEFAULT_SEARCH,
        };

        let mut conditions = vec![condition(collection, clause.field.as_deref(), clause.operator, &clause.value)?];
        let mut combinators = Vec::with_capacity(parsed.terms.len());

        for term in &parsed.terms {
            // A term without its own combinator continues the previous one.
            let combinator = term
                .combinator
                .or_else(|| combinators.last().copied())
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidInput,
                        format!("search term '{}' has no combinator", term.value),
                    )
                })?;

            conditions.push(condition(collection, term.field.as_deref(), term.operator, &term.value)?);
            combinators.push(combinator);
        }

        Ok(CompiledQuery {
            collection,
            conditions,
            combinators,
        })
    }

    /// Every row of the aliased collection. Filter text is accepted and
    /// ignored; restricted searches have never applied it.
    pub fn compile_restricted(&self, input: &str, alias: &str) -> Result<CompiledQuery> {
        let collection = Collection::from_alias(alias).ok_or_else(|| Error::unknown_alias(alias))?;
        if !input.trim().is_empty() {
            log::debug!("restricted search on {} ignores filter '{}'", collection, input);
        }
        Ok(CompiledQuery::all_rows(collection))
    }
}

fn condition(
    collection: Collection,
    field: Option<&str>,
    operator: MatchOperator,
    value: &str,
) -> Result<Condition> {
    match field {
        Some(field) => {
            if !collection.has_column(field) {
                return Err(Error::unknown_field(collection.name(), field));
            }
            Ok(Condition {
                fragment: format!("{} {} ?", field, operator.sql()),
                params: vec![SqlValue::from(value)],
            })
        }
        None => {
            let fields = collection.default_fields();
            let parts: Vec<String> = fields
                .iter()
                .map(|f| format!("{} {} ?", f, operator.sql()))
                .collect();
            let fragment = if parts.len() == 1 {
                parts.join("")
            } else {
                format!("({})", parts.join(" OR "))
            };
            Ok(Condition {
                fragment,
                params: fields.iter().map(|_| SqlValue::from(value)).collect(),
            })
        }
    }
}

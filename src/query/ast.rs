use std::fmt;
use serde::{Serialize, Deserialize};

/// `:` pattern match or `=` exact match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOperator {
    Fuzzy,
    Exact,
}

impl MatchOperator {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            ":" => Some(MatchOperator::Fuzzy),
            "=" => Some(MatchOperator::Exact),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            MatchOperator::Fuzzy => ':',
            MatchOperator::Exact => '=',
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            MatchOperator::Fuzzy => "REGEXP",
            MatchOperator::Exact => "=",
        }
    }
}

/// Joins a search term to everything on its left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Combinator {
    And,
    Or,
}

impl Combinator {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "&" => Some(Combinator::And),
            "|" => Some(Combinator::Or),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Combinator::And => '&',
            Combinator::Or => '|',
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Combinator::And => "AND",
            Combinator::Or => "OR",
        }
    }
}

impl fmt::Display for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// One top-level search unit: target collection plus leading condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clause {
    pub collection_alias: Option<String>,
    pub collection_modifier: Option<String>,  // Captured, not interpreted
    pub field: Option<String>,
    pub operator: MatchOperator,
    pub value: String,
    pub tail: String,                         // Raw chained terms, re-parsed by the term grammar
}

/// A chained condition inside a clause tail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchTerm {
    pub combinator: Option<Combinator>,  // None only at the start of a chain
    pub field: Option<String>,           // `{}` means the default fields
    pub operator: MatchOperator,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParsedClause {
    pub clause: Clause,
    pub terms: Vec<SearchTerm>,
}

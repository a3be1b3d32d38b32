use regex::{Captures, Regex};
use crate::core::error::Result;
use crate::core::types::Collection;
use crate::query::ast::{Clause, Combinator, MatchOperator, ParsedClause, SearchTerm};

/// `'quoted text'` or one or more bare words
const VALUE: &str = r"'[^']*'|(?:\w+\s*)+";

/// Regex tokenizer for the search mini-language.
///
/// ```text
/// [alias][[modifier]][{field}](:|=) value [ (&|'|') {field}(:|=) value ]*
/// ```
///
/// A parse either consumes the whole input with contiguous matches or fails;
/// no partial clause list ever leaves this type.
pub struct GrammarMatcher {
    clause_pattern: Regex,
    term_pattern: Regex,
}

impl GrammarMatcher {
    pub fn new() -> Result<Self> {
        let clause = format!(
            concat!(
                r"(?:(?P<alias>[A-Za-z_]+)?(?:\[(?P<modifier>\w*)\])?(?:\{{(?P<field>\w+)\}})?\s*(?P<op>[:=])\s*)?",
                r"(?P<value>{value})",
                r"(?P<tail>(?:\s*[|&]\s*\{{\w*\}}\s*[:=]\s*(?:{value})|\s*[|&]\s*)*)",
            ),
            value = VALUE,
        );
        let term = format!(
            concat!(
                r"\s*(?P<comb>[&|])\s*\{{(?P<field>\w*)\}}\s*(?P<op>[:=])\s*(?P<value>{value})",
                r"|\s*(?P<sep>\|)\s*",
            ),
            value = VALUE,
        );

        Ok(GrammarMatcher {
            clause_pattern: Regex::new(&clause)?,
            term_pattern: Regex::new(&term)?,
        })
    }

    /// Parse a raw query. `None` means the input cannot be searched with.
    pub fn parse(&self, input: &str) -> Option<Vec<ParsedClause>> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        let mut parsed = Vec::new();
        for caps in consume_all(&self.clause_pattern, input)? {
            let clause = clause_from(&caps);
            let terms = self.parse_terms(&clause.tail)?;
            parsed.push(ParsedClause { clause, terms });
        }
        Some(parsed)
    }

    /// Parse a clause tail. An empty tail is fully consumed and yields no terms.
    pub fn parse_terms(&self, tail: &str) -> Option<Vec<SearchTerm>> {
        if tail.is_empty() {
            return Some(Vec::new());
        }

        let mut terms = Vec::new();
        for caps in consume_all(&self.term_pattern, tail)? {
            // A bare `|` separates clauses and carries no condition.
            if caps.name("sep").is_some() {
                continue;
            }
            terms.push(SearchTerm {
                combinator: caps.name("comb").and_then(|m| Combinator::from_symbol(m.as_str())),
                field: caps.name("field").map(|m| m.as_str()).filter(|f| !f.is_empty()).map(String::from),
                operator: caps.name("op").and_then(|m| MatchOperator::from_symbol(m.as_str()))?,
                value: unquote(caps.name("value").map_or("", |m| m.as_str())),
            });
        }
        Some(terms)
    }
}

/// Every match of `pattern` in `input`, provided they tile the input exactly.
fn consume_all<'t>(pattern: &Regex, input: &'t str) -> Option<Vec<Captures<'t>>> {
    let mut last_end = 0;
    let mut matches = Vec::new();

    for caps in pattern.captures_iter(input) {
        let whole = caps.get(0)?;
        if whole.start() != last_end || whole.as_str().is_empty() {
            return None;
        }
        last_end = whole.end();
        matches.push(caps);
    }

    if matches.is_empty() || last_end != input.len() {
        return None;
    }
    Some(matches)
}

fn clause_from(caps: &Captures) -> Clause {
    let word = caps.name("alias").map(|m| m.as_str().to_string());
    let collection_modifier = caps.name("modifier").map(|m| m.as_str().to_string());
    let field = caps.name("field").map(|m| m.as_str().to_string());

    // A leading word is an alias when it is one, or when alias syntax follows it.
    // Otherwise it only labels the default fields, as in `name: Tim`.
    let collection_alias = word.filter(|w| {
        Collection::is_alias(w) || collection_modifier.is_some() || field.is_some()
    });

    Clause {
        collection_alias,
        collection_modifier,
        field,
        operator: caps
            .name("op")
            .and_then(|m| MatchOperator::from_symbol(m.as_str()))
            .unwrap_or(MatchOperator::Exact),
        value: unquote(caps.name("value").map_or("", |m| m.as_str())),
        tail: caps.name("tail").map_or("", |m| m.as_str()).to_string(),
    }
}

fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> GrammarMatcher {
        GrammarMatcher::new().unwrap()
    }

    #[test]
    fn bare_label_leaves_alias_empty() {
        let parsed = matcher().parse("name: Tim").unwrap();
        assert_eq!(parsed.len(), 1);
        let clause = &parsed[0].clause;
        assert_eq!(clause.collection_alias, None);
        assert_eq!(clause.field, None);
        assert_eq!(clause.operator, MatchOperator::Fuzzy);
        assert_eq!(clause.value, "Tim");
        assert!(parsed[0].terms.is_empty());
    }

    #[test]
    fn chained_terms_keep_order() {
        let parsed = matcher().parse("name: Tim & {word1}: value1 | {word2}= value2").unwrap();
        assert_eq!(parsed.len(), 1);
        let terms = &parsed[0].terms;
        assert_eq!(terms.len(), 2);
        assert_eq!(
            terms[0],
            SearchTerm {
                combinator: Some(Combinator::And),
                field: Some("word1".to_string()),
                operator: MatchOperator::Fuzzy,
                value: "value1".to_string(),
            }
        );
        assert_eq!(
            terms[1],
            SearchTerm {
                combinator: Some(Combinator::Or),
                field: Some("word2".to_string()),
                operator: MatchOperator::Exact,
                value: "value2".to_string(),
            }
        );
    }

    #[test]
    fn unbalanced_quote_is_rejected() {
        assert_eq!(matcher().parse("name: Tim '"), None);
        assert_eq!(matcher().parse("name: 'Tim"), None);
        assert_eq!(matcher().parse("user{last_name}: Tim & {first_name}: 'Ann"), None);
    }

    #[test]
    fn gaps_are_rejected() {
        assert_eq!(matcher().parse(""), None);
        assert_eq!(matcher().parse("   "), None);
        assert_eq!(matcher().parse("name: Tim &"), None);
        assert_eq!(matcher().parse("name: Tim & word: x"), None);
        assert_eq!(matcher().parse("name: Tim ; drop"), None);
        assert_eq!(matcher().parse("name: Tim & {f}: "), None);
    }

    #[test]
    fn alias_modifier_and_field_are_captured() {
        let parsed = matcher().parse("case[open]{case_notes}= 'court date'").unwrap();
        let clause = &parsed[0].clause;
        assert_eq!(clause.collection_alias.as_deref(), Some("case"));
        assert_eq!(clause.collection_modifier.as_deref(), Some("open"));
        assert_eq!(clause.field.as_deref(), Some("case_notes"));
        assert_eq!(clause.operator, MatchOperator::Exact);
        assert_eq!(clause.value, "court date");
    }

    #[test]
    fn unknown_word_with_alias_syntax_stays_an_alias() {
        let parsed = matcher().parse("files{name}: x").unwrap();
        assert_eq!(parsed[0].clause.collection_alias.as_deref(), Some("files"));
    }

    #[test]
    fn bare_separator_starts_a_new_clause() {
        let parsed = matcher()
            .parse("name: value Tim & {word1}: value1 | {word3}: value3 | case[non]: cat")
            .unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].clause.value, "value Tim");
        assert_eq!(parsed[0].terms.len(), 2);
        assert_eq!(parsed[1].clause.collection_alias.as_deref(), Some("case"));
        assert_eq!(parsed[1].clause.collection_modifier.as_deref(), Some("non"));
        assert_eq!(parsed[1].clause.value, "cat");
        assert!(parsed[1].terms.is_empty());
    }

    #[test]
    fn whitespace_is_insignificant() {
        let tight = matcher().parse("user{last_name}=Tim&{first_name}:Ann").unwrap();
        let loose = matcher().parse("  user{last_name} =  Tim  &  {first_name} :  Ann ").unwrap();
        assert_eq!(tight[0].terms, loose[0].terms);
        assert_eq!(tight[0].clause.value, loose[0].clause.value);
        assert_eq!(tight[0].clause.field, loose[0].clause.field);
    }

    #[test]
    fn quoted_term_values() {
        let parsed = matcher().parse("docu: contract & {document_notes}: 'signed, sealed'").unwrap();
        assert_eq!(parsed[0].terms[0].value, "signed, sealed");
    }

    #[test]
    fn empty_braces_mean_default_fields() {
        let parsed = matcher().parse("user: Tim | {}: Ann").unwrap();
        assert_eq!(parsed[0].terms[0].field, None);
    }

    #[test]
    fn bare_value_without_operator() {
        let parsed = matcher().parse("Tim").unwrap();
        let clause = &parsed[0].clause;
        assert_eq!(clause.collection_alias, None);
        assert_eq!(clause.operator, MatchOperator::Exact);
        assert_eq!(clause.value, "Tim");
    }
}

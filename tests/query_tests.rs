//! Search language tests: grammar consumption rules, clause/term extraction
//! and compilation into parameterized predicates.

use rand::Rng;
use recordkeep::core::error::ErrorKind;
use recordkeep::core::types::{Collection, SqlValue};
use recordkeep::query::ast::{Combinator, MatchOperator};
use recordkeep::query::compiler::QueryCompiler;
use recordkeep::query::grammar::GrammarMatcher;

const VALID_QUERIES: &[&str] = &[
    "name: Tim",
    "Tim",
    "user: Tim",
    "user{last_name}= Meyer",
    "case: Smith & {case_notes}: appeal | {case_nb}= 12",
    "docu[archived]{document_name}: lease",
    "user: Tim | docu: contract",
    "name: value Tim & {first_name}: Ann | {last_name}= Bo | case[non]: cat",
];

// ============================================================================
// Grammar
// ============================================================================

#[test]
fn scenario_single_clause_default_fields() {
    let matcher = GrammarMatcher::new().unwrap();
    let parsed = matcher.parse("name: Tim").unwrap();

    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].clause.collection_alias, None);
    assert_eq!(parsed[0].clause.operator, MatchOperator::Fuzzy);
    assert_eq!(parsed[0].clause.value, "Tim");

    let compiler = QueryCompiler::new().unwrap();
    let compiled = compiler.compile_clause(&parsed[0]).unwrap();
    assert_eq!(compiled.collection, Collection::Persons);
    assert_eq!(compiled.conditions.len(), 1);
    let fields = Collection::Persons.default_fields();
    for field in fields {
        assert!(compiled.conditions[0].fragment.contains(&format!("{} REGEXP ?", field)));
    }
    assert_eq!(compiled.conditions[0].params, vec![SqlValue::from("Tim"); fields.len()]);
}

#[test]
fn scenario_chained_terms() {
    let matcher = GrammarMatcher::new().unwrap();
    let parsed = matcher.parse("name: Tim & {word1}: value1 | {word2}= value2").unwrap();

    assert_eq!(parsed.len(), 1);
    let summary: Vec<_> = parsed[0]
        .terms
        .iter()
        .map(|t| (t.combinator, t.field.as_deref(), t.operator, t.value.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Some(Combinator::And), Some("word1"), MatchOperator::Fuzzy, "value1"),
            (Some(Combinator::Or), Some("word2"), MatchOperator::Exact, "value2"),
        ]
    );
}

#[test]
fn scenario_unbalanced_quote() {
    let matcher = GrammarMatcher::new().unwrap();
    assert!(matcher.parse("name: Tim '").is_none());
    assert!(matcher.parse("user{last_name}= 'Meyer").is_none());
    assert!(matcher.parse("user: Tim & {last_name}= 'Me'yer'").is_none());
}

#[test]
fn valid_queries_are_fully_consumed() {
    let matcher = GrammarMatcher::new().unwrap();
    for query in VALID_QUERIES {
        assert!(matcher.parse(query).is_some(), "{} should parse", query);
    }
}

#[test]
fn any_foreign_character_leaves_a_gap() {
    let matcher = GrammarMatcher::new().unwrap();
    let foreign = [';', '"', '(', ')', '!', '#', ',', '*'];
    let mut rng = rand::thread_rng();

    for query in VALID_QUERIES {
        for _ in 0..25 {
            let chars: Vec<char> = query.chars().collect();
            let at = rng.gen_range(0..=chars.len());
            let junk = foreign[rng.gen_range(0..foreign.len())];
            let mut broken: String = chars[..at].iter().collect();
            broken.push(junk);
            broken.extend(&chars[at..]);

            assert!(matcher.parse(&broken).is_none(), "{:?} should not parse", broken);
        }
    }
}

#[test]
fn clause_separator_yields_independent_clauses() {
    let matcher = GrammarMatcher::new().unwrap();
    let parsed = matcher.parse("user: Tim | docu{document_name}= Lease").unwrap();

    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].clause.collection_alias.as_deref(), Some("user"));
    assert!(parsed[0].terms.is_empty());
    assert_eq!(parsed[1].clause.collection_alias.as_deref(), Some("docu"));
    assert_eq!(parsed[1].clause.field.as_deref(), Some("document_name"));
}

// ============================================================================
// Compiler
// ============================================================================

#[test]
fn compile_is_deterministic() {
    let compiler = QueryCompiler::new().unwrap();
    for query in VALID_QUERIES {
        let first = compiler.compile(query);
        let second = compiler.compile(query);
        match (first, second) {
            (Ok(a), Ok(b)) => assert_eq!(a, b),
            (Err(a), Err(b)) => assert_eq!(a.kind, b.kind),
            _ => panic!("{} compiled differently twice", query),
        }
    }
}

#[test]
fn one_compiled_query_per_clause() {
    let compiler = QueryCompiler::new().unwrap();
    let compiled = compiler.compile("user: Tim | case: Smith | docu: lease").unwrap();

    let collections: Vec<_> = compiled.iter().map(|q| q.collection_name()).collect();
    assert_eq!(collections, vec!["Persons", "Cases", "Documents"]);
}

#[test]
fn combinators_align_with_conditions() {
    let compiler = QueryCompiler::new().unwrap();
    let compiled = compiler
        .compile("user: Tim & {first_name}: Ann | {notes}= x & {gender}= Other")
        .unwrap();

    let query = &compiled[0];
    assert_eq!(query.conditions.len(), 4);
    assert_eq!(query.combinators.len(), query.conditions.len() - 1);
    assert_eq!(query.combinators, vec![Combinator::And, Combinator::Or, Combinator::And]);
}

#[test]
fn statement_text_only_contains_placeholders() {
    let compiler = QueryCompiler::new().unwrap();
    let compiled = compiler.compile("user{notes}: 'Robert; DROP TABLE Persons' & {last_name}= Tables").unwrap();
    let (sql, params) = compiled[0].to_sql();

    assert_eq!(sql, "SELECT * FROM Persons WHERE notes REGEXP ? AND last_name = ?");
    assert_eq!(sql.matches('?').count(), params.len());
    assert_eq!(
        params,
        vec![SqlValue::from("Robert; DROP TABLE Persons"), SqlValue::from("Tables")]
    );
}

#[test]
fn rejections_are_named() {
    let compiler = QueryCompiler::new().unwrap();

    let err = compiler.compile("people{last_name}: Tim").unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownAlias);
    assert!(err.context.contains("people"));

    let err = compiler.compile("docu{last_name}: Tim").unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownField);
    assert!(err.context.contains("last_name"));

    let err = compiler.compile("user: Tim &").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parse);
}

#[test]
fn restricted_compile_returns_whole_collection() {
    let compiler = QueryCompiler::new().unwrap();
    let compiled = compiler.compile_restricted("{document_name}= x", "docu").unwrap();

    assert_eq!(compiled.collection, Collection::Documents);
    assert!(compiled.conditions.is_empty());
    assert_eq!(compiled.to_sql(), ("SELECT * FROM Documents".to_string(), Vec::new()));
}

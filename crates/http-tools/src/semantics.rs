//! Call semantics helpers.
//!
//! REST calls are classified by RFC 9110 method semantics; GraphQL documents are lexed just far
//! enough to find their operation definitions (kind, name, root fields). Neither needs the
//! target schema, so classification can run before any network access.

use reqwest::Method;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodClass {
    /// Safe methods (GET, HEAD, OPTIONS).
    Read,
    /// State-changing methods (POST, PUT, PATCH, DELETE).
    Write,
    /// Extension methods; treated as unsafe.
    Unknown,
}

#[must_use]
pub fn classify_method(method: &Method) -> MethodClass {
    if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
        MethodClass::Read
    } else if method == Method::POST
        || method == Method::PUT
        || method == Method::PATCH
        || method == Method::DELETE
    {
        MethodClass::Write
    } else {
        MethodClass::Unknown
    }
}

/// Whether replaying a request is harmless (used to decide if transport failures may retry).
#[must_use]
pub fn is_idempotent(method: &Method) -> bool {
    // PATCH may or may not be idempotent; do not guess.
    method == Method::GET
        || method == Method::HEAD
        || method == Method::OPTIONS
        || method == Method::PUT
        || method == Method::DELETE
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphqlOperationKind {
    Query,
    Mutation,
    Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphqlOperation {
    pub kind: GraphqlOperationKind,
    pub name: Option<String>,
    /// Top-level selections (aliases resolved to the underlying field name).
    pub root_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok<'a> {
    Name(&'a str),
    Punct(u8),
    Spread,
    Value,
}

fn tokenize(doc: &str) -> Result<Vec<Tok<'_>>, String> {
    let bytes = doc.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' | b'\n' | b'\r' | b',' | 0xEF | 0xBB | 0xBF => i += 1,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'"' => {
                if doc[i..].starts_with("\"\"\"") {
                    let Some(end) = doc[i + 3..].find("\"\"\"") else {
                        return Err("unterminated block string".to_string());
                    };
                    i += 3 + end + 3;
                } else {
                    i += 1;
                    loop {
                        match bytes.get(i) {
                            None | Some(b'\n') => {
                                return Err("unterminated string".to_string());
                            }
                            Some(b'\\') => i += 2,
                            Some(b'"') => {
                                i += 1;
                                break;
                            }
                            Some(_) => i += 1,
                        }
                    }
                }
                out.push(Tok::Value);
            }
            b'.' => {
                if doc[i..].starts_with("...") {
                    out.push(Tok::Spread);
                    i += 3;
                } else {
                    return Err(format!("unexpected '.' at offset {i}"));
                }
            }
            b'{' | b'}' | b'(' | b')' | b'[' | b']' | b':' | b'=' | b'@' | b'$' | b'!' | b'|'
            | b'&' => {
                out.push(Tok::Punct(b));
                i += 1;
            }
            b'-' | b'0'..=b'9' => {
                i += 1;
                while i < bytes.len()
                    && matches!(bytes[i], b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')
                {
                    i += 1;
                }
                out.push(Tok::Value);
            }
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                let start = i;
                while i < bytes.len() && matches!(bytes[i], b'_' | b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9')
                {
                    i += 1;
                }
                out.push(Tok::Name(&doc[start..i]));
            }
            other => return Err(format!("unexpected character '{}'", other as char)),
        }
    }
    Ok(out)
}

/// Parse the operation definitions of a GraphQL document.
///
/// Fragment definitions are skipped. A bare selection set (`{ ... }`) is a query.
///
/// # Errors
///
/// Returns a message if the document cannot be lexed, has unbalanced braces, or contains no
/// operation definition.
pub fn parse_graphql_operations(doc: &str) -> Result<Vec<GraphqlOperation>, String> {
    let toks = tokenize(doc)?;
    let mut ops = Vec::new();
    let mut i = 0usize;

    while i < toks.len() {
        let (kind, is_fragment) = match toks[i] {
            Tok::Name("query") => (GraphqlOperationKind::Query, false),
            Tok::Name("mutation") => (GraphqlOperationKind::Mutation, false),
            Tok::Name("subscription") => (GraphqlOperationKind::Subscription, false),
            Tok::Name("fragment") => (GraphqlOperationKind::Query, true),
            Tok::Punct(b'{') => (GraphqlOperationKind::Query, false),
            other => return Err(format!("unexpected token at top level: {other:?}")),
        };

        let mut name = None;
        if !matches!(toks[i], Tok::Punct(b'{')) {
            i += 1;
            if !is_fragment && let Some(Tok::Name(n)) = toks.get(i) {
                name = Some((*n).to_string());
            }
            // Skip to the selection set (variables, directives, type condition).
            let mut parens = 0usize;
            while let Some(t) = toks.get(i) {
                match t {
                    Tok::Punct(b'(') => parens += 1,
                    Tok::Punct(b')') => parens = parens.saturating_sub(1),
                    Tok::Punct(b'{') if parens == 0 => break,
                    _ => {}
                }
                i += 1;
            }
        }

        if !matches!(toks.get(i), Some(Tok::Punct(b'{'))) {
            return Err("operation without selection set".to_string());
        }

        let (root_fields, next) = read_selection_set(&toks, i)?;
        i = next;
        if !is_fragment {
            ops.push(GraphqlOperation {
                kind,
                name,
                root_fields,
            });
        }
    }

    if ops.is_empty() {
        return Err("document contains no operation".to_string());
    }
    Ok(ops)
}

/// Walk a selection set starting at `toks[start] == '{'`; return the depth-1 field names and the
/// index just past the matching `}`.
fn read_selection_set(toks: &[Tok<'_>], start: usize) -> Result<(Vec<String>, usize), String> {
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut parens = 0usize;
    let mut i = start;
    let mut prev: Option<Tok<'_>> = None;

    while let Some(&t) = toks.get(i) {
        match t {
            Tok::Punct(b'{') if parens == 0 => depth += 1,
            Tok::Punct(b'}') if parens == 0 => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok((fields, i + 1));
                }
            }
            Tok::Punct(b'(') => parens += 1,
            Tok::Punct(b')') => parens = parens.saturating_sub(1),
            Tok::Spread if depth == 1 && parens == 0 => {
                // `...Fragment` or `... on Type`: neither names a root field.
                i += match toks.get(i + 1) {
                    Some(Tok::Name("on")) => 3,
                    Some(Tok::Name(_)) => 2,
                    _ => 1,
                };
                prev = None;
                continue;
            }
            Tok::Name(n) if depth == 1 && parens == 0 => {
                let after_directive = matches!(prev, Some(Tok::Punct(b'@')));
                let is_alias = matches!(toks.get(i + 1), Some(Tok::Punct(b':')));
                if !after_directive && !is_alias {
                    fields.push(n.to_string());
                }
            }
            _ => {}
        }
        prev = Some(t);
        i += 1;
    }

    Err("unbalanced braces in GraphQL document".to_string())
}

/// The most privileged kind across all operations of a document.
#[must_use]
pub fn strongest_kind(ops: &[GraphqlOperation]) -> GraphqlOperationKind {
    let mut kind = GraphqlOperationKind::Query;
    for op in ops {
        match op.kind {
            GraphqlOperationKind::Subscription => return GraphqlOperationKind::Subscription,
            GraphqlOperationKind::Mutation => kind = GraphqlOperationKind::Mutation,
            GraphqlOperationKind::Query => {}
        }
    }
    kind
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_classify_by_safety() {
        assert_eq!(classify_method(&Method::GET), MethodClass::Read);
        assert_eq!(classify_method(&Method::HEAD), MethodClass::Read);
        assert_eq!(classify_method(&Method::DELETE), MethodClass::Write);
        let custom: Method = "PROPFIND".parse().expect("valid method token");
        assert_eq!(classify_method(&custom), MethodClass::Unknown);
        assert!(!is_idempotent(&Method::PATCH));
        assert!(is_idempotent(&Method::PUT));
    }

    #[test]
    fn shorthand_query_lists_root_fields() {
        let ops = parse_graphql_operations("{ characters(page: 2) { results { name } } info }")
            .expect("parse");
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, GraphqlOperationKind::Query);
        assert_eq!(ops[0].root_fields, vec!["characters", "info"]);
    }

    #[test]
    fn named_mutation_with_alias_and_variables() {
        let doc = r#"
            # create things
            mutation AddPet($name: String = "rex") {
              created: createPet(input: { name: $name }) @include(if: true) { id }
            }
        "#;
        let ops = parse_graphql_operations(doc).expect("parse");
        assert_eq!(ops[0].kind, GraphqlOperationKind::Mutation);
        assert_eq!(ops[0].name.as_deref(), Some("AddPet"));
        assert_eq!(ops[0].root_fields, vec!["createPet"]);
    }

    #[test]
    fn fragments_are_skipped_and_strongest_kind_wins() {
        let doc = "query A { me { ...F } } fragment F on User { id } mutation B { logout }";
        let ops = parse_graphql_operations(doc).expect("parse");
        assert_eq!(ops.len(), 2);
        assert_eq!(strongest_kind(&ops), GraphqlOperationKind::Mutation);
    }

    #[test]
    fn keyword_inside_string_is_not_an_operation() {
        let ops = parse_graphql_operations(r#"{ search(q: "mutation { x }") { id } }"#)
            .expect("parse");
        assert_eq!(strongest_kind(&ops), GraphqlOperationKind::Query);
        assert_eq!(ops[0].root_fields, vec!["search"]);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(parse_graphql_operations("").is_err());
        assert!(parse_graphql_operations("query { a { b }").is_err());
        assert!(parse_graphql_operations("query { a(x: \"open) }").is_err());
    }
}

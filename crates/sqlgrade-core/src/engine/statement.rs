//! Lexical gate applied to candidate SQL before it reaches a sandbox.
//!
//! The gate only has to be sound for the two decisions it makes (one
//! statement, read-only leading verb); the sandbox connection is also
//! `query_only`, so anything slipping past here still cannot write.

use crate::errors::ExecutionError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Semicolon,
    LParen,
    RParen,
    Other,
}

/// Tokens paired with the byte offset just past their last character.
fn lex(sql: &str) -> Result<Vec<(Token, usize)>, ExecutionError> {
    let indexed: Vec<(usize, char)> = sql.char_indices().collect();
    let chars: Vec<char> = indexed.iter().map(|(_, c)| *c).collect();
    let byte_at = |i: usize| indexed.get(i).map(|(b, _)| *b).unwrap_or(sql.len());
    let mut out = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                loop {
                    if i + 1 >= chars.len() {
                        // SQLite accepts an unterminated block comment at end of input.
                        i = chars.len();
                        break;
                    }
                    if chars[i] == '*' && chars[i + 1] == '/' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            }
            '\'' | '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err(ExecutionError::Syntax("unterminated quoted text".into()));
                    }
                    if chars[i] == close {
                        // Doubled quote is an escaped quote, except inside [..].
                        if close != ']' && chars.get(i + 1) == Some(&close) {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                out.push((Token::Other, byte_at(i)));
            }
            ';' => {
                i += 1;
                out.push((Token::Semicolon, byte_at(i)));
            }
            '(' => {
                i += 1;
                out.push((Token::LParen, byte_at(i)));
            }
            ')' => {
                i += 1;
                out.push((Token::RParen, byte_at(i)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let w: String = chars[start..i].iter().collect();
                out.push((Token::Word(w.to_ascii_uppercase()), byte_at(i)));
            }
            _ => {
                i += 1;
                out.push((Token::Other, byte_at(i)));
            }
        }
    }
    Ok(out)
}

const DML: &[&str] = &["INSERT", "UPDATE", "DELETE", "REPLACE"];

/// Statement verbs the engine accepts other than queries.
const NON_QUERY_VERBS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "REPLACE", "CREATE", "DROP", "ALTER", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM", "REINDEX", "ANALYZE", "BEGIN", "COMMIT", "END", "ROLLBACK",
    "SAVEPOINT", "RELEASE", "EXPLAIN",
];

/// Checks that `sql` is exactly one read-only query and returns the statement
/// text, cut after its last token so trailing semicolons and comments are dropped.
pub fn inspect(sql: &str) -> Result<String, ExecutionError> {
    let lexed = lex(sql)?;
    let tokens: Vec<&Token> = lexed.iter().map(|(t, _)| t).collect();
    if tokens.iter().all(|t| **t == Token::Semicolon) {
        return Err(ExecutionError::Empty);
    }

    // Only trailing semicolons are permitted.
    let first_semi = tokens.iter().position(|t| **t == Token::Semicolon);
    if let Some(pos) = first_semi {
        if tokens[pos..].iter().any(|t| **t != Token::Semicolon) {
            return Err(ExecutionError::MultiStatementRejected);
        }
    }
    let body_len = first_semi.unwrap_or(tokens.len());
    if body_len == 0 {
        return Err(ExecutionError::Empty);
    }
    let body = &tokens[..body_len];

    let leading = body.iter().find_map(|t| match t {
        Token::LParen => None,
        Token::Word(w) => Some(Some(w.as_str())),
        _ => Some(None),
    });
    match leading.flatten() {
        Some("SELECT") | Some("VALUES") => {}
        Some("WITH") => check_with_body(body)?,
        Some(verb) if NON_QUERY_VERBS.contains(&verb) => {
            return Err(ExecutionError::DisallowedStatement {
                keyword: verb.to_string(),
            })
        }
        // Anything else is not a statement at all; the engine reports it as a syntax error.
        _ => {}
    }

    let end = lexed[body_len - 1].1;
    Ok(sql[..end].trim().to_string())
}

/// After the CTE list, the main statement verb sits at paren depth 0.
fn check_with_body(body: &[&Token]) -> Result<(), ExecutionError> {
    let mut depth = 0i32;
    for t in body {
        match *t {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            Token::Word(w) if depth == 0 => {
                if w == "SELECT" || w == "VALUES" {
                    return Ok(());
                }
                if DML.contains(&w.as_str()) {
                    return Err(ExecutionError::DisallowedStatement { keyword: w.clone() });
                }
            }
            _ => {}
        }
    }
    Err(ExecutionError::Syntax("WITH clause has no main query".into()))
}

//! Textual validation of externally supplied SQL.
//!
//! Rules run in a fixed order and the first failure wins:
//!
//! 1. exactly one statement (a single trailing `;` is allowed)
//! 2. the leading keyword, after any `WITH ...` prefix, is `SELECT`
//! 3. no denylisted keyword appears anywhere as a bare word
//!
//! This is the first of two safeguards; execution also happens on a
//! read-only connection.

use super::lexer::{tokenize, Token};
use super::{RejectRule, Rejection};

/// Mutating or administrative keywords that may not appear in a query.
pub const DENYLIST: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "ATTACH", "PRAGMA", "VACUUM", "REPLACE",
    "CREATE",
];

/// Check `sql` and return its tokens when it is acceptable.
pub fn validate(sql: &str) -> Result<Vec<Token>, Rejection> {
    let mut tokens =
        tokenize(sql).map_err(|e| Rejection::new(RejectRule::Syntax, e.to_string()))?;

    while tokens.last() == Some(&Token::Semicolon) {
        tokens.pop();
    }
    if tokens.is_empty() {
        return Err(Rejection::new(RejectRule::Empty, "query is empty"));
    }
    if tokens.contains(&Token::Semicolon) {
        return Err(Rejection::new(
            RejectRule::MultipleStatements,
            "only a single statement is allowed",
        ));
    }

    let leading = leading_keyword(&tokens)?;
    if leading != "SELECT" {
        return Err(Rejection::new(
            RejectRule::NotSelect,
            format!("statement must be a SELECT, found {leading}"),
        ));
    }

    if let Some(word) = tokens.iter().find_map(|t| match t {
        Token::Word(w) if DENYLIST.contains(&w.as_str()) => Some(w),
        _ => None,
    }) {
        return Err(Rejection::new(
            RejectRule::ForbiddenKeyword,
            format!("keyword {word} is not allowed"),
        ));
    }

    Ok(tokens)
}

/// The statement keyword after skipping a common-table-expression prefix.
fn leading_keyword(tokens: &[Token]) -> Result<String, Rejection> {
    let malformed = || Rejection::new(RejectRule::NotSelect, "malformed WITH clause");
    let mut pos = 0;

    if tokens[0].is_word("WITH") {
        pos = 1;
        if tokens.get(pos).is_some_and(|t| t.is_word("RECURSIVE")) {
            pos += 1;
        }

        loop {
            // name [(columns)] AS [[NOT] MATERIALIZED] (subquery)
            match tokens.get(pos) {
                Some(Token::Word(_)) | Some(Token::QuotedIdent(_)) => pos += 1,
                _ => return Err(malformed()),
            }
            if tokens.get(pos) == Some(&Token::LParen) {
                pos = skip_parens(tokens, pos).ok_or_else(malformed)?;
            }
            if !tokens.get(pos).is_some_and(|t| t.is_word("AS")) {
                return Err(malformed());
            }
            pos += 1;
            if tokens.get(pos).is_some_and(|t| t.is_word("NOT")) {
                pos += 1;
            }
            if tokens.get(pos).is_some_and(|t| t.is_word("MATERIALIZED")) {
                pos += 1;
            }
            if tokens.get(pos) != Some(&Token::LParen) {
                return Err(malformed());
            }
            pos = skip_parens(tokens, pos).ok_or_else(malformed)?;

            if tokens.get(pos) == Some(&Token::Comma) {
                pos += 1;
            } else {
                break;
            }
        }
    }

    match tokens.get(pos) {
        Some(Token::Word(word)) => Ok(word.clone()),
        Some(other) => Ok(format!("{other:?}")),
        None => Err(malformed()),
    }
}

/// Given `tokens[open] == LParen`, return the index after its matching `)`.
fn skip_parens(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(sql: &str) -> Option<RejectRule> {
        validate(sql).err().map(|r| r.rule)
    }

    #[test]
    fn test_accepts_plain_select() {
        assert_eq!(rule("SELECT * FROM sessions"), None);
        assert_eq!(rule("  select id from sessions;  "), None);
        assert_eq!(rule("SELECT 'drop table x' AS note"), None);
        assert_eq!(rule("SELECT \"update\" FROM t"), None);
    }

    #[test]
    fn test_accepts_cte() {
        assert_eq!(rule("WITH x AS (SELECT 1) SELECT * FROM x"), None);
        assert_eq!(
            rule("WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 5), \
                  m AS MATERIALIZED (SELECT 2) SELECT * FROM n, m"),
            None
        );
    }

    #[test]
    fn test_rejects_multiple_statements() {
        assert_eq!(
            rule("SELECT 1; DROP TABLE sessions;"),
            Some(RejectRule::MultipleStatements)
        );
        assert_eq!(rule("SELECT 1;;SELECT 2"), Some(RejectRule::MultipleStatements));
    }

    #[test]
    fn test_rejects_non_select() {
        assert_eq!(rule("DELETE FROM sessions"), Some(RejectRule::NotSelect));
        assert_eq!(rule("VALUES (1)"), Some(RejectRule::NotSelect));
        assert_eq!(
            rule("WITH x AS (SELECT 1) DELETE FROM sessions"),
            Some(RejectRule::NotSelect)
        );
        assert_eq!(rule("WITH x AS SELECT 1"), Some(RejectRule::NotSelect));
    }

    #[test]
    fn test_rejects_denylisted_keywords() {
        assert_eq!(
            rule("SELECT replace(display_name, 'a', 'b') FROM applications"),
            Some(RejectRule::ForbiddenKeyword)
        );
        assert_eq!(
            rule("select * from sessions where id in (select 1) and exists (select 1 from x) union select 1 from y where 0 = (create)"),
            Some(RejectRule::ForbiddenKeyword)
        );
        // Table-valued pragma functions are one word, not the PRAGMA keyword
        assert_eq!(rule("SELECT name FROM pragma_table_info('sessions')"), None);
        assert_eq!(
            rule("WITH d AS (DELETE FROM sessions RETURNING *) SELECT * FROM d"),
            Some(RejectRule::ForbiddenKeyword)
        );
    }

    #[test]
    fn test_rejects_empty_and_unlexable() {
        assert_eq!(rule(""), Some(RejectRule::Empty));
        assert_eq!(rule(" ; "), Some(RejectRule::Empty));
        assert_eq!(rule("-- only a comment"), Some(RejectRule::Empty));
        assert_eq!(rule("SELECT 'open"), Some(RejectRule::Syntax));
    }
}

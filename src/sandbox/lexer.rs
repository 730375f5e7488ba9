//! A small SQL tokenizer.
//!
//! Only as much of SQLite's lexical grammar as validation needs: words,
//! literals, quoted identifiers, punctuation and comments. String literals
//! and quoted identifiers become single tokens, so keywords inside them are
//! never mistaken for statements.

/// One lexical token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bare keyword or identifier, upper-cased
    Word(String),
    /// `"ident"`, `` `ident` `` or `[ident]`, contents only
    QuotedIdent(String),
    /// `'text'` with `''` unescaped
    Str(String),
    Number(String),
    /// `?`, `?1`, `:name`, `@name`, `$name`
    Param(String),
    LParen,
    RParen,
    Comma,
    Semicolon,
    /// Any other operator or punctuation
    Symbol(char),
}

impl Token {
    /// Whether this is the bare word `kw` (case-insensitive).
    pub fn is_word(&self, kw: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(kw))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    UnterminatedString,
    UnterminatedIdentifier,
    UnterminatedComment,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LexError::UnterminatedString => write!(f, "unterminated string literal"),
            LexError::UnterminatedIdentifier => write!(f, "unterminated quoted identifier"),
            LexError::UnterminatedComment => write!(f, "unterminated block comment"),
        }
    }
}

impl std::error::Error for LexError {}

/// Split `sql` into tokens, dropping whitespace and comments.
pub fn tokenize(sql: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
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
                let mut j = i + 2;
                loop {
                    if j + 1 >= chars.len() {
                        return Err(LexError::UnterminatedComment);
                    }
                    if chars[j] == '*' && chars[j + 1] == '/' {
                        break;
                    }
                    j += 1;
                }
                i = j + 2;
            }
            '\'' => {
                let (text, next) = quoted(&chars, i, '\'').ok_or(LexError::UnterminatedString)?;
                tokens.push(Token::Str(text));
                i = next;
            }
            '"' | '`' => {
                let (text, next) =
                    quoted(&chars, i, c).ok_or(LexError::UnterminatedIdentifier)?;
                tokens.push(Token::QuotedIdent(text));
                i = next;
            }
            '[' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == ']')
                    .ok_or(LexError::UnterminatedIdentifier)?;
                tokens.push(Token::QuotedIdent(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '?' | ':' | '@' | '$' => {
                let start = i;
                i += 1;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                if i - start == 1 && c != '?' {
                    tokens.push(Token::Symbol(c));
                } else {
                    tokens.push(Token::Param(chars[start..i].iter().collect()));
                }
            }
            c if c.is_ascii_digit()
                || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) =>
            {
                let start = i;
                while i < chars.len() && (is_word_char(chars[i]) || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if is_word_char(c) => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Word(word.to_ascii_uppercase()));
            }
            other => {
                tokens.push(Token::Symbol(other));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Read a quoted run starting at `start`; a doubled quote is an escaped quote.
fn quoted(chars: &[char], start: usize, quote: char) -> Option<(String, usize)> {
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                text.push(quote);
                i += 2;
                continue;
            }
            return Some((text, i + 1));
        }
        text.push(chars[i]);
        i += 1;
    }
    None
}

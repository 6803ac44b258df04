use crate::operators::OperatorKind;
use crate::span::Position;

use super::ParseError;

/// Kind of a lexical token.
///
/// Trivia (whitespace, comments, non-logical line breaks, backslash
/// continuations) is kept as tokens so the tree can be serialized back to the
/// exact input text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    Str,
    Punct,

    /// A punctuation or keyword token that the parser resolved to a mutable
    /// operator. `not in` / `is not` are a single token.
    Operator(OperatorKind),

    /// End of a logical line.
    Newline,

    Whitespace,
    Comment,

    /// Line break inside brackets or on a blank/comment-only line.
    LineBreak,

    /// Backslash followed by a line break.
    Continuation,
}

impl TokenKind {
    pub fn is_trivia(self) -> bool {
        matches!(
            self,
            TokenKind::Whitespace
                | TokenKind::Comment
                | TokenKind::LineBreak
                | TokenKind::Continuation
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub pos: Position,
}

impl Token {
    pub fn is_punct(&self, p: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == p
    }

    pub fn is_keyword(&self, kw: &str) -> bool {
        self.kind == TokenKind::Name && self.text == kw
    }
}

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Hard keywords. Soft keywords (`match`, `case`, `type`, `_`) are names.
pub fn is_keyword(text: &str) -> bool {
    KEYWORDS.contains(&text)
}

/// Longest spellings first so `**=` is not lexed as `**` followed by `=`.
const PUNCTUATION: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "**", "//", "<<", ">>", "<=", ">=", "==", "!=",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "@", "&", "|",
    "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ";", ".", "=",
];

pub const AUGMENTED_ASSIGNMENTS: &[&str] = &[
    "+=", "-=", "*=", "/=", "//=", "%=", "**=", ">>=", "<<=", "&=", "|=", "^=", "@=",
];

const STRING_PREFIXES: &[&str] = &[
    "r", "u", "b", "f", "t", "br", "rb", "fr", "rf", "tr", "rt",
];

/// Split Python source into tokens, trivia included.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    Lexer::new(source).run()
}

const UNTERMINATED: &str = "unterminated string literal";

/// Strings nested inside f-string replacement fields, `f"{f'{x}'}"`.
const MAX_FSTRING_NESTING: usize = 32;

fn is_formatted(prefix: &[u8]) -> bool {
    prefix.iter().any(|b| matches!(b, b'f' | b'F' | b't' | b'T'))
}

/// Scan the string literal whose prefix starts at `start` and return the
/// offset just past its closing quote.
///
/// Replacement fields of f-strings are scanned as code, so they may hold
/// quotes of their own (`f"{d["k"]}"`). Only ASCII bytes are compared;
/// continuation bytes of multi-byte characters never match them.
fn scan_string(
    bytes: &[u8],
    start: usize,
    prefix_len: usize,
    nesting: usize,
) -> Result<usize, &'static str> {
    let prefix = &bytes[start..start + prefix_len];
    let formatted = is_formatted(prefix);
    let raw = prefix.iter().any(|b| matches!(b, b'r' | b'R'));

    let open = start + prefix_len;
    let quote = bytes[open];
    let triple = bytes[open..].starts_with(&[quote, quote, quote]);
    let delim = &bytes[open..open + if triple { 3 } else { 1 }];

    let mut i = open + delim.len();
    loop {
        let Some(&b) = bytes.get(i) else {
            return Err(UNTERMINATED);
        };

        match b {
            // `\N{EM DASH}` is an escape, not a replacement field.
            b'\\' if formatted && !raw && bytes[i + 1..].starts_with(b"N{") => {
                let Some(close) = bytes[i..].iter().position(|&c| c == b'}') else {
                    return Err(UNTERMINATED);
                };
                i += close + 1;
            }
            b'\\' if formatted && bytes.get(i + 1) == Some(&b'{') => i += 1,
            b'\\' => i += if bytes[i + 1..].starts_with(b"\r\n") { 3 } else { 2 },
            b'\n' | b'\r' if !triple => return Err(UNTERMINATED),
            _ if bytes[i..].starts_with(delim) => return Ok(i + delim.len()),
            b'{' if formatted && bytes.get(i + 1) == Some(&b'{') => i += 2,
            b'{' if formatted => i = scan_field(bytes, i + 1, delim, triple, nesting)?,
            _ => i += 1,
        }
    }
}

/// Scan a replacement field from just after its `{` and return the offset
/// just past the matching `}`.
fn scan_field(
    bytes: &[u8],
    mut i: usize,
    delim: &[u8],
    triple: bool,
    nesting: usize,
) -> Result<usize, &'static str> {
    if nesting >= MAX_FSTRING_NESTING {
        return Err("f-string is nested too deeply");
    }

    let mut brackets = 0usize;
    loop {
        let Some(&b) = bytes.get(i) else {
            return Err(UNTERMINATED);
        };

        match b {
            b'\'' | b'"' => i = scan_string(bytes, i, 0, nesting + 1)?,
            b'#' => {
                i += bytes[i..]
                    .iter()
                    .position(|&c| c == b'\n' || c == b'\r')
                    .unwrap_or(bytes.len() - i);
            }
            b'(' | b'[' | b'{' => {
                brackets += 1;
                i += 1;
            }
            b'}' if brackets == 0 => return Ok(i + 1),
            b')' | b']' | b'}' => {
                brackets = brackets.saturating_sub(1);
                i += 1;
            }
            b':' if brackets == 0 => {
                return scan_format_spec(bytes, i + 1, delim, triple, nesting);
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let len = bytes[i..]
                    .iter()
                    .position(|&c| !(c == b'_' || c.is_ascii_alphanumeric()))
                    .unwrap_or(bytes.len() - i);
                let ident = &bytes[i..i + len];
                let quoted = matches!(bytes.get(i + len), Some(b'\'' | b'"'));
                let is_prefix = STRING_PREFIXES
                    .iter()
                    .any(|p| p.as_bytes().eq_ignore_ascii_case(ident));

                i = if quoted && is_prefix {
                    scan_string(bytes, i, len, nesting + 1)?
                } else {
                    i + len
                };
            }
            _ => i += 1,
        }
    }
}

/// Format spec after a field's top-level `:`; literal text with nested
/// fields such as `{x:>{width}}`.
fn scan_format_spec(
    bytes: &[u8],
    mut i: usize,
    delim: &[u8],
    triple: bool,
    nesting: usize,
) -> Result<usize, &'static str> {
    loop {
        let Some(&b) = bytes.get(i) else {
            return Err(UNTERMINATED);
        };

        match b {
            b'{' => i = scan_field(bytes, i + 1, delim, triple, nesting + 1)?,
            b'}' => return Ok(i + 1),
            b'\\' => i += 2,
            b'\n' | b'\r' if !triple => return Err(UNTERMINATED),
            _ if bytes[i..].starts_with(delim) => return Err("f-string: expecting '}'"),
            _ => i += 1,
        }
    }
}

struct Lexer<'a> {
    src: &'a str,
    offset: usize,
    pos: Position,
    brackets: Vec<(char, Position)>,
    line_has_content: bool,
    tokens: Vec<Token>,
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn is_inline_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\x0c' | '\u{feff}')
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            offset: 0,
            pos: Position::start(),
            brackets: Vec::new(),
            line_has_content: false,
            tokens: Vec::new(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.offset..]
    }

    fn push(&mut self, kind: TokenKind, len: usize) {
        let text = &self.src[self.offset..self.offset + len];

        if !kind.is_trivia() && kind != TokenKind::Newline {
            self.line_has_content = true;
        }

        self.tokens.push(Token {
            kind,
            text: text.to_string(),
            pos: self.pos,
        });

        self.pos = self.pos.advance(text);
        self.offset += len;
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.pos, message)
    }

    fn run(mut self) -> Result<Vec<Token>, ParseError> {
        while let Some(ch) = self.rest().chars().next() {
            let rest = self.rest();

            match ch {
                c if is_inline_space(c) => {
                    let len = rest.find(|c| !is_inline_space(c)).unwrap_or(rest.len());
                    self.push(TokenKind::Whitespace, len);
                }
                '#' => {
                    let len = rest.find(['\r', '\n']).unwrap_or(rest.len());
                    self.push(TokenKind::Comment, len);
                }
                '\r' | '\n' => {
                    let len = if rest.starts_with("\r\n") { 2 } else { 1 };
                    let kind = if self.brackets.is_empty() && self.line_has_content {
                        self.line_has_content = false;
                        TokenKind::Newline
                    } else {
                        TokenKind::LineBreak
                    };
                    self.push(kind, len);
                }
                '\\' => {
                    let after = &rest[1..];
                    let len = if after.starts_with("\r\n") {
                        3
                    } else if after.starts_with(['\n', '\r']) {
                        2
                    } else if after.is_empty() {
                        return Err(self.error("unexpected end of file after line continuation"));
                    } else {
                        return Err(self.error("unexpected character after line continuation"));
                    };
                    self.push(TokenKind::Continuation, len);
                }
                '"' | '\'' => self.lex_string(0)?,
                c if c.is_ascii_digit() => self.lex_number(),
                '.' if rest[1..].starts_with(|c: char| c.is_ascii_digit()) => self.lex_number(),
                c if is_ident_start(c) => self.lex_name()?,
                _ => self.lex_punct(ch)?,
            }
        }

        if let Some((open, pos)) = self.brackets.last() {
            return Err(ParseError::new(*pos, format!("'{open}' was never closed")));
        }

        Ok(self.tokens)
    }

    fn lex_name(&mut self) -> Result<(), ParseError> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !is_ident_continue(c))
            .unwrap_or(rest.len());

        let ident = &rest[..len];
        let quoted = rest[len..].starts_with(['"', '\'']);

        if quoted && STRING_PREFIXES.contains(&ident.to_ascii_lowercase().as_str()) {
            return self.lex_string(len);
        }

        self.push(TokenKind::Name, len);
        Ok(())
    }

    /// Lex a string literal whose opening quote sits `prefix_len` bytes in.
    fn lex_string(&mut self, prefix_len: usize) -> Result<(), ParseError> {
        let len = scan_string(self.rest().as_bytes(), 0, prefix_len, 0)
            .map_err(|msg| self.error(msg))?;
        self.push(TokenKind::Str, len);
        Ok(())
    }

    fn lex_number(&mut self) {
        let bytes = self.rest().as_bytes();
        let digit = |b: u8| b.is_ascii_digit() || b == b'_';
        let mut i = 0;

        if bytes.len() >= 2 && bytes[0] == b'0' && matches!(bytes[1], b'x' | b'X' | b'o' | b'O' | b'b' | b'B') {
            i = 2;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
        } else {
            while i < bytes.len() && digit(bytes[i]) {
                i += 1;
            }
            if i < bytes.len() && bytes[i] == b'.' {
                i += 1;
                while i < bytes.len() && digit(bytes[i]) {
                    i += 1;
                }
            }
            if i < bytes.len() && matches!(bytes[i], b'e' | b'E') {
                let mut j = i + 1;
                if j < bytes.len() && matches!(bytes[j], b'+' | b'-') {
                    j += 1;
                }
                if j < bytes.len() && bytes[j].is_ascii_digit() {
                    i = j;
                    while i < bytes.len() && digit(bytes[i]) {
                        i += 1;
                    }
                }
            }
            if i < bytes.len() && matches!(bytes[i], b'j' | b'J') {
                i += 1;
            }
        }

        self.push(TokenKind::Number, i);
    }

    fn lex_punct(&mut self, ch: char) -> Result<(), ParseError> {
        let rest = self.rest();
        let Some(p) = PUNCTUATION.iter().find(|p| rest.starts_with(**p)) else {
            return Err(self.error(format!("unexpected character {ch:?}")));
        };

        match *p {
            "(" | "[" | "{" => self.brackets.push((ch, self.pos)),
            ")" | "]" | "}" => {
                let expected = match *p {
                    ")" => '(',
                    "]" => '[',
                    _ => '{',
                };
                match self.brackets.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, _)) => {
                        return Err(self.error(format!(
                            "closing '{p}' does not match opening '{open}'"
                        )));
                    }
                    None => return Err(self.error(format!("unmatched '{p}'"))),
                }
            }
            _ => {}
        }

        self.push(TokenKind::Punct, p.len());
        Ok(())
    }
}

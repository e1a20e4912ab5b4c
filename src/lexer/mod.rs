//! Lexer/Tokenizer for Dhad
//!
//! Uses the `logos` crate for lexical analysis. Keywords and punctuation
//! are matched against their Arabic surface forms as exact UTF-8 byte
//! sequences; no normalization or case folding is applied.

use logos::Logos;
use std::fmt;
use thiserror::Error;

/// Byte range of a token in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// Source location for diagnostics. `line` and `column` count Unicode
/// scalar values starting at 1; `offset` is a byte index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
    pub offset: usize,
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Token with its span and position
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
    pub pos: Pos,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("LexError: unrecognized character '{ch}' at {pos}")]
    UnrecognizedChar { ch: char, pos: Pos },

    #[error("LexError: integer literal out of range at {pos}")]
    IntegerOverflow { pos: Pos },
}

/// All tokens in the Dhad language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
pub enum Token {
    // === Keywords ===
    #[token("متغير")]
    Var,
    #[token("اذا")]
    If,
    #[token("والا")]
    Else,
    #[token("بينما")]
    While,
    #[token("دالة")]
    Func,
    #[token("ارجع")]
    Return,
    #[token("اطبع")]
    Print,

    // === Operators ===
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("==")]
    Eq,
    #[token("!=")]
    Neq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("=")]
    Assign,

    // === Delimiters ===
    // The Arabic semicolon (U+061B) and comma (U+060C) are the canonical
    // forms; the ASCII forms are accepted as well.
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("؛")]
    #[token(";")]
    Semi,
    #[token("،")]
    #[token(",")]
    Comma,

    // === Literals ===
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Number(i64),

    // === Identifiers ===
    // First scalar: ASCII letter, underscore, or a letter from the Arabic
    // block (U+0600-U+06FF) or Arabic Supplement (U+0750-U+077F), minus the
    // punctuation marks U+060C, U+061B, U+061F. Later scalars also allow
    // ASCII digits.
    #[regex(r"[A-Za-z_\u{0600}-\u{060B}\u{060D}-\u{061A}\u{061C}-\u{061E}\u{0620}-\u{06FF}\u{0750}-\u{077F}][A-Za-z0-9_\u{0600}-\u{060B}\u{060D}-\u{061A}\u{061C}-\u{061E}\u{0620}-\u{06FF}\u{0750}-\u{077F}]*", |lex| lex.slice().to_string())]
    Ident(String),

    // === Special ===
    // Appended by `tokenize`; never produced by the scanner itself.
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Var => write!(f, "متغير"),
            Token::If => write!(f, "اذا"),
            Token::Else => write!(f, "والا"),
            Token::While => write!(f, "بينما"),
            Token::Func => write!(f, "دالة"),
            Token::Return => write!(f, "ارجع"),
            Token::Print => write!(f, "اطبع"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Eq => write!(f, "=="),
            Token::Neq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::Assign => write!(f, "="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Semi => write!(f, "؛"),
            Token::Comma => write!(f, "،"),
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// Incremental byte-offset to line/column translation. Offsets must be
/// queried in increasing order and must fall on character boundaries.
struct PosTracker<'a> {
    source: &'a str,
    offset: usize,
    line: u32,
    column: u32,
}

impl<'a> PosTracker<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            offset: 0,
            line: 1,
            column: 1,
        }
    }

    fn pos_at(&mut self, offset: usize) -> Pos {
        for ch in self.source[self.offset..offset].chars() {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        self.offset = offset;
        Pos {
            line: self.line,
            column: self.column,
            offset,
        }
    }
}

/// Tokenize source code into a vector of spanned tokens terminated by a
/// single `Eof`. The first unrecognized scalar aborts the scan; no partial
/// stream is returned.
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut tracker = PosTracker::new(source);

    while let Some(result) = lexer.next() {
        let span = Span::new(lexer.span().start, lexer.span().end);
        let pos = tracker.pos_at(span.start);
        match result {
            Ok(token) => tokens.push(SpannedToken { token, span, pos }),
            Err(()) => {
                // A run of digits only errors when the literal overflows
                // i64; anything else is an unrecognized scalar.
                let ch = source[span.start..].chars().next().unwrap_or('\0');
                if ch.is_ascii_digit() {
                    return Err(LexError::IntegerOverflow { pos });
                }
                return Err(LexError::UnrecognizedChar { ch, pos });
            }
        }
    }

    let end = tracker.pos_at(source.len());
    tokens.push(SpannedToken {
        token: Token::Eof,
        span: Span::new(source.len(), source.len()),
        pos: end,
    });

    Ok(tokens)
}

//! Lexer for the script language.
//!
//! Tokens inside a line come from a logos-generated scanner. Line structure
//! (NEWLINE, INDENT, DEDENT) is layered on top by [`tokenize`], which
//! tracks the indentation stack and bracket depth the way Python's
//! tokenizer does: lines inside open brackets are joined, blank and
//! comment-only lines are ignored.

use std::fmt;
use std::rc::Rc;

use logos::Logos;

use crate::error::SyntaxError;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\f]+")]
enum RawToken {
    #[regex(r"#[^\n]*", logos::skip)]
    Comment,

    // Keywords
    #[token("def")]
    Def,
    #[token("return")]
    Return,
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("pass")]
    Pass,
    #[token("try")]
    Try,
    #[token("except")]
    Except,
    #[token("finally")]
    Finally,
    #[token("raise")]
    Raise,
    #[token("global")]
    Global,
    #[token("as")]
    As,
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,
    #[token("is")]
    Is,
    #[token("True")]
    True,
    #[token("False")]
    False,
    #[token("None")]
    None,

    // Literals
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_owned())]
    Name(String),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    #[regex(r"0[xX][0-9a-fA-F]+", |lex| i64::from_str_radix(&lex.slice()[2..], 16).ok())]
    #[regex(r"0[oO][0-7]+", |lex| i64::from_str_radix(&lex.slice()[2..], 8).ok())]
    #[regex(r"0[bB][01]+", |lex| i64::from_str_radix(&lex.slice()[2..], 2).ok())]
    Int(i64),

    #[regex(r"[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(strip_quotes(lex.slice())))]
    #[regex(r"'([^'\\\n]|\\.)*'", |lex| unescape(strip_quotes(lex.slice())))]
    Str(String),

    #[regex(r#"b"([^"\\\n]|\\.)*""#, |lex| unescape_bytes(strip_quotes(&lex.slice()[1..])))]
    #[regex(r"b'([^'\\\n]|\\.)*'", |lex| unescape_bytes(strip_quotes(&lex.slice()[1..])))]
    Bytes(Vec<u8>),

    // Operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    StarStar,
    #[token("/")]
    Slash,
    #[token("//")]
    SlashSlash,
    #[token("%")]
    Percent,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("=")]
    Assign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("//=")]
    SlashSlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("&=")]
    AmpAssign,
    #[token("|=")]
    PipeAssign,
    #[token("^=")]
    CaretAssign,
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,

    // Delimiters
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,
    #[token(".")]
    Dot,
}

fn strip_quotes(s: &str) -> &str {
    &s[1..s.len() - 1]
}

fn unescape(s: &str) -> Option<String> {
    let bytes = unescape_bytes(s)?;
    String::from_utf8(bytes).ok()
}

fn unescape_bytes(s: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next()? {
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            '0' => out.push(0),
            '\\' => out.push(b'\\'),
            '\'' => out.push(b'\''),
            '"' => out.push(b'"'),
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                out.push(u8::from_str_radix(&hex, 16).ok()?);
            }
            _ => return None,
        }
    }
    Some(out)
}

/// A token of the script language.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Def,
    Return,
    If,
    Elif,
    Else,
    While,
    Break,
    Continue,
    Pass,
    Try,
    Except,
    Finally,
    Raise,
    Global,
    As,
    And,
    Or,
    Not,
    Is,
    True,
    False,
    None,

    Name(Rc<str>),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),

    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    Shl,
    Shr,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    NotEq,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    SlashSlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,

    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semicolon,
    Dot,

    Newline,
    Indent,
    Dedent,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Name(name) => write!(f, "name '{}'", name),
            Token::Int(_) | Token::Float(_) => write!(f, "number"),
            Token::Str(_) | Token::Bytes(_) => write!(f, "string"),
            Token::Newline => write!(f, "newline"),
            Token::Indent => write!(f, "indent"),
            Token::Dedent => write!(f, "dedent"),
            Token::Eof => write!(f, "end of input"),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<RawToken> for Token {
    fn from(raw: RawToken) -> Self {
        match raw {
            RawToken::Comment => Token::Newline,
            RawToken::Def => Token::Def,
            RawToken::Return => Token::Return,
            RawToken::If => Token::If,
            RawToken::Elif => Token::Elif,
            RawToken::Else => Token::Else,
            RawToken::While => Token::While,
            RawToken::Break => Token::Break,
            RawToken::Continue => Token::Continue,
            RawToken::Pass => Token::Pass,
            RawToken::Try => Token::Try,
            RawToken::Except => Token::Except,
            RawToken::Finally => Token::Finally,
            RawToken::Raise => Token::Raise,
            RawToken::Global => Token::Global,
            RawToken::As => Token::As,
            RawToken::And => Token::And,
            RawToken::Or => Token::Or,
            RawToken::Not => Token::Not,
            RawToken::Is => Token::Is,
            RawToken::True => Token::True,
            RawToken::False => Token::False,
            RawToken::None => Token::None,
            RawToken::Name(s) => Token::Name(s.into()),
            RawToken::Int(i) => Token::Int(i),
            RawToken::Float(x) => Token::Float(x),
            RawToken::Str(s) => Token::Str(s.into()),
            RawToken::Bytes(b) => Token::Bytes(b.into()),
            RawToken::Plus => Token::Plus,
            RawToken::Minus => Token::Minus,
            RawToken::Star => Token::Star,
            RawToken::StarStar => Token::StarStar,
            RawToken::Slash => Token::Slash,
            RawToken::SlashSlash => Token::SlashSlash,
            RawToken::Percent => Token::Percent,
            RawToken::Shl => Token::Shl,
            RawToken::Shr => Token::Shr,
            RawToken::Amp => Token::Amp,
            RawToken::Pipe => Token::Pipe,
            RawToken::Caret => Token::Caret,
            RawToken::Tilde => Token::Tilde,
            RawToken::Lt => Token::Lt,
            RawToken::Gt => Token::Gt,
            RawToken::Le => Token::Le,
            RawToken::Ge => Token::Ge,
            RawToken::EqEq => Token::EqEq,
            RawToken::NotEq => Token::NotEq,
            RawToken::Assign => Token::Assign,
            RawToken::PlusAssign => Token::PlusAssign,
            RawToken::MinusAssign => Token::MinusAssign,
            RawToken::StarAssign => Token::StarAssign,
            RawToken::SlashAssign => Token::SlashAssign,
            RawToken::SlashSlashAssign => Token::SlashSlashAssign,
            RawToken::PercentAssign => Token::PercentAssign,
            RawToken::AmpAssign => Token::AmpAssign,
            RawToken::PipeAssign => Token::PipeAssign,
            RawToken::CaretAssign => Token::CaretAssign,
            RawToken::ShlAssign => Token::ShlAssign,
            RawToken::ShrAssign => Token::ShrAssign,
            RawToken::LParen => Token::LParen,
            RawToken::RParen => Token::RParen,
            RawToken::LBracket => Token::LBracket,
            RawToken::RBracket => Token::RBracket,
            RawToken::Comma => Token::Comma,
            RawToken::Colon => Token::Colon,
            RawToken::Semicolon => Token::Semicolon,
            RawToken::Dot => Token::Dot,
        }
    }
}

/// A token with the line it started on.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
}

fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for c in line.chars() {
        match c {
            ' ' => width += 1,
            '\t' => width = (width / 8 + 1) * 8,
            _ => break,
        }
    }
    width
}

/// Converts source text into a token stream ending in [`Token::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut indents = vec![0usize];
    let mut depth = 0usize;
    let mut last_line = 1;

    for (index, text) in source.lines().enumerate() {
        let line = index as u32 + 1;
        last_line = line;

        if depth == 0 {
            let content = text.trim_start_matches([' ', '\t']);
            if content.is_empty() || content.starts_with('#') {
                continue;
            }
            let width = indent_width(text);
            let top = indents.last().copied().unwrap_or(0);
            if width > top {
                indents.push(width);
                tokens.push(Spanned { token: Token::Indent, line });
            } else {
                while width < indents.last().copied().unwrap_or(0) {
                    indents.pop();
                    tokens.push(Spanned { token: Token::Dedent, line });
                }
                if width != indents.last().copied().unwrap_or(0) {
                    return Err(SyntaxError::new(line, "unindent doesn't match any outer indent level"));
                }
            }
        }

        let mut scanner = RawToken::lexer(text);
        while let Some(raw) = scanner.next() {
            let raw = raw.map_err(|_| SyntaxError::new(line, "invalid syntax"))?;
            match raw {
                RawToken::LParen | RawToken::LBracket => depth += 1,
                RawToken::RParen | RawToken::RBracket => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| SyntaxError::new(line, "unmatched closing bracket"))?;
                }
                _ => {}
            }
            tokens.push(Spanned { token: raw.into(), line });
        }

        let ends_line = !matches!(
            tokens.last(),
            Option::None | Some(Spanned { token: Token::Newline, .. })
        );
        if depth == 0 && ends_line {
            tokens.push(Spanned { token: Token::Newline, line });
        }
    }

    if depth > 0 {
        return Err(SyntaxError::new(last_line, "unexpected end of input"));
    }
    while indents.len() > 1 {
        indents.pop();
        tokens.push(Spanned { token: Token::Dedent, line: last_line });
    }
    tokens.push(Spanned { token: Token::Eof, line: last_line });
    Ok(tokens)
}

fn starts_with_word(input: &str, word: &str) -> bool {
    input
        .strip_prefix(word)
        .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_'))
}

/// Whether interactive input should keep reading lines before running
/// `input`: an unclosed bracket or quote, a trailing backslash, or a
/// compound statement not yet ended by a blank line.
pub fn needs_more_input(input: &str) -> bool {
    if input.is_empty() {
        return false;
    }
    let compound = ["if", "while", "def", "try", "class", "for", "with"]
        .iter()
        .any(|kw| starts_with_word(input, kw))
        || input.starts_with('@');

    let mut depth = 0i32;
    let mut quote: Option<char> = Option::None;
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' {
                    chars.next();
                } else if c == q {
                    quote = Option::None;
                }
            }
            Option::None => match c {
                '\'' | '"' => quote = Some(c),
                '#' => {
                    while chars.peek().is_some_and(|&n| n != '\n') {
                        chars.next();
                    }
                }
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            },
        }
    }

    if depth > 0 || quote.is_some() || input.ends_with('\\') {
        return true;
    }
    compound && !input.ends_with('\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn test_simple_statement() {
        assert_eq!(
            kinds("x = 1 + 2.5"),
            vec![
                Token::Name("x".into()),
                Token::Assign,
                Token::Int(1),
                Token::Plus,
                Token::Float(2.5),
                Token::Newline,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_indentation() {
        let toks = kinds("if x:\n    y\nz\n");
        assert_eq!(
            toks,
            vec![
                Token::If,
                Token::Name("x".into()),
                Token::Colon,
                Token::Newline,
                Token::Indent,
                Token::Name("y".into()),
                Token::Newline,
                Token::Dedent,
                Token::Name("z".into()),
                Token::Newline,
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_brackets_join_lines() {
        let toks = kinds("f(1,\n  2)\n");
        assert_eq!(toks.iter().filter(|t| **t == Token::Newline).count(), 1);
        assert!(!toks.contains(&Token::Indent));
    }

    #[test]
    fn test_literals() {
        assert_eq!(kinds("0x1f")[0], Token::Int(31));
        assert_eq!(kinds("0b101")[0], Token::Int(5));
        assert_eq!(kinds("'a\\nb'")[0], Token::Str("a\nb".into()));
        assert_eq!(kinds("b'\\x00hi'")[0], Token::Bytes(vec![0, b'h', b'i'].into()));
        assert_eq!(kinds("# only a comment\nx")[0], Token::Name("x".into()));
    }

    #[test]
    fn test_keyword_prefix_is_name() {
        assert_eq!(kinds("define")[0], Token::Name("define".into()));
        assert_eq!(kinds("if_")[0], Token::Name("if_".into()));
    }

    #[test]
    fn test_bad_dedent() {
        let err = tokenize("if x:\n    y\n  z\n").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_needs_more_input() {
        assert!(needs_more_input("def f():"));
        assert!(needs_more_input("def f():\n  return 1"));
        assert!(!needs_more_input("def f():\n  return 1\n"));
        assert!(needs_more_input("print(1,"));
        assert!(needs_more_input("s = 'abc"));
        assert!(!needs_more_input("x = 1"));
        assert!(!needs_more_input("iffy = 1"));
    }
}

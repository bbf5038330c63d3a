//! Lexer for Tokudae source.
//!
//! Pulls bytes from the chunk, producing one token of lookahead for the
//! parser. Every identifier and short string literal is interned through
//! the state's string pool; long (bracketed) strings stay heap-resident.
//! Numeric literals are classified integer-vs-float by `str2num`, with
//! overflow and range detection.

use std::collections::HashMap;
use std::rc::Rc;

use once_cell::unsync::Lazy;

use crate::errors::SyntaxError;
use crate::state::State;
use crate::value::TStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    // Keywords
    And,
    Break,
    Case,
    Class,
    Continue,
    Default,
    Do,
    Elif,
    Else,
    False,
    Final,
    Fn,
    For,
    If,
    Import,
    In,
    Inherits,
    Local,
    Loop,
    Nil,
    Not,
    Or,
    Return,
    SelfKw,
    Super,
    Switch,
    True,
    While,

    // Literals
    Int(i64),
    Flt(f64),
    Str(TStr),
    Name(TStr),

    // Symbols
    Plus,
    Minus,
    Star,
    DblStar,
    Slash,
    DblSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Concat,
    Dots,
    Dot,
    Comma,
    Semi,
    Colon,
    Question,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Assign,
    Eof,
}

impl Tok {
    /// Human-readable rendering for error messages.
    pub fn describe(&self) -> String {
        let s = match self {
            Tok::And => "and",
            Tok::Break => "break",
            Tok::Case => "case",
            Tok::Class => "class",
            Tok::Continue => "continue",
            Tok::Default => "default",
            Tok::Do => "do",
            Tok::Elif => "elif",
            Tok::Else => "else",
            Tok::False => "false",
            Tok::Final => "final",
            Tok::Fn => "fn",
            Tok::For => "for",
            Tok::If => "if",
            Tok::Import => "import",
            Tok::In => "in",
            Tok::Inherits => "inherits",
            Tok::Local => "local",
            Tok::Loop => "loop",
            Tok::Nil => "nil",
            Tok::Not => "not",
            Tok::Or => "or",
            Tok::Return => "return",
            Tok::SelfKw => "self",
            Tok::Super => "super",
            Tok::Switch => "switch",
            Tok::True => "true",
            Tok::While => "while",
            Tok::Int(i) => return format!("'{}'", i),
            Tok::Flt(n) => return format!("'{}'", n),
            Tok::Str(_) => return "string".to_string(),
            Tok::Name(n) => return format!("'{}'", n),
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::DblStar => "**",
            Tok::Slash => "/",
            Tok::DblSlash => "//",
            Tok::Percent => "%",
            Tok::EqEq => "==",
            Tok::NotEq => "!=",
            Tok::Lt => "<",
            Tok::Le => "<=",
            Tok::Gt => ">",
            Tok::Ge => ">=",
            Tok::Shl => "<<",
            Tok::Shr => ">>",
            Tok::Amp => "&",
            Tok::Pipe => "|",
            Tok::Caret => "^",
            Tok::Tilde => "~",
            Tok::Bang => "!",
            Tok::Concat => "..",
            Tok::Dots => "...",
            Tok::Dot => ".",
            Tok::Comma => ",",
            Tok::Semi => ";",
            Tok::Colon => ":",
            Tok::Question => "?",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::LBrace => "{",
            Tok::RBrace => "}",
            Tok::Assign => "=",
            Tok::Eof => return "<eof>".to_string(),
        };
        format!("'{}'", s)
    }
}

thread_local! {
    static KEYWORDS: Lazy<HashMap<&'static str, Tok>> = Lazy::new(|| {
    HashMap::from([
        ("and", Tok::And),
        ("break", Tok::Break),
        ("case", Tok::Case),
        ("class", Tok::Class),
        ("continue", Tok::Continue),
        ("default", Tok::Default),
        ("do", Tok::Do),
        ("elif", Tok::Elif),
        ("else", Tok::Else),
        ("false", Tok::False),
        ("final", Tok::Final),
        ("fn", Tok::Fn),
        ("for", Tok::For),
        ("if", Tok::If),
        ("import", Tok::Import),
        ("in", Tok::In),
        ("inherits", Tok::Inherits),
        ("local", Tok::Local),
        ("loop", Tok::Loop),
        ("nil", Tok::Nil),
        ("not", Tok::Not),
        ("or", Tok::Or),
        ("return", Tok::Return),
        ("self", Tok::SelfKw),
        ("super", Tok::Super),
        ("switch", Tok::Switch),
        ("true", Tok::True),
        ("while", Tok::While),
    ])
    });
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
    pub span: (usize, usize),
}

pub struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
    /// Line at the scanner position.
    pub line: u32,
    /// Line of the last consumed token; code emitted while parsing a
    /// construct is attributed to this line.
    pub lastline: u32,
    pub chunk: Rc<str>,
    /// Current token.
    pub t: Token,
    ahead: Option<Token>,
    pub st: &'s mut State,
}

type Res<T> = Result<T, SyntaxError>;

impl<'s> Lexer<'s> {
    pub fn new(st: &'s mut State, src: &'s [u8], chunk: &str) -> Lexer<'s> {
        Lexer {
            src,
            pos: 0,
            line: 1,
            lastline: 1,
            chunk: Rc::from(chunk),
            t: Token { tok: Tok::Eof, line: 1, span: (0, 0) },
            ahead: None,
            st,
        }
    }

    pub fn error(&self, msg: impl Into<String>) -> SyntaxError {
        self.error_at(self.line, msg)
    }

    pub fn error_at(&self, line: u32, msg: impl Into<String>) -> SyntaxError {
        SyntaxError {
            chunk: self.chunk.to_string(),
            line,
            span: Some((self.pos.min(self.src.len()), self.pos.min(self.src.len()))),
            msg: msg.into(),
        }
    }

    // -----------------------------------------------------------------------
    // Character source
    // -----------------------------------------------------------------------

    fn cur(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.src.get(self.pos + n).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.cur()?;
        self.pos += 1;
        Some(c)
    }

    /// Consume a newline, handling \r\n and \n\r pairs as one line end.
    fn newline(&mut self) {
        let first = self.bump();
        if let (Some(a), Some(b)) = (first, self.cur()) {
            if (b == b'\n' || b == b'\r') && b != a {
                self.pos += 1;
            }
        }
        self.line += 1;
    }

    // -----------------------------------------------------------------------
    // Token interface
    // -----------------------------------------------------------------------

    /// Advance to the next token.
    pub fn next(&mut self) -> Res<()> {
        self.lastline = self.t.line;
        self.t = match self.ahead.take() {
            Some(tk) => tk,
            None => self.scan()?,
        };
        Ok(())
    }

    /// One token of lookahead.
    pub fn peek(&mut self) -> Res<&Tok> {
        if self.ahead.is_none() {
            let tk = self.scan()?;
            self.ahead = Some(tk);
        }
        Ok(&self.ahead.as_ref().unwrap().tok)
    }

    fn skip_space(&mut self) -> Res<()> {
        loop {
            match self.cur() {
                Some(b'\n') | Some(b'\r') => self.newline(),
                Some(b' ') | Some(b'\t') | Some(0x0b) | Some(0x0c) => {
                    self.pos += 1;
                }
                Some(b'#') => {
                    // Line comment (also covers a leading shebang).
                    while let Some(c) = self.cur() {
                        if c == b'\n' || c == b'\r' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let open_line = self.line;
                    self.pos += 2;
                    loop {
                        match self.cur() {
                            None => {
                                return Err(self
                                    .error_at(open_line, "unterminated block comment"))
                            }
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(b'\n') | Some(b'\r') => self.newline(),
                            _ => self.pos += 1,
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan(&mut self) -> Res<Token> {
        self.skip_space()?;
        let line = self.line;
        let start = self.pos;
        let tok = self.scan_tok()?;
        Ok(Token { tok, line, span: (start, self.pos) })
    }

    fn scan_tok(&mut self) -> Res<Tok> {
        let c = match self.cur() {
            None => return Ok(Tok::Eof),
            Some(c) => c,
        };
        if c.is_ascii_digit() {
            return self.read_number();
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            return Ok(self.read_ident());
        }
        self.pos += 1;
        match c {
            b'"' | b'\'' => self.read_short_string(c),
            b'+' => Ok(Tok::Plus),
            b'-' => Ok(Tok::Minus),
            b'*' => Ok(self.if_next(b'*', Tok::DblStar, Tok::Star)),
            b'/' => Ok(self.if_next(b'/', Tok::DblSlash, Tok::Slash)),
            b'%' => Ok(Tok::Percent),
            b'=' => Ok(self.if_next(b'=', Tok::EqEq, Tok::Assign)),
            b'!' => Ok(self.if_next(b'=', Tok::NotEq, Tok::Bang)),
            b'<' => {
                if self.cur() == Some(b'=') {
                    self.pos += 1;
                    Ok(Tok::Le)
                } else if self.cur() == Some(b'<') {
                    self.pos += 1;
                    Ok(Tok::Shl)
                } else {
                    Ok(Tok::Lt)
                }
            }
            b'>' => {
                if self.cur() == Some(b'=') {
                    self.pos += 1;
                    Ok(Tok::Ge)
                } else if self.cur() == Some(b'>') {
                    self.pos += 1;
                    Ok(Tok::Shr)
                } else {
                    Ok(Tok::Gt)
                }
            }
            b'&' => Ok(Tok::Amp),
            b'|' => Ok(Tok::Pipe),
            b'^' => Ok(Tok::Caret),
            b'~' => Ok(Tok::Tilde),
            b'.' => {
                if self.cur() == Some(b'.') {
                    self.pos += 1;
                    if self.cur() == Some(b'.') {
                        self.pos += 1;
                        Ok(Tok::Dots)
                    } else {
                        Ok(Tok::Concat)
                    }
                } else {
                    Ok(Tok::Dot)
                }
            }
            b',' => Ok(Tok::Comma),
            b';' => Ok(Tok::Semi),
            b':' => Ok(Tok::Colon),
            b'?' => Ok(Tok::Question),
            b'(' => Ok(Tok::LParen),
            b')' => Ok(Tok::RParen),
            b'[' => {
                // `[[` and `[=*[` open a long string.
                if self.cur() == Some(b'[') || self.cur() == Some(b'=') {
                    let mark = self.pos;
                    let mut level = 0usize;
                    while self.cur() == Some(b'=') {
                        level += 1;
                        self.pos += 1;
                    }
                    if self.cur() == Some(b'[') {
                        self.pos += 1;
                        return self.read_long_string(level);
                    }
                    self.pos = mark;
                }
                Ok(Tok::LBracket)
            }
            b']' => Ok(Tok::RBracket),
            b'{' => Ok(Tok::LBrace),
            b'}' => Ok(Tok::RBrace),
            _ => {
                if c.is_ascii() {
                    Err(self.error(format!("unexpected symbol near '{}'", c as char)))
                } else {
                    Err(self.error("invalid byte in source (source must be UTF-8 text)"))
                }
            }
        }
    }

    fn if_next(&mut self, want: u8, then: Tok, other: Tok) -> Tok {
        if self.cur() == Some(want) {
            self.pos += 1;
            then
        } else {
            other
        }
    }

    fn read_ident(&mut self) -> Tok {
        let start = self.pos;
        while let Some(c) = self.cur() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        // Identifier bytes are ASCII by construction.
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        if let Some(kw) = KEYWORDS.with(|k| k.get(text).cloned()) {
            kw
        } else {
            Tok::Name(self.st.strings.intern(text))
        }
    }

    // -----------------------------------------------------------------------
    // Numbers
    // -----------------------------------------------------------------------

    /// `str2num`: the host's integer-vs-float classification. Decimal
    /// integers that overflow reclassify as floats; hex and binary
    /// integers wrap modulo 2^64.
    fn read_number(&mut self) -> Res<Tok> {
        let start = self.pos;
        if self.cur() == Some(b'0')
            && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
        {
            self.pos += 2;
            return self.read_radix_int(16, start);
        }
        if self.cur() == Some(b'0')
            && matches!(self.peek_at(1), Some(b'b') | Some(b'B'))
        {
            self.pos += 2;
            return self.read_radix_int(2, start);
        }
        let mut is_float = false;
        while let Some(c) = self.cur() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == b'.'
                && !is_float
                && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())
            {
                is_float = true;
                self.pos += 1;
            } else if (c == b'e' || c == b'E')
                && self
                    .peek_at(1)
                    .is_some_and(|d| d.is_ascii_digit() || d == b'+' || d == b'-')
            {
                is_float = true;
                self.pos += 1; // exponent marker
                self.pos += 1; // sign or first digit
                while self.cur().is_some_and(|d| d.is_ascii_digit()) {
                    self.pos += 1;
                }
                break;
            } else {
                break;
            }
        }
        if self.cur().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
            return Err(self.error("malformed number"));
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        if is_float {
            let n: f64 = text.parse().map_err(|_| self.error("malformed number"))?;
            Ok(Tok::Flt(n))
        } else {
            match text.parse::<i64>() {
                Ok(i) => Ok(Tok::Int(i)),
                // Out of integer range: fall back to a float.
                Err(_) => {
                    let n: f64 =
                        text.parse().map_err(|_| self.error("malformed number"))?;
                    Ok(Tok::Flt(n))
                }
            }
        }
    }

    fn read_radix_int(&mut self, radix: u32, start: usize) -> Res<Tok> {
        let mut acc: u64 = 0;
        let mut any = false;
        while let Some(c) = self.cur() {
            let d = match (c as char).to_digit(radix) {
                Some(d) => d,
                None => break,
            };
            acc = acc.wrapping_mul(radix as u64).wrapping_add(d as u64);
            any = true;
            self.pos += 1;
        }
        if !any || self.cur().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_') {
            self.pos = start;
            return Err(self.error("malformed number"));
        }
        Ok(Tok::Int(acc as i64))
    }

    // -----------------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------------

    fn finish_string(&mut self, bytes: Vec<u8>, open_line: u32) -> Res<Tok> {
        match String::from_utf8(bytes) {
            Ok(s) => Ok(Tok::Str(self.st.strings.intern(&s))),
            Err(_) => Err(self.error_at(open_line, "string literal is not valid UTF-8")),
        }
    }

    fn read_short_string(&mut self, quote: u8) -> Res<Tok> {
        let open_line = self.line;
        let mut out: Vec<u8> = Vec::new();
        loop {
            let c = match self.cur() {
                None => return Err(self.error_at(open_line, "unterminated string")),
                Some(c) => c,
            };
            match c {
                b'\n' | b'\r' => {
                    return Err(self.error_at(open_line, "unterminated string"))
                }
                _ if c == quote => {
                    self.pos += 1;
                    break;
                }
                b'\\' => {
                    self.pos += 1;
                    self.read_escape(&mut out)?;
                }
                _ => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        self.finish_string(out, open_line)
    }

    fn read_escape(&mut self, out: &mut Vec<u8>) -> Res<()> {
        let c = match self.cur() {
            None => return Err(self.error("unterminated string")),
            Some(c) => c,
        };
        match c {
            b'a' => out.push(7),
            b'b' => out.push(8),
            b'f' => out.push(12),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(11),
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'\n' | b'\r' => {
                self.newline();
                out.push(b'\n');
                return Ok(());
            }
            b'x' => {
                self.pos += 1;
                let mut v: u32 = 0;
                for _ in 0..2 {
                    let d = self
                        .cur()
                        .and_then(|c| (c as char).to_digit(16))
                        .ok_or_else(|| self.error("hexadecimal digit expected"))?;
                    v = v * 16 + d;
                    self.pos += 1;
                }
                out.push(v as u8);
                return Ok(());
            }
            b'u' => {
                self.pos += 1;
                if self.cur() != Some(b'{') {
                    return Err(self.error("missing '{' in \\u{xxxx}"));
                }
                self.pos += 1;
                let mut v: u32 = 0;
                let mut any = false;
                while let Some(d) = self.cur().and_then(|c| (c as char).to_digit(16)) {
                    v = v
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(d))
                        .ok_or_else(|| self.error("UTF-8 value too large"))?;
                    any = true;
                    self.pos += 1;
                }
                if !any {
                    return Err(self.error("hexadecimal digit expected"));
                }
                if self.cur() != Some(b'}') {
                    return Err(self.error("missing '}' in \\u{xxxx}"));
                }
                self.pos += 1;
                let ch = char::from_u32(v)
                    .ok_or_else(|| self.error("UTF-8 value too large"))?;
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                return Ok(());
            }
            b'0'..=b'9' => {
                let mut v: u32 = 0;
                for _ in 0..3 {
                    match self.cur() {
                        Some(d) if d.is_ascii_digit() => {
                            v = v * 10 + (d - b'0') as u32;
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                if v > 255 {
                    return Err(self.error("decimal escape too large"));
                }
                out.push(v as u8);
                return Ok(());
            }
            _ => return Err(self.error("invalid escape sequence")),
        }
        self.pos += 1;
        Ok(())
    }

    fn read_long_string(&mut self, level: usize) -> Res<Tok> {
        let open_line = self.line;
        // A newline right after the opening bracket is not part of the
        // string.
        if matches!(self.cur(), Some(b'\n') | Some(b'\r')) {
            self.newline();
        }
        let mut out: Vec<u8> = Vec::new();
        loop {
            match self.cur() {
                None => {
                    return Err(
                        self.error_at(open_line, "unterminated long string")
                    )
                }
                Some(b']') => {
                    let mark = self.pos;
                    self.pos += 1;
                    let mut eq = 0usize;
                    while self.cur() == Some(b'=') {
                        eq += 1;
                        self.pos += 1;
                    }
                    if eq == level && self.cur() == Some(b']') {
                        self.pos += 1;
                        break;
                    }
                    self.pos = mark;
                    out.push(b']');
                    self.pos += 1;
                }
                Some(b'\n') | Some(b'\r') => {
                    self.newline();
                    out.push(b'\n');
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        self.finish_string(out, open_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        let mut st = State::new();
        let mut lx = Lexer::new(&mut st, src.as_bytes(), "test");
        let mut out = Vec::new();
        loop {
            lx.next().expect("lex should succeed");
            if lx.t.tok == Tok::Eof {
                break;
            }
            out.push(lx.t.tok.clone());
        }
        out
    }

    fn lex_err(src: &str) -> SyntaxError {
        let mut st = State::new();
        let mut lx = Lexer::new(&mut st, src.as_bytes(), "test");
        loop {
            match lx.next() {
                Err(e) => return e,
                Ok(()) if lx.t.tok == Tok::Eof => panic!("expected a lex error"),
                Ok(()) => {}
            }
        }
    }

    #[test]
    fn keywords_and_names() {
        assert_eq!(
            toks("local final fn class x"),
            vec![
                Tok::Local,
                Tok::Final,
                Tok::Fn,
                Tok::Class,
                Tok::Name(TStr(Rc::from("x"))),
            ]
        );
    }

    #[test]
    fn numbers_classify() {
        assert_eq!(toks("42"), vec![Tok::Int(42)]);
        assert_eq!(toks("2.5"), vec![Tok::Flt(2.5)]);
        assert_eq!(toks("1e3"), vec![Tok::Flt(1000.0)]);
        assert_eq!(toks("0xff"), vec![Tok::Int(255)]);
        assert_eq!(toks("0b101"), vec![Tok::Int(5)]);
        // Decimal overflow reclassifies as float.
        assert!(matches!(toks("99999999999999999999")[0], Tok::Flt(_)));
        // Hex wraps modulo 2^64.
        assert_eq!(toks("0xffffffffffffffff"), vec![Tok::Int(-1)]);
    }

    #[test]
    fn int_concat_does_not_eat_dots() {
        assert_eq!(
            toks("1..2"),
            vec![Tok::Int(1), Tok::Concat, Tok::Int(2)]
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            toks("// / ** * << <= < != ! ... .. ."),
            vec![
                Tok::DblSlash,
                Tok::Slash,
                Tok::DblStar,
                Tok::Star,
                Tok::Shl,
                Tok::Le,
                Tok::Lt,
                Tok::NotEq,
                Tok::Bang,
                Tok::Dots,
                Tok::Concat,
                Tok::Dot,
            ]
        );
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(toks(r#""a\tb""#), vec![Tok::Str(TStr(Rc::from("a\tb")))]);
        assert_eq!(toks(r#"'\x41\66\u{1F600}'"#).len(), 1);
        match &toks(r#"'\x41\66'"#)[0] {
            Tok::Str(s) => assert_eq!(s.as_str(), "AB"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn long_strings() {
        match &toks("[[line1\nline2]]")[0] {
            Tok::Str(s) => assert_eq!(s.as_str(), "line1\nline2"),
            other => panic!("expected string, got {:?}", other),
        }
        // Leading newline is skipped; padded brackets nest.
        match &toks("[=[\nhas ]] inside]=]")[0] {
            Tok::Str(s) => assert_eq!(s.as_str(), "has ]] inside"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn comments_and_lines() {
        let mut st = State::new();
        let src = "# comment\nx /* multi\nline */ y";
        let mut lx = Lexer::new(&mut st, src.as_bytes(), "test");
        lx.next().unwrap();
        assert_eq!(lx.t.line, 2);
        lx.next().unwrap();
        assert_eq!(lx.t.line, 3);
    }

    #[test]
    fn lexer_errors() {
        assert!(lex_err("\"unterminated").msg.contains("unterminated"));
        assert!(lex_err("'bad \\q'").msg.contains("invalid escape"));
        assert!(lex_err("0x").msg.contains("malformed number"));
        assert!(lex_err("1abc").msg.contains("malformed number"));
        assert!(lex_err("'\\300'").msg.contains("decimal escape too large"));
        // A \xHH sequence must still leave the literal valid UTF-8.
        assert!(lex_err(r#"'\xff'"#).msg.contains("UTF-8"));
    }

    #[test]
    fn interning_unifies_short_literals() {
        let mut st = State::new();
        let src = "foo foo 'foo'";
        let mut lx = Lexer::new(&mut st, src.as_bytes(), "test");
        lx.next().unwrap();
        let a = match &lx.t.tok {
            Tok::Name(s) => s.clone(),
            _ => unreachable!(),
        };
        lx.next().unwrap();
        let b = match &lx.t.tok {
            Tok::Name(s) => s.clone(),
            _ => unreachable!(),
        };
        lx.next().unwrap();
        let c = match &lx.t.tok {
            Tok::Str(s) => s.clone(),
            _ => unreachable!(),
        };
        assert!(Rc::ptr_eq(&a.0, &b.0));
        assert!(Rc::ptr_eq(&a.0, &c.0));
    }
}

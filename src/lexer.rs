//! Single-pass UTF-8 scanner (§4.2). Produces one [`Lexeme`] per call to
//! [`Lexer::next`], tracking byte position, line, and column for every one.
//!
//! The lexer has two states: NORMAL and string-interpolation. `'` toggles
//! into interpolation; inside it, literal text segments alternate with
//! `${...}` code blocks. The parser owns brace-depth tracking for a code
//! block and must call [`Lexer::end_code_segment`] when it consumes the `}`
//! that closes one, since only the parser knows when a nested `{` inside
//! the block has been matched.

use std::fmt;

use crate::ast::Span;
use crate::error::SourceError;
use crate::value::{Duration, Size};

/// A scanned token together with its payload, if any.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    // comparison
    Match,
    NotMatch,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // logic
    AndAnd,
    OrOr,
    Bang,
    // compound assignment
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    Assign,
    // punctuation
    Semicolon,
    Colon,
    Comma,
    Dot,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    // keywords
    Sub,
    Call,
    Return,
    New,
    Set,
    Unset,
    Vcl,
    Acl,
    If,
    Declare,
    Elif,
    Elsif,
    Elseif,
    Else,
    For,
    Break,
    Continue,
    Import,
    Include,
    Global,
    // literals
    Int(i32),
    Real(f64),
    Str(String),
    True,
    False,
    Null,
    Size(Size),
    Duration(Duration),
    Var(String),
    // string interpolation
    Segment(String),
    InterpStart,
    InterpEnd,
    CodeStart,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A token plus the span of source it was scanned from.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexeme {
    pub token: Token,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    Interpolation { code_segment: bool },
}

/// Requests the extended-variable scanning rule (`-` is a valid identifier
/// character), used by the parser for header-like attribute names such as
/// `req.http.X-Forwarded-For`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarMode {
    Normal,
    Extended,
}

pub struct Lexer<'s> {
    source: &'s [u8],
    source_index: u32,
    pos: usize,
    line: u32,
    column: u32,
    state: State,
}

fn is_symbol_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn is_symbol_init_char(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_extended_var_char(c: u8) -> bool {
    is_symbol_char(c) || c == b'-'
}

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str, source_index: u32) -> Self {
        Lexer { source: source.as_bytes(), source_index, pos: 0, line: 1, column: 1, state: State::Normal }
    }

    fn byte(&self, offset: usize) -> u8 {
        self.source.get(self.pos + offset).copied().unwrap_or(0)
    }

    fn current_span(&self) -> Span {
        Span { source_index: self.source_index, line: self.line, column: self.column }
    }

    fn error(&self, message: impl Into<String>) -> SourceError {
        SourceError { span: self.current_span(), message: message.into() }
    }

    fn advance_by(&mut self, n: usize) {
        for _ in 0..n {
            if self.byte(0) == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            self.pos += 1;
        }
    }

    /// Scans and returns the next token, dispatching on lexer state.
    pub fn next(&mut self) -> Result<Lexeme, SourceError> {
        match self.state {
            State::Normal => {
                let lexeme = self.lex_code()?;
                if lexeme.token == Token::InterpStart {
                    self.state = State::Interpolation { code_segment: false };
                }
                Ok(lexeme)
            }
            State::Interpolation { code_segment: true } => self.lex_code(),
            State::Interpolation { code_segment: false } => {
                let lexeme = self.lex_interpolation_segment()?;
                match lexeme.token {
                    Token::InterpEnd => self.state = State::Normal,
                    Token::CodeStart => self.state = State::Interpolation { code_segment: true },
                    _ => {}
                }
                Ok(lexeme)
            }
        }
    }

    /// Tells the lexer that the parser has just consumed the `}` that
    /// closes the current `${...}` code block, so scanning should resume
    /// in literal-segment mode.
    pub fn end_code_segment(&mut self) {
        debug_assert!(matches!(self.state, State::Interpolation { code_segment: true }));
        self.state = State::Interpolation { code_segment: false };
    }

    /// Scans the next token under the extended-variable rule, where `-` is
    /// a valid identifier character. The parser requests this explicitly
    /// when it expects a header-like attribute name.
    pub fn next_extended_var(&mut self, mode: VarMode) -> Result<Lexeme, SourceError> {
        if mode == VarMode::Normal {
            return self.next();
        }
        self.skip_trivia()?;
        let start_span = self.current_span();
        let c = self.byte(0);
        if is_symbol_init_char(c) {
            let start = self.pos;
            while is_extended_var_char(self.byte(0)) {
                self.advance_by(1);
            }
            let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap().to_string();
            Ok(Lexeme { token: Token::Var(text), span: start_span })
        } else if c == b'"' {
            self.lex_line_str(b'"')
        } else {
            Err(self.error("expected a variable name (dashes are allowed here)"))
        }
    }

    fn skip_trivia(&mut self) -> Result<(), SourceError> {
        loop {
            match self.byte(0) {
                b' ' | b'\t' | b'\r' | 0x0b => self.advance_by(1),
                b'\n' => self.advance_by(1),
                b'#' => self.skip_line_comment(),
                b'/' if self.byte(1) == b'/' => self.skip_line_comment(),
                b'/' if self.byte(1) == b'*' => self.skip_multiline_comment()?,
                _ => return Ok(()),
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while self.byte(0) != 0 && self.byte(0) != b'\n' {
            self.advance_by(1);
        }
        if self.byte(0) == b'\n' {
            self.advance_by(1);
        }
    }

    fn skip_multiline_comment(&mut self) -> Result<(), SourceError> {
        let start_span = self.current_span();
        self.advance_by(2); // skip /*
        loop {
            if self.byte(0) == 0 {
                return Err(SourceError {
                    span: start_span,
                    message: "multiline comment is not closed with \"*/\"".into(),
                });
            }
            if self.byte(0) == b'*' && self.byte(1) == b'/' {
                self.advance_by(2);
                return Ok(());
            }
            self.advance_by(1);
        }
    }

    fn lex_code(&mut self) -> Result<Lexeme, SourceError> {
        self.skip_trivia()?;
        let span = self.current_span();
        let c = self.byte(0);
        macro_rules! one {
            ($tok:expr) => {{
                self.advance_by(1);
                Ok(Lexeme { token: $tok, span })
            }};
        }
        match c {
            b'+' => self.lookahead2(b'=', Token::AddAssign, Token::Plus, span),
            b'-' => self.lookahead2(b'=', Token::SubAssign, Token::Minus, span),
            b'*' => self.lookahead2(b'=', Token::MulAssign, Token::Star, span),
            b'/' => self.lookahead2(b'=', Token::DivAssign, Token::Slash, span),
            b'%' => self.lookahead2(b'=', Token::ModAssign, Token::Percent, span),
            b'~' => one!(Token::Match),
            b'!' => {
                if self.byte(1) == b'~' {
                    self.advance_by(2);
                    Ok(Lexeme { token: Token::NotMatch, span })
                } else {
                    self.lookahead2(b'=', Token::Ne, Token::Bang, span)
                }
            }
            b'=' => self.lookahead2(b'=', Token::EqEq, Token::Assign, span),
            b'<' => self.lookahead2(b'=', Token::Le, Token::Lt, span),
            b'>' => self.lookahead2(b'=', Token::Ge, Token::Gt, span),
            b'&' if self.byte(1) == b'&' => {
                self.advance_by(2);
                Ok(Lexeme { token: Token::AndAnd, span })
            }
            b'|' if self.byte(1) == b'|' => {
                self.advance_by(2);
                Ok(Lexeme { token: Token::OrOr, span })
            }
            b':' => one!(Token::Colon),
            b';' => one!(Token::Semicolon),
            b',' => one!(Token::Comma),
            b'.' => one!(Token::Dot),
            b'(' => one!(Token::LParen),
            b')' => one!(Token::RParen),
            b'[' => one!(Token::LBracket),
            b']' => one!(Token::RBracket),
            b'{' if self.byte(1) == b'"' => self.lex_multiline_str(),
            b'{' => one!(Token::LBrace),
            b'}' => one!(Token::RBrace),
            b'0'..=b'9' => self.lex_number(),
            b'"' => self.lex_line_str(b'"'),
            0 => Ok(Lexeme { token: Token::Eof, span }),
            b'\'' => {
                if matches!(self.state, State::Normal) {
                    self.advance_by(1);
                    Ok(Lexeme { token: Token::InterpStart, span })
                } else {
                    Err(self.error("nested string interpolation is not allowed"))
                }
            }
            _ => self.lex_var_or_keyword(),
        }
    }

    fn lookahead2(&mut self, next: u8, matched: Token, fallback: Token, span: Span) -> Result<Lexeme, SourceError> {
        if self.byte(1) == next {
            self.advance_by(2);
            Ok(Lexeme { token: matched, span })
        } else {
            self.advance_by(1);
            Ok(Lexeme { token: fallback, span })
        }
    }

    fn lex_interpolation_segment(&mut self) -> Result<Lexeme, SourceError> {
        let span = self.current_span();
        if self.byte(0) == b'$' && self.byte(1) == b'{' {
            self.advance_by(2);
            return Ok(Lexeme { token: Token::CodeStart, span });
        }
        if self.byte(0) == b'\'' {
            self.advance_by(1);
            return Ok(Lexeme { token: Token::InterpEnd, span });
        }
        let mut buf = String::new();
        loop {
            let c = self.byte(0);
            if c == 0 {
                return Err(self.error("string interpolation is not closed with \"'\""));
            }
            if c == b'\\' {
                let nc = self.byte(1);
                if nc == b'\\' || nc == b'\'' || nc == b'{' {
                    buf.push(nc as char);
                    self.advance_by(2);
                    continue;
                }
                buf.push('\\');
                self.advance_by(1);
                continue;
            }
            if c == b'$' && self.byte(1) == b'{' {
                break;
            }
            if c == b'\'' {
                break;
            }
            // copy one UTF-8 codepoint, not one byte, so interpolated
            // text survives non-ASCII source.
            let rest = std::str::from_utf8(&self.source[self.pos..]).unwrap_or("");
            let ch = rest.chars().next().unwrap();
            buf.push(ch);
            self.advance_by(ch.len_utf8());
        }
        Ok(Lexeme { token: Token::Segment(buf), span })
    }

    fn lex_number(&mut self) -> Result<Lexeme, SourceError> {
        let span = self.current_span();
        let start = self.pos;
        while self.byte(0).is_ascii_digit() {
            self.advance_by(1);
        }
        match self.byte(0) {
            b'.' => return self.lex_real(span, start),
            b's' => return self.lex_duration(span, start, DurationUnit::Sec),
            b'm' => match self.byte(1) {
                b's' => return self.lex_duration(span, start, DurationUnit::Msec),
                b'b' => return self.lex_size(span, start, SizeUnit::Mb),
                b'i' if self.byte(2) == b'n' => return self.lex_duration(span, start, DurationUnit::Min),
                _ => {}
            },
            b'g' if self.byte(1) == b'b' => return self.lex_size(span, start, SizeUnit::Gb),
            b'k' if self.byte(1) == b'b' => return self.lex_size(span, start, SizeUnit::Kb),
            b'M' if self.byte(1) == b'B' => return self.lex_size(span, start, SizeUnit::Mb),
            b'K' if self.byte(1) == b'B' => return self.lex_size(span, start, SizeUnit::Kb),
            b'G' if self.byte(1) == b'B' => return self.lex_size(span, start, SizeUnit::Gb),
            b'h' => return self.lex_duration(span, start, DurationUnit::Hour),
            b'b' | b'B' => return self.lex_size(span, start, SizeUnit::B),
            _ => {}
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        let value: i32 =
            text.parse().map_err(|_| self.error(format!("cannot convert `{text}` to a 32-bit integer")))?;
        Ok(Lexeme { token: Token::Int(value), span })
    }

    fn lex_real(&mut self, span: Span, start: usize) -> Result<Lexeme, SourceError> {
        self.advance_by(1); // the dot
        let digits_start = self.pos;
        while self.byte(0).is_ascii_digit() {
            self.advance_by(1);
        }
        if self.pos == digits_start {
            return Err(self.error("real literal expects digits after the decimal point"));
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        let value: f64 = text.parse().map_err(|_| self.error(format!("cannot convert `{text}` to a real number")))?;
        Ok(Lexeme { token: Token::Real(value), span })
    }

    fn lex_size(&mut self, span: Span, start: usize, unit: SizeUnit) -> Result<Lexeme, SourceError> {
        let mut size = Size::default();
        let mut smallest_seen = unit;
        self.apply_size_component(&mut size, start, unit)?;
        loop {
            let digits_start = self.pos;
            while self.byte(0).is_ascii_digit() {
                self.advance_by(1);
            }
            if self.pos == digits_start {
                break;
            }
            let next_unit = match (self.byte(0), self.byte(1)) {
                (b'm', b'b') | (b'M', b'B') => SizeUnit::Mb,
                (b'k', b'b') | (b'K', b'B') => SizeUnit::Kb,
                (b'b', _) | (b'B', _) => SizeUnit::B,
                _ => {
                    self.pos = digits_start;
                    break;
                }
            };
            if next_unit >= smallest_seen {
                self.pos = digits_start;
                break;
            }
            let component_start = digits_start;
            self.apply_size_component(&mut size, component_start, next_unit)?;
            smallest_seen = next_unit;
        }
        Ok(Lexeme { token: Token::Size(size), span })
    }

    fn apply_size_component(&mut self, size: &mut Size, digits_start: usize, unit: SizeUnit) -> Result<(), SourceError> {
        let digits_end = self.pos;
        let text = std::str::from_utf8(&self.source[digits_start..digits_end]).unwrap();
        let value: u64 =
            text.parse().map_err(|_| self.error(format!("cannot convert size component `{text}` to an integer")))?;
        let suffix_len = match unit {
            SizeUnit::B => 1,
            SizeUnit::Kb | SizeUnit::Mb => 2,
            SizeUnit::Gb => 2,
        };
        match unit {
            SizeUnit::B => size.b = value,
            SizeUnit::Kb => size.kb = value,
            SizeUnit::Mb => size.mb = value,
            SizeUnit::Gb => size.gb = value,
        }
        self.advance_by(suffix_len);
        Ok(())
    }

    fn lex_duration(&mut self, span: Span, start: usize, unit: DurationUnit) -> Result<Lexeme, SourceError> {
        let mut dur = Duration::default();
        let mut smallest_seen = unit;
        self.apply_duration_component(&mut dur, start, unit)?;
        loop {
            let digits_start = self.pos;
            while self.byte(0).is_ascii_digit() {
                self.advance_by(1);
            }
            if self.pos == digits_start {
                break;
            }
            let next_unit = match (self.byte(0), self.byte(1), self.byte(2)) {
                (b'm', b's', _) => DurationUnit::Msec,
                (b'm', b'i', b'n') => DurationUnit::Min,
                (b's', _, _) => DurationUnit::Sec,
                _ => {
                    self.pos = digits_start;
                    break;
                }
            };
            if next_unit >= smallest_seen {
                self.pos = digits_start;
                break;
            }
            self.apply_duration_component(&mut dur, digits_start, next_unit)?;
            smallest_seen = next_unit;
        }
        Ok(Lexeme { token: Token::Duration(dur), span })
    }

    fn apply_duration_component(
        &mut self,
        dur: &mut Duration,
        digits_start: usize,
        unit: DurationUnit,
    ) -> Result<(), SourceError> {
        let digits_end = self.pos;
        let text = std::str::from_utf8(&self.source[digits_start..digits_end]).unwrap();
        let value: u64 = text
            .parse()
            .map_err(|_| self.error(format!("cannot convert duration component `{text}` to an integer")))?;
        let suffix_len = match unit {
            DurationUnit::Msec => 2,
            DurationUnit::Sec => 1,
            DurationUnit::Min => 3,
            DurationUnit::Hour => 1,
        };
        match unit {
            DurationUnit::Msec => dur.ms = value,
            DurationUnit::Sec => dur.s = value,
            DurationUnit::Min => dur.min = value,
            DurationUnit::Hour => dur.h = value,
        }
        self.advance_by(suffix_len);
        Ok(())
    }

    fn lex_line_str(&mut self, delimiter: u8) -> Result<Lexeme, SourceError> {
        let span = self.current_span();
        self.advance_by(1); // opening quote
        let mut buf = String::new();
        loop {
            let c = self.byte(0);
            if c == 0 {
                return Err(self.error("string is not closed properly"));
            }
            if c == b'\n' {
                return Err(self.error("single-line string contains a line break; use a multi-line string instead"));
            }
            if c == b'\\' && self.byte(1) == delimiter {
                buf.push(delimiter as char);
                self.advance_by(2);
                continue;
            }
            if c == delimiter {
                self.advance_by(1);
                break;
            }
            let rest = std::str::from_utf8(&self.source[self.pos..]).unwrap_or("");
            let ch = rest.chars().next().unwrap();
            buf.push(ch);
            self.advance_by(ch.len_utf8());
        }
        Ok(Lexeme { token: Token::Str(buf), span })
    }

    fn lex_multiline_str(&mut self) -> Result<Lexeme, SourceError> {
        let span = self.current_span();
        self.advance_by(2); // {"
        let mut buf = String::new();
        loop {
            let c = self.byte(0);
            if c == 0 {
                return Err(self.error("multi-line string is not closed with `\"}`"));
            }
            if c == b'"' && self.byte(1) == b'}' {
                self.advance_by(2);
                break;
            }
            let rest = std::str::from_utf8(&self.source[self.pos..]).unwrap_or("");
            let ch = rest.chars().next().unwrap();
            buf.push(ch);
            self.advance_by(ch.len_utf8());
        }
        Ok(Lexeme { token: Token::Str(buf), span })
    }

    fn lex_var_or_keyword(&mut self) -> Result<Lexeme, SourceError> {
        let span = self.current_span();
        let c = self.byte(0);
        if !is_symbol_init_char(c) {
            return Err(self.error(format!("unexpected character `{}`", c as char)));
        }
        let start = self.pos;
        while is_symbol_char(self.byte(0)) {
            self.advance_by(1);
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        let token = match text {
            "acl" => Token::Acl,
            "break" => Token::Break,
            "call" => Token::Call,
            "continue" => Token::Continue,
            "declare" => Token::Declare,
            "else" => Token::Else,
            "elif" => Token::Elif,
            "elsif" => Token::Elsif,
            "elseif" => Token::Elseif,
            "false" => Token::False,
            "for" => Token::For,
            "global" => Token::Global,
            "include" => Token::Include,
            "if" => Token::If,
            "import" => Token::Import,
            "new" => Token::New,
            "null" => Token::Null,
            "return" => Token::Return,
            "set" => Token::Set,
            "sub" => Token::Sub,
            "true" => Token::True,
            "unset" => Token::Unset,
            "vcl" => Token::Vcl,
            _ => Token::Var(text.to_string()),
        };
        Ok(Lexeme { token, span })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SizeUnit {
    B,
    Kb,
    Mb,
    Gb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DurationUnit {
    Msec,
    Sec,
    Min,
    Hour,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(src, 0);
        let mut out = Vec::new();
        loop {
            let lexeme = lexer.next().unwrap();
            let done = lexeme.token == Token::Eof;
            out.push(lexeme.token);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_arithmetic_and_compound_assign() {
        assert_eq!(
            tokens("a += 1"),
            vec![Token::Var("a".into()), Token::AddAssign, Token::Int(1), Token::Eof]
        );
    }

    #[test]
    fn distinguishes_match_and_not_match() {
        assert_eq!(tokens("a ~ b"), vec![Token::Var("a".into()), Token::Match, Token::Var("b".into()), Token::Eof]);
        assert_eq!(
            tokens("a !~ b"),
            vec![Token::Var("a".into()), Token::NotMatch, Token::Var("b".into()), Token::Eof]
        );
    }

    #[test]
    fn three_elif_spellings_are_distinct_keywords() {
        assert_eq!(tokens("elif"), vec![Token::Elif, Token::Eof]);
        assert_eq!(tokens("elsif"), vec![Token::Elsif, Token::Eof]);
        assert_eq!(tokens("elseif"), vec![Token::Elseif, Token::Eof]);
    }

    #[test]
    fn scans_decreasing_size_suffix_chain() {
        assert_eq!(tokens("2kb3b"), vec![Token::Size(Size { gb: 0, mb: 0, kb: 2, b: 3 }), Token::Eof]);
    }

    #[test]
    fn size_suffix_out_of_order_stops_early() {
        // `3b2kb` is an increasing sequence (b then kb), which the grammar
        // does not accept as one literal: only the leading byte component
        // is consumed, and the remaining `2kb` re-lexes as its own size.
        assert_eq!(
            tokens("3b2kb"),
            vec![
                Token::Size(Size { gb: 0, mb: 0, kb: 0, b: 3 }),
                Token::Size(Size { gb: 0, mb: 0, kb: 2, b: 0 }),
                Token::Eof
            ]
        );
    }

    #[test]
    fn scans_decreasing_duration_suffix_chain() {
        assert_eq!(tokens("1h30min"), vec![Token::Duration(Duration { h: 1, min: 30, s: 0, ms: 0 }), Token::Eof]);
    }

    #[test]
    fn scans_single_line_string_with_escaped_quote() {
        assert_eq!(tokens(r#""a\"b""#), vec![Token::Str("a\"b".into()), Token::Eof]);
    }

    #[test]
    fn single_line_string_rejects_embedded_newline() {
        let mut lexer = Lexer::new("\"a\nb\"", 0);
        assert!(lexer.next().is_err());
    }

    #[test]
    fn scans_multiline_string() {
        assert_eq!(tokens("{\"a\nb\"}"), vec![Token::Str("a\nb".into()), Token::Eof]);
    }

    #[test]
    fn skips_all_three_comment_styles() {
        assert_eq!(tokens("1 # a\n+ 2 // b\n* /* c */ 3"), vec![
            Token::Int(1),
            Token::Plus,
            Token::Int(2),
            Token::Star,
            Token::Int(3),
            Token::Eof
        ]);
    }

    #[test]
    fn unclosed_multiline_comment_errors() {
        let mut lexer = Lexer::new("1 /* never closes", 0);
        assert!(lexer.next().is_ok());
        assert!(lexer.next().is_err());
    }

    #[test]
    fn string_interpolation_round_trip() {
        // `'text ${v} more'`
        let mut lexer = Lexer::new("'text ${v} more'", 0);
        assert_eq!(lexer.next().unwrap().token, Token::InterpStart);
        assert_eq!(lexer.next().unwrap().token, Token::Segment("text ".into()));
        assert_eq!(lexer.next().unwrap().token, Token::CodeStart);
        assert_eq!(lexer.next().unwrap().token, Token::Var("v".into()));
        lexer.end_code_segment();
        assert_eq!(lexer.next().unwrap().token, Token::Segment(" more".into()));
        assert_eq!(lexer.next().unwrap().token, Token::InterpEnd);
    }

    #[test]
    fn nested_interpolation_is_rejected() {
        let mut lexer = Lexer::new("'a${'", 0);
        assert_eq!(lexer.next().unwrap().token, Token::InterpStart);
        assert_eq!(lexer.next().unwrap().token, Token::Segment("a".into()));
        assert_eq!(lexer.next().unwrap().token, Token::CodeStart);
        assert!(lexer.next().is_err());
    }

    #[test]
    fn extended_variable_allows_dash() {
        let mut lexer = Lexer::new("X-Forwarded-For", 0);
        let lexeme = lexer.next_extended_var(VarMode::Extended).unwrap();
        assert_eq!(lexeme.token, Token::Var("X-Forwarded-For".into()));
    }

    #[test]
    fn real_literal_requires_digit_after_dot() {
        let mut lexer = Lexer::new("1.", 0);
        assert!(lexer.next().is_err());
    }

    #[test]
    fn tracks_line_and_column_across_newlines() {
        let mut lexer = Lexer::new("a\nb", 0);
        let a = lexer.next().unwrap();
        let b = lexer.next().unwrap();
        assert_eq!(a.span.line, 1);
        assert_eq!(b.span.line, 2);
        assert_eq!(b.span.column, 1);
    }
}

use super::ast::Span;
use super::error::CompileError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    String(String),
    FString(Vec<FStringPiece>),
    Needle(String),
    Carrier(u32),
    Sheet { sheet: i32, gauge: Option<i32> },
    True,
    False,
    None,

    // Identifiers & keywords
    Ident(String),
    Def,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    With,
    As,
    Try,
    Catch,
    Assert,
    Print,
    Pause,
    Return,
    Global,
    Import,
    Xfer,
    Drop,
    Cut,
    Remove,
    Releasehook,
    Push,
    Swap,
    And,
    Or,
    Not,
    Is,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    Semicolon,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Lt,
    Gt,
    Le,        // <=
    Ge,        // >=
    EqEq,      // ==
    Ne,        // !=
    Eq,        // =
    LeftArrow,  // <--
    RightArrow, // -->

    Eof,
}

/// Raw piece of an f-string. Holes keep their source text and the byte
/// offset where it starts so the parser can re-lex them in place.
#[derive(Debug, Clone, PartialEq)]
pub enum FStringPiece {
    Text(String),
    Hole { source: String, offset: usize },
}

impl Token {
    /// Short description used in "expected ..." diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Token::Int(v) => v.to_string(),
            Token::Float(v) => v.to_string(),
            Token::String(s) => format!("\"{s}\""),
            Token::FString(_) => "f-string".to_string(),
            Token::Needle(n) => n.clone(),
            Token::Carrier(c) => format!("c{c}"),
            Token::Sheet { sheet, .. } => format!("s{sheet}"),
            Token::Ident(name) => name.clone(),
            Token::Eof => "end of input".to_string(),
            other => format!("{other:?}").to_lowercase(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

pub fn lex(source: &str) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
    lex_at(source, 0)
}

/// Lex a fragment that starts at byte `base` of a larger source.
pub fn lex_at(source: &str, base: usize) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
    let mut lexer = Lexer::new(source, base);
    lexer.tokenize()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    base: usize,
    pos: usize,
    tokens: Vec<SpannedToken>,
    errors: Vec<CompileError>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, base: usize) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            base,
            pos: 0,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn tokenize(&mut self) -> Result<Vec<SpannedToken>, Vec<CompileError>> {
        while self.pos < self.bytes.len() {
            self.skip_whitespace_and_comments();
            if self.pos >= self.bytes.len() {
                break;
            }

            let start = self.pos;
            let ch = self.bytes[self.pos];

            match ch {
                b'(' => self.single(Token::LParen),
                b')' => self.single(Token::RParen),
                b'{' => self.single(Token::LBrace),
                b'}' => self.single(Token::RBrace),
                b'[' => self.single(Token::LBracket),
                b']' => self.single(Token::RBracket),
                b',' => self.single(Token::Comma),
                b'.' => self.single(Token::Dot),
                b':' => self.single(Token::Colon),
                b';' => self.single(Token::Semicolon),
                b'+' => self.single(Token::Plus),
                b'*' => self.single(Token::Star),
                b'/' => self.single(Token::Slash),
                b'%' => self.single(Token::Percent),
                b'^' => self.single(Token::Caret),
                b'-' => {
                    if self.starts_with("-->") {
                        self.pos += 3;
                        self.push(Token::RightArrow, start, self.pos);
                    } else {
                        self.single(Token::Minus);
                    }
                }
                b'<' => {
                    if self.starts_with("<--") {
                        self.pos += 3;
                        self.push(Token::LeftArrow, start, self.pos);
                    } else if self.starts_with("<=") {
                        self.pos += 2;
                        self.push(Token::Le, start, self.pos);
                    } else {
                        self.single(Token::Lt);
                    }
                }
                b'>' => {
                    if self.starts_with(">=") {
                        self.pos += 2;
                        self.push(Token::Ge, start, self.pos);
                    } else {
                        self.single(Token::Gt);
                    }
                }
                b'=' => {
                    if self.starts_with("==") {
                        self.pos += 2;
                        self.push(Token::EqEq, start, self.pos);
                    } else {
                        self.single(Token::Eq);
                    }
                }
                b'!' => {
                    if self.starts_with("!=") {
                        self.pos += 2;
                        self.push(Token::Ne, start, self.pos);
                    } else {
                        self.errors.push(CompileError::lexer(
                            "Expected '!=' (use 'not' for negation)",
                            self.span(start, start + 1),
                        ));
                        self.pos += 1;
                    }
                }
                b'"' => {
                    self.pos += 1;
                    let text = self.lex_string_body(start);
                    self.push(Token::String(text), start, self.pos);
                }
                b'0'..=b'9' => self.lex_number(start),
                b'f' if self.bytes.get(self.pos + 1) == Some(&b'"') => {
                    self.pos += 2;
                    self.lex_fstring(start);
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.lex_word(start),
                _ => {
                    let ch = self.source[start..].chars().next().unwrap_or('?');
                    self.errors.push(CompileError::lexer(
                        format!("Unexpected character: '{ch}'"),
                        self.span(start, start + ch.len_utf8()),
                    ));
                    self.pos += ch.len_utf8();
                }
            }
        }

        let end = self.base + self.pos;
        self.tokens.push(SpannedToken {
            token: Token::Eof,
            span: Span::new(end, end),
        });

        if self.errors.is_empty() {
            Ok(std::mem::take(&mut self.tokens))
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }

    fn span(&self, start: usize, end: usize) -> Span {
        Span::new(self.base + start, self.base + end)
    }

    fn starts_with(&self, text: &str) -> bool {
        self.bytes[self.pos..].starts_with(text.as_bytes())
    }

    fn single(&mut self, token: Token) {
        let start = self.pos;
        self.pos += 1;
        self.push(token, start, self.pos);
    }

    fn push(&mut self, token: Token, start: usize, end: usize) {
        let span = self.span(start, end);
        self.tokens.push(SpannedToken { token, span });
    }

    fn skip_whitespace_and_comments(&mut self) {
        while self.pos < self.bytes.len() {
            match self.bytes[self.pos] {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'/') => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'/' if self.bytes.get(self.pos + 1) == Some(&b'*') => self.skip_block_comment(),
                _ => break,
            }
        }
    }

    /// Block comments nest.
    fn skip_block_comment(&mut self) {
        let start = self.pos;
        let mut depth = 0usize;
        while self.pos < self.bytes.len() {
            if self.starts_with("/*") {
                depth += 1;
                self.pos += 2;
            } else if self.starts_with("*/") {
                depth -= 1;
                self.pos += 2;
                if depth == 0 {
                    return;
                }
            } else {
                self.pos += 1;
            }
        }
        self.errors.push(CompileError::lexer(
            "Unterminated block comment",
            self.span(start, self.pos),
        ));
    }

    /// Reads up to the closing quote, resolving `\n`, `\t`, `\"` and `\\`.
    fn lex_string_body(&mut self, start: usize) -> String {
        let mut out = String::new();
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'"' {
            if self.bytes[self.pos] == b'\\' {
                if let Some(next) = self.source[self.pos + 1..].chars().next() {
                    match next {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        '"' => out.push('"'),
                        '\\' => out.push('\\'),
                        _ => {
                            out.push('\\');
                            out.push(next);
                        }
                    }
                    self.pos += 1 + next.len_utf8();
                    continue;
                }
            }
            let ch = self.source[self.pos..].chars().next().unwrap_or('\0');
            out.push(ch);
            self.pos += ch.len_utf8().max(1);
        }
        if self.pos < self.bytes.len() {
            self.pos += 1;
        } else {
            self.errors.push(CompileError::lexer(
                "Unterminated string literal",
                self.span(start, self.pos),
            ));
        }
        out
    }

    fn lex_fstring(&mut self, start: usize) {
        let mut pieces = Vec::new();
        let mut text = String::new();
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'"' {
            if self.bytes[self.pos] == b'{' {
                if !text.is_empty() {
                    pieces.push(FStringPiece::Text(std::mem::take(&mut text)));
                }
                self.pos += 1;
                let hole_start = self.pos;
                let mut depth = 0usize;
                while self.pos < self.bytes.len() {
                    match self.bytes[self.pos] {
                        b'{' | b'[' | b'(' => depth += 1,
                        b'}' if depth == 0 => break,
                        b'}' | b']' | b')' => depth = depth.saturating_sub(1),
                        b'"' => break,
                        _ => {}
                    }
                    self.pos += 1;
                }
                if self.bytes.get(self.pos) != Some(&b'}') {
                    self.errors.push(CompileError::lexer(
                        "Unclosed '{' in f-string",
                        self.span(hole_start - 1, self.pos),
                    ));
                    return;
                }
                pieces.push(FStringPiece::Hole {
                    source: self.source[hole_start..self.pos].to_string(),
                    offset: self.base + hole_start,
                });
                self.pos += 1;
            } else {
                let ch = self.source[self.pos..].chars().next().unwrap_or('\0');
                text.push(ch);
                self.pos += ch.len_utf8().max(1);
            }
        }
        if self.pos < self.bytes.len() {
            self.pos += 1;
        } else {
            self.errors.push(CompileError::lexer(
                "Unterminated f-string",
                self.span(start, self.pos),
            ));
        }
        if !text.is_empty() {
            pieces.push(FStringPiece::Text(text));
        }
        self.push(Token::FString(pieces), start, self.pos);
    }

    fn lex_number(&mut self, start: usize) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if self.pos < self.bytes.len() && self.bytes[self.pos] == b'.'
            && self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
        {
            self.pos += 1;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
            let text = &self.source[start..self.pos];
            match text.parse::<f64>() {
                Ok(v) => self.push(Token::Float(v), start, self.pos),
                Err(_) => self.errors.push(CompileError::lexer(
                    format!("Invalid float: {text}"),
                    self.span(start, self.pos),
                )),
            }
        } else {
            let text = &self.source[start..self.pos];
            match text.parse::<i64>() {
                Ok(v) => self.push(Token::Int(v), start, self.pos),
                Err(_) => self.errors.push(CompileError::lexer(
                    format!("Invalid number: {text}"),
                    self.span(start, self.pos),
                )),
            }
        }
    }

    fn lex_word(&mut self, start: usize) {
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        let word = &self.source[start..self.pos];
        if let Some(token) = self.machine_literal(word) {
            self.push(token, start, self.pos);
            return;
        }
        let token = match word {
            "def" => Token::Def,
            "if" => Token::If,
            "elif" => Token::Elif,
            "else" => Token::Else,
            "while" => Token::While,
            "for" => Token::For,
            "in" => Token::In,
            "with" => Token::With,
            "as" => Token::As,
            "try" => Token::Try,
            "catch" => Token::Catch,
            "assert" => Token::Assert,
            "print" => Token::Print,
            "pause" => Token::Pause,
            "return" => Token::Return,
            "global" => Token::Global,
            "import" => Token::Import,
            "xfer" => Token::Xfer,
            "drop" => Token::Drop,
            "cut" => Token::Cut,
            "remove" => Token::Remove,
            "releasehook" => Token::Releasehook,
            "push" => Token::Push,
            "swap" => Token::Swap,
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "is" => Token::Is,
            "True" => Token::True,
            "False" => Token::False,
            "None" => Token::None,
            _ => Token::Ident(word.to_string()),
        };
        self.push(token, start, self.pos);
    }

    /// `f3`, `bs12`, `c2`, `s1`, `s1:g2`. Consumes the `:g<int>` suffix of a
    /// sheet literal.
    fn machine_literal(&mut self, word: &str) -> Option<Token> {
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        let mut chars = word.chars();
        match chars.next()? {
            'f' | 'b' => {
                let rest = chars.as_str();
                let rest = rest.strip_prefix('s').unwrap_or(rest);
                digits(rest).then(|| Token::Needle(word.to_string()))
            }
            'c' => {
                let rest = chars.as_str();
                if digits(rest) {
                    rest.parse().ok().map(Token::Carrier)
                } else {
                    None
                }
            }
            's' => {
                let rest = chars.as_str();
                if !digits(rest) {
                    return None;
                }
                let sheet = rest.parse().ok()?;
                let mut gauge = None;
                if self.starts_with(":g") {
                    let digits_start = self.pos + 2;
                    let mut end = digits_start;
                    while end < self.bytes.len() && self.bytes[end].is_ascii_digit() {
                        end += 1;
                    }
                    if end > digits_start {
                        gauge = self.source[digits_start..end].parse().ok();
                        self.pos = end;
                    }
                }
                Some(Token::Sheet { sheet, gauge })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tok(s: &str) -> Vec<Token> {
        lex(s).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn simple_tokens() {
        let tokens = tok("1 + 2.5;");
        assert_eq!(
            tokens,
            vec![Token::Int(1), Token::Plus, Token::Float(2.5), Token::Semicolon, Token::Eof]
        );
    }

    #[test]
    fn keywords() {
        let tokens = tok("def if elif else while for in with as");
        assert_eq!(tokens, vec![
            Token::Def, Token::If, Token::Elif, Token::Else, Token::While,
            Token::For, Token::In, Token::With, Token::As, Token::Eof,
        ]);
    }

    #[test]
    fn machine_literals() {
        let tokens = tok("f3 bs12 c2 s1 s1:g2 foo3 b");
        assert_eq!(tokens, vec![
            Token::Needle("f3".into()),
            Token::Needle("bs12".into()),
            Token::Carrier(2),
            Token::Sheet { sheet: 1, gauge: None },
            Token::Sheet { sheet: 1, gauge: Some(2) },
            Token::Ident("foo3".into()),
            Token::Ident("b".into()),
            Token::Eof,
        ]);
    }

    #[test]
    fn direction_arrows() {
        let tokens = tok("<-- --> <= < - >=");
        assert_eq!(tokens, vec![
            Token::LeftArrow, Token::RightArrow, Token::Le, Token::Lt,
            Token::Minus, Token::Ge, Token::Eof,
        ]);
    }

    #[test]
    fn operators() {
        let tokens = tok("* / % ^ == != =");
        assert_eq!(tokens, vec![
            Token::Star, Token::Slash, Token::Percent, Token::Caret,
            Token::EqEq, Token::Ne, Token::Eq, Token::Eof,
        ]);
    }

    #[test]
    fn comments_stripped() {
        let tokens = tok("x /* a /* nested */ block */ y // tail\nz");
        assert_eq!(tokens, vec![
            Token::Ident("x".into()), Token::Ident("y".into()), Token::Ident("z".into()), Token::Eof,
        ]);
    }

    #[test]
    fn string_escapes() {
        let tokens = tok(r#""a\"b\n""#);
        assert_eq!(tokens, vec![Token::String("a\"b\n".into()), Token::Eof]);
    }

    #[test]
    fn fstring_pieces() {
        let tokens = tok(r#"f"n={x + 1}!""#);
        assert_eq!(tokens, vec![
            Token::FString(vec![
                FStringPiece::Text("n=".into()),
                FStringPiece::Hole { source: "x + 1".into(), offset: 5 },
                FStringPiece::Text("!".into()),
            ]),
            Token::Eof,
        ]);
    }

    #[test]
    fn spans_are_offset() {
        let tokens = lex_at("x", 10).unwrap();
        assert_eq!(tokens.first().unwrap().span, Span::new(10, 11));
    }

    #[test]
    fn unterminated_string_is_error() {
        assert!(lex("\"abc").is_err());
        assert!(lex("a ! b").is_err());
    }

    #[test]
    fn non_ascii_comments_and_strings() {
        let tokens = tok("/* café ✓ */ x // naïve\n\"déjà\"");
        assert_eq!(tokens, vec![
            Token::Ident("x".into()), Token::String("déjà".into()), Token::Eof,
        ]);
        assert_eq!(tok(r#""\é""#), vec![Token::String("\\é".into()), Token::Eof]);
        assert!(lex("/* ünterminated").is_err());
    }
}

//! Hand-written scanner: turns a source buffer into a lazy stream of
//! [`Token`]s. Holds only a cursor (`start`, `current`, `line`) over the
//! original byte slice; tokens borrow from it, so scanning allocates nothing.

use crate::token::{Token, TokenKind};

pub struct Lexer<'src> {
    src: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self { src: source.as_bytes(), start: 0, current: 0, line: 1 }
    }

    /// Scans and returns the next token. Never fails: lexical errors are
    /// reported as `TokenKind::Error` tokens whose lexeme is the message;
    /// the compiler decides what to do with them.
    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'!' => {
                let kind = if self.matches(b'=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.matches(b'=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.matches(b'=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.make_token(kind)
            }
            b'>' => {
                let kind =
                    if self.matches(b'=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.make_token(kind)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.src.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.src[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() { b'\0' } else { self.src[self.current] }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.src.len() { b'\0' } else { self.src[self.current + 1] }
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.src[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while self.peek() != b'\n' && !self.is_at_end() {
                            self.advance();
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn lexeme(&self) -> &'src str {
        // Source text is valid UTF-8 (it came in as `&str`) and token
        // boundaries only ever fall on single-byte ASCII characters, so this
        // slice is always a valid `str` boundary.
        std::str::from_utf8(&self.src[self.start..self.current]).unwrap_or("")
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token { kind, lexeme: self.lexeme(), line: self.line }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Error, lexeme: message, line: self.line }
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }
        self.advance(); // closing quote
        self.make_token(TokenKind::String)
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.advance();
        }
        self.make_token(self.identifier_kind())
    }

    /// Trie over the first character (and, for `f`/`t`, one follow-up
    /// character) that recognizes the keyword set without hashing.
    fn identifier_kind(&self) -> TokenKind {
        let text = self.lexeme().as_bytes();
        match text.first() {
            Some(b'a') => self.check_keyword(1, "nd", TokenKind::And),
            Some(b'c') => self.check_keyword(1, "lass", TokenKind::Class),
            Some(b'e') => self.check_keyword(1, "lse", TokenKind::Else),
            Some(b'f') if text.len() > 1 => match text[1] {
                b'a' => self.check_keyword(2, "lse", TokenKind::False),
                b'o' => self.check_keyword(2, "r", TokenKind::For),
                b'u' => self.check_keyword(2, "n", TokenKind::Fun),
                _ => TokenKind::Identifier,
            },
            Some(b'i') => self.check_keyword(1, "f", TokenKind::If),
            Some(b'n') => self.check_keyword(1, "il", TokenKind::Nil),
            Some(b'o') => self.check_keyword(1, "r", TokenKind::Or),
            Some(b'p') => self.check_keyword(1, "rint", TokenKind::Print),
            Some(b'r') => self.check_keyword(1, "eturn", TokenKind::Return),
            Some(b's') => self.check_keyword(1, "uper", TokenKind::Super),
            Some(b't') if text.len() > 1 => match text[1] {
                b'h' => self.check_keyword(2, "is", TokenKind::This),
                b'r' => self.check_keyword(2, "ue", TokenKind::True),
                _ => TokenKind::Identifier,
            },
            Some(b'v') => self.check_keyword(1, "ar", TokenKind::Var),
            Some(b'w') => self.check_keyword(1, "hile", TokenKind::While),
            _ => TokenKind::Identifier,
        }
    }

    fn check_keyword(&self, start: usize, rest: &str, kind: TokenKind) -> TokenKind {
        let lexeme = self.lexeme();
        if lexeme.len() == start + rest.len() && &lexeme[start..] == rest {
            kind
        } else {
            TokenKind::Identifier
        }
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let tok = lexer.scan_token();
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("for foo false function fun this that true t"),
            vec![
                TokenKind::For,
                TokenKind::Identifier,
                TokenKind::False,
                TokenKind::Identifier,
                TokenKind::Fun,
                TokenKind::This,
                TokenKind::Identifier,
                TokenKind::True,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_and_strings() {
        let mut lexer = Lexer::new("12.5 \"hi\\nthere\"");
        let a = lexer.scan_token();
        assert_eq!(a.kind, TokenKind::Number);
        assert_eq!(a.lexeme, "12.5");
        let b = lexer.scan_token();
        assert_eq!(b.kind, TokenKind::String);
        assert_eq!(b.lexeme, "\"hi\\nthere\"");
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let mut lexer = Lexer::new("\"oops");
        let tok = lexer.scan_token();
        assert_eq!(tok.kind, TokenKind::Error);
        assert_eq!(tok.lexeme, "Unterminated string.");
    }

    #[test]
    fn comments_and_whitespace_are_skipped() {
        assert_eq!(
            kinds("// a comment\n  1  // trailing\n"),
            vec![TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn line_numbers_track_newlines() {
        let mut lexer = Lexer::new("1\n\n3");
        assert_eq!(lexer.scan_token().line, 1);
        let three = lexer.scan_token();
        assert_eq!(three.line, 3);
    }
}

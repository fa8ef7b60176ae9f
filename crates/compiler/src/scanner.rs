//! On-demand tokenizer over a byte source.
//!
//! Tokens borrow their lexeme from the source string and carry the line
//! they start on. The scanner never allocates; error tokens point at a
//! static message instead of a lexeme. After the end of input it keeps
//! returning EOF tokens.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Colon,
    Question,
    Slash,
    Star,
    // One- or two-character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals.
    Identifier,
    String,
    Number,
    // Keywords.
    And,
    Case,
    Class,
    Continue,
    Default,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    Switch,
    This,
    True,
    Var,
    While,

    Error,
    Eof,
}

#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub ttype: TokenType,
    /// The source slice, or the error message for `Error` tokens.
    pub lexeme: &'src str,
    pub line: i32,
}

pub struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: i32,
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_digit(c: u8) -> bool {
    c.is_ascii_digit()
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Scanner<'src> {
        Scanner {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenType::Eof);
        }

        let c = self.advance();
        if is_alpha(c) {
            return self.identifier();
        }
        if is_digit(c) {
            return self.number();
        }

        match c {
            b'(' => self.make_token(TokenType::LeftParen),
            b')' => self.make_token(TokenType::RightParen),
            b'{' => self.make_token(TokenType::LeftBrace),
            b'}' => self.make_token(TokenType::RightBrace),
            b'[' => self.make_token(TokenType::LeftBracket),
            b']' => self.make_token(TokenType::RightBracket),
            b';' => self.make_token(TokenType::Semicolon),
            b':' => self.make_token(TokenType::Colon),
            b',' => self.make_token(TokenType::Comma),
            b'.' => self.make_token(TokenType::Dot),
            b'-' => self.make_token(TokenType::Minus),
            b'+' => self.make_token(TokenType::Plus),
            b'?' => self.make_token(TokenType::Question),
            b'/' => self.make_token(TokenType::Slash),
            b'*' => self.make_token(TokenType::Star),
            b'!' => {
                let ttype = if self.match_byte(b'=') {
                    TokenType::BangEqual
                } else {
                    TokenType::Bang
                };
                self.make_token(ttype)
            }
            b'=' => {
                let ttype = if self.match_byte(b'=') {
                    TokenType::EqualEqual
                } else {
                    TokenType::Equal
                };
                self.make_token(ttype)
            }
            b'<' => {
                let ttype = if self.match_byte(b'=') {
                    TokenType::LessEqual
                } else {
                    TokenType::Less
                };
                self.make_token(ttype)
            }
            b'>' => {
                let ttype = if self.match_byte(b'=') {
                    TokenType::GreaterEqual
                } else {
                    TokenType::Greater
                };
                self.make_token(ttype)
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let c = self.source.as_bytes()[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() {
            return 0;
        }
        self.source.as_bytes()[self.current]
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            return 0;
        }
        self.source.as_bytes()[self.current + 1]
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, ttype: TokenType) -> Token<'src> {
        Token {
            ttype,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token {
            ttype: TokenType::Error,
            lexeme: message,
            line: self.line,
        }
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
                        // A comment goes until the end of the line.
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

    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || is_digit(self.peek()) {
            self.advance();
        }
        let ttype = match &self.source[self.start..self.current] {
            "and" => TokenType::And,
            "case" => TokenType::Case,
            "class" => TokenType::Class,
            "continue" => TokenType::Continue,
            "default" => TokenType::Default,
            "else" => TokenType::Else,
            "false" => TokenType::False,
            "for" => TokenType::For,
            "fun" => TokenType::Fun,
            "if" => TokenType::If,
            "nil" => TokenType::Nil,
            "or" => TokenType::Or,
            "print" => TokenType::Print,
            "return" => TokenType::Return,
            "super" => TokenType::Super,
            "switch" => TokenType::Switch,
            "this" => TokenType::This,
            "true" => TokenType::True,
            "var" => TokenType::Var,
            "while" => TokenType::While,
            _ => TokenType::Identifier,
        };
        self.make_token(ttype)
    }

    fn number(&mut self) -> Token<'src> {
        while is_digit(self.peek()) {
            self.advance();
        }

        // A fractional part needs a digit after the dot; a trailing dot is
        // left for the next token.
        if self.peek() == b'.' && is_digit(self.peek_next()) {
            self.advance();
            while is_digit(self.peek()) {
                self.advance();
            }
        }

        self.make_token(TokenType::Number)
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

        // The closing quote.
        self.advance();
        self.make_token(TokenType::String)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_types(source: &str) -> Vec<TokenType> {
        let mut scanner = Scanner::new(source);
        let mut types = Vec::new();
        loop {
            let token = scanner.scan_token();
            types.push(token.ttype);
            if matches!(token.ttype, TokenType::Eof | TokenType::Error) {
                break;
            }
        }
        types
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(token_types(""), vec![TokenType::Eof]);
    }

    #[test]
    fn test_unexpected_character() {
        let mut scanner = Scanner::new("#");
        let token = scanner.scan_token();
        assert_eq!(token.ttype, TokenType::Error);
        assert_eq!(token.lexeme, "Unexpected character.");
    }

    #[test]
    fn test_single_character_tokens() {
        use TokenType::*;
        let cases: [(&str, TokenType); 15] = [
            ("(", LeftParen),
            (")", RightParen),
            ("{", LeftBrace),
            ("}", RightBrace),
            ("[", LeftBracket),
            ("]", RightBracket),
            (";", Semicolon),
            (":", Colon),
            (",", Comma),
            (".", Dot),
            ("-", Minus),
            ("+", Plus),
            ("?", Question),
            ("/", Slash),
            ("*", Star),
        ];
        for (source, expected) in cases {
            assert_eq!(token_types(source), vec![expected, Eof], "source: {source}");
        }
    }

    #[test]
    fn test_one_or_two_character_tokens() {
        use TokenType::*;
        let cases: [(&str, Vec<TokenType>); 10] = [
            ("!", vec![Bang, Eof]),
            ("!!", vec![Bang, Bang, Eof]),
            ("!=", vec![BangEqual, Eof]),
            ("=", vec![Equal, Eof]),
            ("==", vec![EqualEqual, Eof]),
            ("<", vec![Less, Eof]),
            ("<=", vec![LessEqual, Eof]),
            (">", vec![Greater, Eof]),
            (">=", vec![GreaterEqual, Eof]),
            ("==!=", vec![EqualEqual, BangEqual, Eof]),
        ];
        for (source, expected) in cases {
            assert_eq!(token_types(source), expected, "source: {source}");
        }
    }

    #[test]
    fn test_keywords() {
        use TokenType::*;
        let cases: [(&str, TokenType); 20] = [
            ("and", And),
            ("case", Case),
            ("class", Class),
            ("continue", Continue),
            ("default", Default),
            ("else", Else),
            ("false", False),
            ("for", For),
            ("fun", Fun),
            ("if", If),
            ("nil", Nil),
            ("or", Or),
            ("print", Print),
            ("return", Return),
            ("super", Super),
            ("switch", Switch),
            ("this", This),
            ("true", True),
            ("var", Var),
            ("while", While),
        ];
        for (source, expected) in cases {
            assert_eq!(token_types(source), vec![expected, Eof], "source: {source}");
        }
    }

    #[test]
    fn test_keyword_prefixes_are_identifiers() {
        use TokenType::*;
        for source in ["an", "classy", "fo", "supers", "whil", "_var", "var_"] {
            assert_eq!(token_types(source), vec![Identifier, Eof], "source: {source}");
        }
    }

    #[test]
    fn test_numbers() {
        use TokenType::*;
        assert_eq!(token_types("123"), vec![Number, Eof]);
        assert_eq!(token_types("1.5"), vec![Number, Eof]);
        // A trailing dot is scanned as a separate token.
        assert_eq!(token_types("123."), vec![Number, Dot, Eof]);
        assert_eq!(token_types(".5"), vec![Dot, Number, Eof]);
    }

    #[test]
    fn test_string_lexeme_keeps_quotes() {
        let mut scanner = Scanner::new("\"hi\"");
        let token = scanner.scan_token();
        assert_eq!(token.ttype, TokenType::String);
        assert_eq!(token.lexeme, "\"hi\"");
    }

    #[test]
    fn test_unterminated_string() {
        let mut scanner = Scanner::new("\"never closed");
        let token = scanner.scan_token();
        assert_eq!(token.ttype, TokenType::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }

    #[test]
    fn test_line_counting() {
        let cases = [
            (1, ""),
            (2, "\n"),
            (3, "\n\n"),
            (1, "//"),
            (2, "//\n"),
            (3, "//\n//\n"),
            (1, "\"\""),
            (2, "\"\"\n"),
            // Newlines inside string literals count too.
            (3, "\"\n\"\n"),
        ];
        for (lines, source) in cases {
            let mut scanner = Scanner::new(source);
            let mut token = scanner.scan_token();
            while !matches!(token.ttype, TokenType::Eof | TokenType::Error) {
                token = scanner.scan_token();
            }
            assert_eq!(token.ttype, TokenType::Eof);
            assert_eq!(token.line, lines, "source: {source:?}");
        }
    }

    #[test]
    fn test_comments_are_skipped() {
        use TokenType::*;
        assert_eq!(token_types("//print 1;"), vec![Eof]);
        assert_eq!(token_types("print//x\n1;"), vec![Print, Number, Semicolon, Eof]);
    }

    #[test]
    fn test_eof_is_sticky() {
        let mut scanner = Scanner::new("1");
        assert_eq!(scanner.scan_token().ttype, TokenType::Number);
        for _ in 0..3 {
            assert_eq!(scanner.scan_token().ttype, TokenType::Eof);
        }
    }

    #[test]
    fn test_non_ascii_bytes_preserved_in_strings() {
        let mut scanner = Scanner::new("\"héllo\"");
        let token = scanner.scan_token();
        assert_eq!(token.ttype, TokenType::String);
        assert_eq!(token.lexeme, "\"héllo\"");
    }
}

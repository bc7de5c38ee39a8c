//! Query Lexer
//!
//! Tokenizes the textual statements produced by the query builder.
//!
//! Example:
//! ```text
//! SELECT name, customers.name FROM orders WHERE total > 100 ORDER BY name DESC LIMIT 10
//! ```

use crate::error::{DbError, Result};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Select,
    From,
    Where,
    Having,
    OrderBy,
    Asc,
    Desc,
    Limit,
    Offset,
    Delete,
    Update,
    Set,
    Insert,
    Into,
    Values,
    And,
    Or,
    Not,
    As,
    Like,
    Is,

    // Literals
    Identifier(String),
    String(String),
    Integer(u64),
    Float(f64),
    True,
    False,
    Null,

    // Operators
    Equal,         // =
    NotEqual,      // != or <>
    LessThan,      // <
    LessThanEq,    // <=
    GreaterThan,   // >
    GreaterThanEq, // >=
    Minus,         // -
    Star,          // *
    Dot,           // .
    Comma,         // ,
    Semicolon,     // ;

    // Brackets
    LeftParen,    // (
    RightParen,   // )
    LeftBracket,  // [
    RightBracket, // ]

    // Special
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(s) => write!(f, "Identifier({})", s),
            Token::String(s) => write!(f, "String(\"{}\")", s),
            Token::Integer(n) => write!(f, "Integer({})", n),
            Token::Float(n) => write!(f, "Float({})", n),
            _ => write!(f, "{:?}", self),
        }
    }
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
    current_char: Option<char>,
    after_dot: bool,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        let chars: Vec<char> = input.chars().collect();
        let current = chars.first().copied();
        Lexer {
            input: chars,
            position: 0,
            current_char: current,
            after_dot: false,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        loop {
            let token = self.next_token()?;
            self.after_dot = token == Token::Dot;
            if token == Token::Eof {
                tokens.push(token);
                break;
            }
            tokens.push(token);
        }

        Ok(tokens)
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace();

        match self.current_char {
            None => Ok(Token::Eof),
            Some(ch) => {
                if ch.is_alphabetic() || ch == '_' {
                    self.read_identifier()
                } else if ch.is_ascii_digit() {
                    self.read_number()
                } else if ch == '\'' || ch == '"' {
                    self.read_string()
                } else if ch == '`' {
                    self.read_quoted_identifier()
                } else {
                    self.read_operator()
                }
            }
        }
    }

    fn advance(&mut self) {
        self.position += 1;
        self.current_char = self.input.get(self.position).copied();
    }

    fn peek(&self) -> Option<char> {
        self.input.get(self.position + 1).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_word(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current_char {
            if ch.is_alphanumeric() || ch == '_' {
                result.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        result
    }

    fn read_identifier(&mut self) -> Result<Token> {
        let result = self.read_word();

        // Path segments after a dot are never keywords
        if self.after_dot {
            return Ok(Token::Identifier(result));
        }

        let token = match result.to_uppercase().as_str() {
            "SELECT" => Token::Select,
            "FROM" => Token::From,
            "WHERE" => Token::Where,
            "HAVING" => Token::Having,
            "ASC" => Token::Asc,
            "DESC" => Token::Desc,
            "LIMIT" => Token::Limit,
            "OFFSET" => Token::Offset,
            "DELETE" => Token::Delete,
            "UPDATE" => Token::Update,
            "SET" => Token::Set,
            "INSERT" => Token::Insert,
            "INTO" => Token::Into,
            "VALUES" => Token::Values,
            "AND" => Token::And,
            "OR" => Token::Or,
            "NOT" => Token::Not,
            "AS" => Token::As,
            "LIKE" => Token::Like,
            "IS" => Token::Is,
            "TRUE" => Token::True,
            "FALSE" => Token::False,
            "NULL" => Token::Null,
            "ORDER" => {
                // Check for "ORDER BY"
                let saved = (self.position, self.current_char);
                self.skip_whitespace();
                let next = self.read_word();
                if next.eq_ignore_ascii_case("BY") {
                    return Ok(Token::OrderBy);
                }
                self.position = saved.0;
                self.current_char = saved.1;
                Token::Identifier(result)
            }
            _ => Token::Identifier(result),
        };

        Ok(token)
    }

    fn read_quoted_identifier(&mut self) -> Result<Token> {
        self.advance(); // skip opening backtick
        let mut result = String::new();
        while let Some(ch) = self.current_char {
            if ch == '`' {
                self.advance();
                return Ok(Token::Identifier(result));
            }
            result.push(ch);
            self.advance();
        }
        Err(DbError::Parse("Unterminated quoted identifier".to_string()))
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    /// Unsigned number; a leading minus is a separate token. Integers keep
    /// the full `u64` magnitude so the parser can negate `i64::MIN`.
    fn read_number(&mut self) -> Result<Token> {
        let mut result = String::new();
        let mut is_float = false;
        let mut has_exponent = false;

        while let Some(ch) = self.current_char {
            if ch.is_ascii_digit() {
                result.push(ch);
                self.advance();
            } else if ch == '.' && !is_float && !has_exponent && !self.after_dot {
                // Only a float if a digit follows the dot
                match self.peek() {
                    Some(next) if next.is_ascii_digit() => {
                        is_float = true;
                        result.push(ch);
                        self.advance();
                    }
                    _ => break,
                }
            } else if (ch == 'e' || ch == 'E') && !has_exponent && !self.after_dot {
                // Exponent: e[+-]digits, otherwise the 'e' starts an identifier
                let digits_at = match self.peek() {
                    Some('+') | Some('-') => 2,
                    _ => 1,
                };
                if !self.peek_at(digits_at).map_or(false, |c| c.is_ascii_digit()) {
                    break;
                }
                has_exponent = true;
                for _ in 0..digits_at {
                    if let Some(c) = self.current_char {
                        result.push(c);
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }

        if is_float || has_exponent {
            result
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|e| DbError::Parse(format!("Invalid float: {}", e)))
        } else if self.after_dot {
            // Numeric path segment, e.g. tags.0
            Ok(Token::Identifier(result))
        } else {
            result
                .parse::<u64>()
                .map(Token::Integer)
                .map_err(|e| DbError::Parse(format!("Invalid integer: {}", e)))
        }
    }

    fn read_string(&mut self) -> Result<Token> {
        let quote_char = match self.current_char {
            Some(c) => c,
            None => return Err(DbError::Parse("Expected string literal".to_string())),
        };
        self.advance(); // skip opening quote

        let mut result = String::new();
        let mut escaped = false;

        while let Some(ch) = self.current_char {
            if escaped {
                match ch {
                    'n' => result.push('\n'),
                    't' => result.push('\t'),
                    'r' => result.push('\r'),
                    '\\' => result.push('\\'),
                    '\'' => result.push('\''),
                    '"' => result.push('"'),
                    _ => {
                        result.push('\\');
                        result.push(ch);
                    }
                }
                escaped = false;
                self.advance();
            } else if ch == '\\' {
                escaped = true;
                self.advance();
            } else if ch == quote_char {
                self.advance(); // skip closing quote
                return Ok(Token::String(result));
            } else {
                result.push(ch);
                self.advance();
            }
        }

        Err(DbError::Parse("Unterminated string literal".to_string()))
    }

    fn read_operator(&mut self) -> Result<Token> {
        let ch = match self.current_char {
            Some(c) => c,
            None => return Ok(Token::Eof),
        };
        let next = self.peek();

        let (token, width) = match (ch, next) {
            ('=', _) => (Token::Equal, 1),
            ('!', Some('=')) => (Token::NotEqual, 2),
            ('<', Some('>')) => (Token::NotEqual, 2),
            ('<', Some('=')) => (Token::LessThanEq, 2),
            ('<', _) => (Token::LessThan, 1),
            ('>', Some('=')) => (Token::GreaterThanEq, 2),
            ('>', _) => (Token::GreaterThan, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            (';', _) => (Token::Semicolon, 1),
            ('(', _) => (Token::LeftParen, 1),
            (')', _) => (Token::RightParen, 1),
            ('[', _) => (Token::LeftBracket, 1),
            (']', _) => (Token::RightBracket, 1),
            _ => return Err(DbError::Parse(format!("Unexpected character: {}", ch))),
        };

        for _ in 0..width {
            self.advance();
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords() {
        let mut lexer = Lexer::new("SELECT FROM WHERE having ORDER  BY");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::Select);
        assert_eq!(tokens[1], Token::From);
        assert_eq!(tokens[2], Token::Where);
        assert_eq!(tokens[3], Token::Having);
        assert_eq!(tokens[4], Token::OrderBy);
    }

    #[test]
    fn test_numbers() {
        let mut lexer = Lexer::new("42 3.14 0 -1");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::Integer(42));
        assert_eq!(tokens[1], Token::Float(3.14));
        assert_eq!(tokens[2], Token::Integer(0));
        assert_eq!(tokens[3], Token::Minus);
        assert_eq!(tokens[4], Token::Integer(1));
    }

    #[test]
    fn test_exponents_and_wide_integers() {
        let mut lexer = Lexer::new("1e-5 2.5E+3 1e21 9223372036854775808 3 e");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::Float(1e-5));
        assert_eq!(tokens[1], Token::Float(2500.0));
        assert_eq!(tokens[2], Token::Float(1e21));
        assert_eq!(tokens[3], Token::Integer(9_223_372_036_854_775_808));
        assert_eq!(tokens[4], Token::Integer(3));
        assert_eq!(tokens[5], Token::Identifier("e".to_string()));

        let mut lexer = Lexer::new("7ex");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::Integer(7));
        assert_eq!(tokens[1], Token::Identifier("ex".to_string()));
    }

    #[test]
    fn test_path_segments_after_dot() {
        let mut lexer = Lexer::new("tags.0.5 orders.order");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::Identifier("tags".to_string()));
        assert_eq!(tokens[1], Token::Dot);
        assert_eq!(tokens[2], Token::Identifier("0".to_string()));
        assert_eq!(tokens[3], Token::Dot);
        assert_eq!(tokens[4], Token::Identifier("5".to_string()));
        assert_eq!(tokens[6], Token::Dot);
        assert_eq!(tokens[7], Token::Identifier("order".to_string()));
    }

    #[test]
    fn test_strings() {
        let mut lexer = Lexer::new(r#"'hello' "world" 'it\'s'"#);
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::String("hello".to_string()));
        assert_eq!(tokens[1], Token::String("world".to_string()));
        assert_eq!(tokens[2], Token::String("it's".to_string()));
    }

    #[test]
    fn test_operators() {
        let mut lexer = Lexer::new("= != <> < <= > >=");
        let tokens = lexer.tokenize().unwrap();
        assert_eq!(tokens[0], Token::Equal);
        assert_eq!(tokens[1], Token::NotEqual);
        assert_eq!(tokens[2], Token::NotEqual);
        assert_eq!(tokens[3], Token::LessThan);
        assert_eq!(tokens[4], Token::LessThanEq);
        assert_eq!(tokens[5], Token::GreaterThan);
        assert_eq!(tokens[6], Token::GreaterThanEq);
    }

    #[test]
    fn test_unterminated_string() {
        let mut lexer = Lexer::new("'open");
        assert!(lexer.tokenize().is_err());
    }
}

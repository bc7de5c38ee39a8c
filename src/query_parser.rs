//! Query Parser
//!
//! Converts the token stream from the lexer into a [`Statement`]. The parser
//! knows nothing about the schema: dotted names come out as unresolved
//! [`ColumnRef::Column`] / [`ColumnRef::Path`] and are resolved by the query
//! builder.

use crate::error::{DbError, Result};
use crate::query_ast::*;
use crate::query_lexer::{Lexer, Token};
use crate::types::Value;

pub struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

/// Function-call column item before classification
enum Item {
    Column(SelectColumn),
    Exists,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            position: 0,
        }
    }

    /// Parse a statement string
    pub fn parse(text: &str) -> Result<Statement> {
        let mut lexer = Lexer::new(text);
        let tokens = lexer.tokenize()?;
        let mut parser = Parser::new(tokens);
        let statement = parser.parse_statement()?;
        parser.finish()?;
        Ok(statement)
    }

    /// Parse a bare boolean expression (constraints, where fragments)
    pub fn parse_condition(text: &str) -> Result<Condition> {
        let mut lexer = Lexer::new(text);
        let tokens = lexer.tokenize()?;
        let mut parser = Parser::new(tokens);
        let condition = parser.parse_or()?;
        parser.finish()?;
        Ok(condition)
    }

    /// Parse a comma-separated output-column list
    pub fn parse_columns(text: &str) -> Result<Vec<SelectColumn>> {
        let mut lexer = Lexer::new(text);
        let tokens = lexer.tokenize()?;
        let mut parser = Parser::new(tokens);
        let items = parser.parse_column_list()?;
        parser.finish()?;
        items
            .into_iter()
            .map(|item| match item {
                Item::Column(c) => Ok(c),
                Item::Exists => Err(DbError::Parse(
                    "exists() is only valid as the sole column".to_string(),
                )),
            })
            .collect()
    }

    /// Parse top-level statement
    pub fn parse_statement(&mut self) -> Result<Statement> {
        match self.current() {
            Token::Select => self.parse_select(),
            Token::Delete => self.parse_delete(),
            Token::Update => self.parse_update(),
            Token::Insert => self.parse_insert(),
            other => Err(DbError::Parse(format!(
                "Expected statement keyword, got {:?}",
                other
            ))),
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.current() == &Token::Semicolon {
            self.advance();
        }
        if self.current() != &Token::Eof {
            return Err(DbError::Parse(format!(
                "Unexpected trailing token {:?}",
                self.current()
            )));
        }
        Ok(())
    }

    /// SELECT, including the count/exists shapes
    fn parse_select(&mut self) -> Result<Statement> {
        self.expect(&Token::Select)?;
        let items = self.parse_column_list()?;

        self.expect(&Token::From)?;
        let table = self.parse_identifier()?;

        let where_clause = self.parse_optional_where()?;

        let having = if self.current() == &Token::Having {
            self.advance();
            Some(self.parse_or()?)
        } else {
            None
        };

        let order_by = self.parse_optional_order_by()?;
        let (limit, offset) = self.parse_optional_limit()?;

        let has_exists = items.iter().any(|i| matches!(i, Item::Exists));
        if has_exists {
            if items.len() != 1 {
                return Err(DbError::Parse(
                    "exists() must be the only selected column".to_string(),
                ));
            }
            return Ok(Statement::Exists(QueryParts {
                table,
                where_clause,
                ..Default::default()
            }));
        }

        let columns: Vec<SelectColumn> = items
            .into_iter()
            .filter_map(|i| match i {
                Item::Column(c) => Some(c),
                Item::Exists => None,
            })
            .collect();

        let plain_count = match columns.as_slice() {
            [SelectColumn {
                expr: ColumnExpr::Aggregate(AggregateFunction::Count, column),
                alias: None,
            }] if having.is_none() && order_by.is_empty() && limit.is_none() && offset.is_none() => {
                Some(column.clone())
            }
            _ => None,
        };

        let parts = QueryParts {
            table,
            columns,
            where_clause,
            having,
            order_by,
            limit,
            offset,
            ..Default::default()
        };

        match plain_count {
            Some(column) => Ok(Statement::Count {
                parts: QueryParts {
                    columns: Vec::new(),
                    ..parts
                },
                column,
            }),
            None => Ok(Statement::Select(parts)),
        }
    }

    fn parse_column_list(&mut self) -> Result<Vec<Item>> {
        let mut items = Vec::new();

        loop {
            let item = if self.current() == &Token::Star {
                self.advance();
                Item::Column(SelectColumn::new(ColumnExpr::Star))
            } else if matches!(self.current(), Token::Identifier(_))
                && self.peek() == Some(&Token::LeftParen)
            {
                let name = self.parse_identifier()?;
                if name.eq_ignore_ascii_case("exists") {
                    self.expect(&Token::LeftParen)?;
                    self.expect(&Token::Star)?;
                    self.expect(&Token::RightParen)?;
                    Item::Exists
                } else {
                    let (func, column) = self.parse_aggregate_call(&name)?;
                    Item::Column(SelectColumn {
                        expr: ColumnExpr::Aggregate(func, column),
                        alias: self.parse_optional_alias()?,
                    })
                }
            } else {
                let column = self.parse_column_ref()?;
                Item::Column(SelectColumn {
                    expr: ColumnExpr::Ref(column),
                    alias: self.parse_optional_alias()?,
                })
            };
            items.push(item);

            if self.current() == &Token::Comma {
                self.advance();
            } else {
                break;
            }
        }

        Ok(items)
    }

    fn parse_optional_alias(&mut self) -> Result<Option<String>> {
        if self.current() == &Token::As {
            self.advance();
            Ok(Some(self.parse_identifier()?))
        } else {
            Ok(None)
        }
    }

    /// `name(` already peeked; parses `name(*)` or `name(column)`
    fn parse_aggregate_call(&mut self, name: &str) -> Result<(AggregateFunction, Option<ColumnRef>)> {
        let func = AggregateFunction::from_name(name)
            .ok_or_else(|| DbError::Parse(format!("Unknown function '{}'", name)))?;
        self.expect(&Token::LeftParen)?;
        let column = if self.current() == &Token::Star {
            self.advance();
            None
        } else {
            Some(self.parse_column_ref()?)
        };
        self.expect(&Token::RightParen)?;
        Ok((func, column))
    }

    /// Dotted identifier path
    fn parse_column_ref(&mut self) -> Result<ColumnRef> {
        let mut segments = vec![self.parse_identifier()?];
        while self.current() == &Token::Dot {
            self.advance();
            segments.push(self.parse_identifier()?);
        }
        ColumnRef::from_segments(segments)
            .ok_or_else(|| DbError::Parse("Empty column reference".to_string()))
    }

    fn parse_optional_where(&mut self) -> Result<Option<Condition>> {
        if self.current() == &Token::Where {
            self.advance();
            Ok(Some(self.parse_or()?))
        } else {
            Ok(None)
        }
    }

    fn parse_optional_order_by(&mut self) -> Result<Vec<OrderBy>> {
        let mut fields = Vec::new();
        if self.current() != &Token::OrderBy {
            return Ok(fields);
        }
        self.advance();

        loop {
            let column = self.parse_column_ref()?;
            let direction = match self.current() {
                Token::Asc => {
                    self.advance();
                    Direction::Asc
                }
                Token::Desc => {
                    self.advance();
                    Direction::Desc
                }
                _ => Direction::Asc,
            };
            fields.push(OrderBy { column, direction });

            if self.current() == &Token::Comma {
                self.advance();
            } else {
                break;
            }
        }

        Ok(fields)
    }

    fn parse_optional_limit(&mut self) -> Result<(Option<usize>, Option<usize>)> {
        let limit = if self.current() == &Token::Limit {
            self.advance();
            Some(self.parse_count()?)
        } else {
            None
        };
        let offset = if self.current() == &Token::Offset {
            self.advance();
            Some(self.parse_count()?)
        } else {
            None
        };
        Ok((limit, offset))
    }

    fn parse_or(&mut self) -> Result<Condition> {
        let mut left = self.parse_and()?;

        while self.current() == &Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition> {
        let mut left = self.parse_leaf()?;

        while self.current() == &Token::And {
            self.advance();
            let right = self.parse_leaf()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn parse_leaf(&mut self) -> Result<Condition> {
        if self.current() == &Token::LeftParen {
            self.advance();
            let inner = self.parse_or()?;
            self.expect(&Token::RightParen)?;
            return Ok(inner);
        }

        let left = self.parse_operand()?;
        let op = self.parse_operator()?;
        let right = self.parse_operand()?;
        Ok(Condition::Compare { left, op, right })
    }

    fn parse_operator(&mut self) -> Result<Operator> {
        let op = match self.current() {
            Token::Equal => Operator::Eq,
            Token::NotEqual => Operator::NotEq,
            Token::LessThan => Operator::Lt,
            Token::LessThanEq => Operator::LtEq,
            Token::GreaterThan => Operator::Gt,
            Token::GreaterThanEq => Operator::GtEq,
            Token::Like => Operator::Like,
            Token::Not => {
                self.advance();
                self.expect(&Token::Like)?;
                return Ok(Operator::NotLike);
            }
            Token::Is => {
                self.advance();
                if self.current() == &Token::Not {
                    self.advance();
                    return Ok(Operator::IsNot);
                }
                return Ok(Operator::Is);
            }
            other => {
                return Err(DbError::Parse(format!(
                    "Expected comparison operator, got {:?}",
                    other
                )))
            }
        };
        self.advance();
        Ok(op)
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.current().clone() {
            Token::Identifier(_) if self.peek() == Some(&Token::LeftParen) => {
                let name = self.parse_identifier()?;
                let (func, column) = self.parse_aggregate_call(&name)?;
                Ok(Operand::Aggregate(func, column))
            }
            Token::Identifier(_) => Ok(Operand::Column(self.parse_column_ref()?)),
            _ => Ok(Operand::Literal(self.parse_literal()?)),
        }
    }

    fn parse_literal(&mut self) -> Result<Value> {
        match self.current().clone() {
            Token::Integer(n) => {
                self.advance();
                i64::try_from(n)
                    .map(Value::Int)
                    .map_err(|_| DbError::Parse(format!("Integer {} out of range", n)))
            }
            Token::Float(f) => {
                self.advance();
                Ok(Value::Float(f))
            }
            Token::String(s) => {
                self.advance();
                Ok(Value::String(s))
            }
            Token::True => {
                self.advance();
                Ok(Value::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Value::Bool(false))
            }
            Token::Null => {
                self.advance();
                Ok(Value::Null)
            }
            Token::Minus => {
                self.advance();
                match self.current().clone() {
                    Token::Integer(n) => {
                        self.advance();
                        if n == i64::MIN.unsigned_abs() {
                            return Ok(Value::Int(i64::MIN));
                        }
                        i64::try_from(n)
                            .map(|v| Value::Int(-v))
                            .map_err(|_| DbError::Parse(format!("Integer -{} out of range", n)))
                    }
                    Token::Float(f) => {
                        self.advance();
                        Ok(Value::Float(-f))
                    }
                    other => Err(DbError::Parse(format!(
                        "Expected number after '-', got {:?}",
                        other
                    ))),
                }
            }
            Token::LeftBracket => {
                self.advance();
                let mut items = Vec::new();
                if self.current() != &Token::RightBracket {
                    loop {
                        items.push(self.parse_literal()?);
                        if self.current() == &Token::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RightBracket)?;
                Ok(Value::List(items))
            }
            other => Err(DbError::Parse(format!("Expected literal, got {:?}", other))),
        }
    }

    /// Parse DELETE statement
    fn parse_delete(&mut self) -> Result<Statement> {
        self.expect(&Token::Delete)?;
        self.expect(&Token::From)?;

        let table = self.parse_identifier()?;
        let where_clause = self.parse_optional_where()?;
        let order_by = self.parse_optional_order_by()?;
        let (limit, offset) = self.parse_optional_limit()?;

        Ok(Statement::Delete(QueryParts {
            table,
            where_clause,
            order_by,
            limit,
            offset,
            ..Default::default()
        }))
    }

    /// Parse UPDATE statement
    fn parse_update(&mut self) -> Result<Statement> {
        self.expect(&Token::Update)?;

        let table = self.parse_identifier()?;
        self.expect(&Token::Set)?;

        let mut assignments = Vec::new();
        loop {
            let column = self.parse_identifier()?;
            self.expect(&Token::Equal)?;
            let value = self.parse_literal()?;
            assignments.push(Assignment { column, value });

            if self.current() == &Token::Comma {
                self.advance();
            } else {
                break;
            }
        }

        let where_clause = self.parse_optional_where()?;

        Ok(Statement::Update {
            parts: QueryParts {
                table,
                where_clause,
                ..Default::default()
            },
            assignments,
        })
    }

    /// Parse INSERT statement
    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect(&Token::Insert)?;
        self.expect(&Token::Into)?;

        let table = self.parse_identifier()?;

        self.expect(&Token::LeftParen)?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_identifier()?);
            if self.current() == &Token::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Token::RightParen)?;

        self.expect(&Token::Values)?;
        self.expect(&Token::LeftParen)?;
        let mut values = Vec::new();
        loop {
            values.push(self.parse_literal()?);
            if self.current() == &Token::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&Token::RightParen)?;

        if columns.len() != values.len() {
            return Err(DbError::Parse(format!(
                "INSERT lists {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }

        Ok(Statement::Insert {
            table,
            assignments: columns
                .into_iter()
                .zip(values)
                .map(|(column, value)| Assignment { column, value })
                .collect(),
        })
    }

    // Helper methods

    fn current(&self) -> &Token {
        self.tokens.get(self.position).unwrap_or(&Token::Eof)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position + 1)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        if std::mem::discriminant(self.current()) == std::mem::discriminant(expected) {
            self.advance();
            Ok(())
        } else {
            Err(DbError::Parse(format!(
                "Expected {:?}, got {:?}",
                expected,
                self.current()
            )))
        }
    }

    fn parse_identifier(&mut self) -> Result<String> {
        if let Token::Identifier(name) = self.current() {
            let result = name.clone();
            self.advance();
            Ok(result)
        } else {
            Err(DbError::Parse(format!(
                "Expected identifier, got {:?}",
                self.current()
            )))
        }
    }

    fn parse_count(&mut self) -> Result<usize> {
        if let Token::Integer(n) = self.current() {
            let result = *n;
            self.advance();
            usize::try_from(result)
                .map_err(|_| DbError::Parse(format!("Count {} out of range", result)))
        } else {
            Err(DbError::Parse(format!(
                "Expected integer, got {:?}",
                self.current()
            )))
        }
    }
}

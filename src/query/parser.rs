use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::lexer::{tokenize, Spanned, Token};

/// Parsed query program
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `name = expr`
    Assign { target: String, expr: Expr },
    /// `RETURN = expr`
    Return(Expr),
    /// Statement that failed to parse. When the assignment target could still
    /// be read, it is bound to an empty sequence at evaluation time.
    Invalid {
        target: Option<String>,
        error: ParseError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Variable(String),
    Call { function: Function, args: Vec<Expr> },
}

/// The closed set of query operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    QueryBucket,
    FindBucket,
    FilterKeyvals,
    FilterPeriodIntersect,
    MergeEventsByKeys,
    SortByDuration,
    SortByTimestamp,
    SumDurations,
    LimitEvents,
    Concat,
    UnionNoOverlap,
    PeriodUnion,
    Categorize,
    Flood,
    Nop,
}

impl Function {
    pub fn name(&self) -> &'static str {
        match self {
            Function::QueryBucket => "query_bucket",
            Function::FindBucket => "find_bucket",
            Function::FilterKeyvals => "filter_keyvals",
            Function::FilterPeriodIntersect => "filter_period_intersect",
            Function::MergeEventsByKeys => "merge_events_by_keys",
            Function::SortByDuration => "sort_by_duration",
            Function::SortByTimestamp => "sort_by_timestamp",
            Function::SumDurations => "sum_durations",
            Function::LimitEvents => "limit_events",
            Function::Concat => "concat",
            Function::UnionNoOverlap => "union_no_overlap",
            Function::PeriodUnion => "period_union",
            Function::Categorize => "categorize",
            Function::Flood => "flood",
            Function::Nop => "nop",
        }
    }

    /// Accepted argument counts, inclusive
    pub fn arity(&self) -> (usize, usize) {
        match self {
            Function::QueryBucket => (1, 1),
            Function::FindBucket => (1, 2),
            Function::FilterKeyvals => (3, 3),
            Function::FilterPeriodIntersect => (2, 2),
            Function::MergeEventsByKeys => (2, 2),
            Function::SortByDuration | Function::SortByTimestamp => (1, 1),
            Function::SumDurations => (1, 1),
            Function::LimitEvents => (2, 2),
            Function::Concat | Function::UnionNoOverlap | Function::PeriodUnion => (2, 2),
            Function::Categorize => (1, 2),
            Function::Flood | Function::Nop => (1, 1),
        }
    }
}

impl FromStr for Function {
    type Err = ParseError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let function = match name {
            "query_bucket" => Function::QueryBucket,
            "find_bucket" => Function::FindBucket,
            "filter_keyvals" => Function::FilterKeyvals,
            "filter_period_intersect" => Function::FilterPeriodIntersect,
            "merge_events_by_keys" => Function::MergeEventsByKeys,
            "sort_by_duration" => Function::SortByDuration,
            "sort_by_timestamp" => Function::SortByTimestamp,
            "sum_durations" => Function::SumDurations,
            "limit_events" => Function::LimitEvents,
            "concat" => Function::Concat,
            "union_no_overlap" => Function::UnionNoOverlap,
            "period_union" => Function::PeriodUnion,
            "categorize" => Function::Categorize,
            "flood" => Function::Flood,
            "nop" => Function::Nop,
            other => return Err(ParseError::UnknownFunction(other.to_string())),
        };
        Ok(function)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("line {line}: unexpected {found}")]
    UnexpectedToken { found: String, line: usize },

    #[error("unexpected end of statement")]
    UnexpectedEnd,

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("{function} takes {min}..={max} arguments, got {found}")]
    Arity {
        function: Function,
        min: usize,
        max: usize,
        found: usize,
    },

    #[error("line {0}: statement is not an assignment")]
    NotAssignment(usize),
}

/// Parse query text into a program.
///
/// Never fails as a whole; each statement that cannot be parsed becomes a
/// [`Statement::Invalid`] and parsing resumes at the next terminator.
pub fn parse_program(source: &str) -> Program {
    let tokens = tokenize(source);
    let statements = tokens
        .split(|t| t.token.is_terminator())
        .filter(|chunk| !chunk.is_empty())
        .map(parse_statement)
        .collect();
    Program { statements }
}

fn parse_statement(tokens: &[Spanned]) -> Statement {
    let target = match tokens {
        [Spanned { token: Token::Ident(name), .. }, Spanned { token: Token::Assign, .. }, ..] => {
            name.clone()
        }
        _ => {
            return Statement::Invalid {
                target: None,
                error: ParseError::NotAssignment(tokens[0].line),
            }
        }
    };

    let mut parser = Parser {
        tokens: &tokens[2..],
        pos: 0,
    };
    let result = parser.expr().and_then(|expr| parser.finish().map(|_| expr));

    match result {
        Ok(expr) if target == "RETURN" => Statement::Return(expr),
        Ok(expr) => Statement::Assign { target, expr },
        Err(error) => Statement::Invalid {
            target: Some(target),
            error,
        },
    }
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn next(&mut self) -> Result<&'a Spanned, ParseError> {
        let spanned = self.tokens.get(self.pos).ok_or(ParseError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(spanned)
    }

    fn unexpected(spanned: &Spanned) -> ParseError {
        ParseError::UnexpectedToken {
            found: spanned.token.to_string(),
            line: spanned.line,
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ParseError> {
        let spanned = self.next()?;
        if &spanned.token == expected {
            Ok(())
        } else {
            Err(Self::unexpected(spanned))
        }
    }

    fn finish(&self) -> Result<(), ParseError> {
        match self.tokens.get(self.pos) {
            None => Ok(()),
            Some(spanned) => Err(Self::unexpected(spanned)),
        }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let spanned = self.next()?;
        match &spanned.token {
            Token::Str(s) => Ok(Expr::String(s.clone())),
            Token::Number(n) => Ok(Expr::Number(*n)),
            Token::LBracket => Ok(Expr::List(self.sequence(&Token::RBracket)?)),
            Token::LBrace => self.object(),
            Token::Ident(name) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    return self.call(name);
                }
                Ok(match name.as_str() {
                    "true" | "True" => Expr::Bool(true),
                    "false" | "False" => Expr::Bool(false),
                    "null" | "None" => Expr::Null,
                    _ => Expr::Variable(name.clone()),
                })
            }
            _ => Err(Self::unexpected(spanned)),
        }
    }

    fn call(&mut self, name: &str) -> Result<Expr, ParseError> {
        let function: Function = name.parse()?;
        let args = self.sequence(&Token::RParen)?;
        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            return Err(ParseError::Arity {
                function,
                min,
                max,
                found: args.len(),
            });
        }
        Ok(Expr::Call { function, args })
    }

    /// Comma separated expressions up to `close`; a trailing comma is allowed
    fn sequence(&mut self, close: &Token) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(self.expr()?);
            match self.next()? {
                Spanned { token: Token::Comma, .. } => continue,
                Spanned { token, .. } if token == close => return Ok(items),
                other => return Err(Self::unexpected(other)),
            }
        }
    }

    fn object(&mut self) -> Result<Expr, ParseError> {
        let mut entries = Vec::new();
        loop {
            let key = match self.next()? {
                Spanned { token: Token::RBrace, .. } => return Ok(Expr::Object(entries)),
                Spanned { token: Token::Str(key) | Token::Ident(key), .. } => key.clone(),
                other => return Err(Self::unexpected(other)),
            };
            self.expect(&Token::Colon)?;
            entries.push((key, self.expr()?));
            match self.next()? {
                Spanned { token: Token::Comma, .. } => continue,
                Spanned { token: Token::RBrace, .. } => return Ok(Expr::Object(entries)),
                other => return Err(Self::unexpected(other)),
            }
        }
    }
}

impl Program {
    pub fn has_errors(&self) -> bool {
        self.statements
            .iter()
            .any(|s| matches!(s, Statement::Invalid { .. }))
    }
}

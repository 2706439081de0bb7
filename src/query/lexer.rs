use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Assign,
    /// Explicit statement terminator
    Semicolon,
    /// Line break that ends a statement: outside any bracket, or while a
    /// call is still unclosed
    Newline,
    /// Character or literal the lexer could not read. Reported by the parser
    /// so that only the enclosing statement is lost.
    Invalid(String),
}

impl Token {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Token::Semicolon | Token::Newline)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::Str(s) => write!(f, "string \"{}\"", s),
            Token::Number(n) => write!(f, "number {}", n),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::LBrace => write!(f, "'{{'"),
            Token::RBrace => write!(f, "'}}'"),
            Token::Comma => write!(f, "','"),
            Token::Colon => write!(f, "':'"),
            Token::Assign => write!(f, "'='"),
            Token::Semicolon => write!(f, "';'"),
            Token::Newline => write!(f, "end of line"),
            Token::Invalid(s) => write!(f, "invalid input '{}'", s),
        }
    }
}

/// Token with the 1-based line it started on
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

/// Split query text into tokens. Never fails; unreadable input becomes
/// [`Token::Invalid`].
pub fn tokenize(source: &str) -> Vec<Spanned> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    /// Open brackets, innermost last. Newlines inside list and object
    /// literals are insignificant; calls must close on their own line.
    open: Vec<char>,
    out: Vec<Spanned>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            open: Vec::new(),
            out: Vec::new(),
        }
    }

    fn push(&mut self, token: Token, line: usize) {
        self.out.push(Spanned { token, line });
    }

    fn run(mut self) -> Vec<Spanned> {
        while let Some(c) = self.chars.next() {
            let line = self.line;
            match c {
                '\n' => {
                    if self.open.contains(&'(') {
                        // Unclosed call: the line is malformed, the next one starts fresh
                        self.open.clear();
                    }
                    if self.open.is_empty() {
                        self.push(Token::Newline, line);
                    }
                    self.line += 1;
                }
                c if c.is_whitespace() => {}
                '#' => {
                    while let Some(&next) = self.chars.peek() {
                        if next == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                }
                '(' | '[' | '{' => {
                    self.open.push(c);
                    let token = match c {
                        '(' => Token::LParen,
                        '[' => Token::LBracket,
                        _ => Token::LBrace,
                    };
                    self.push(token, line);
                }
                ')' | ']' | '}' => {
                    self.open.pop();
                    let token = match c {
                        ')' => Token::RParen,
                        ']' => Token::RBracket,
                        _ => Token::RBrace,
                    };
                    self.push(token, line);
                }
                ',' => self.push(Token::Comma, line),
                ':' => self.push(Token::Colon, line),
                '=' => self.push(Token::Assign, line),
                ';' => {
                    // A semicolon always closes the statement, even inside an
                    // unbalanced bracket
                    self.open.clear();
                    self.push(Token::Semicolon, line);
                }
                '"' | '\'' => {
                    let token = self.string(c);
                    self.push(token, line);
                }
                '-' if self.chars.peek().map_or(false, |n| n.is_ascii_digit()) => {
                    let token = self.number('-');
                    self.push(token, line);
                }
                c if c.is_ascii_digit() => {
                    let token = self.number(c);
                    self.push(token, line);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let mut ident = String::from(c);
                    while let Some(&next) = self.chars.peek() {
                        if next.is_alphanumeric() || next == '_' {
                            ident.push(next);
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    self.push(Token::Ident(ident), line);
                }
                other => self.push(Token::Invalid(other.to_string()), line),
            }
        }
        self.out
    }

    fn string(&mut self, quote: char) -> Token {
        let mut value = String::new();
        while let Some(c) = self.chars.next() {
            match c {
                c if c == quote => return Token::Str(value),
                '\\' => match self.chars.next() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some(other) => value.push(other),
                    None => break,
                },
                '\n' => {
                    self.line += 1;
                    break;
                }
                c => value.push(c),
            }
        }
        Token::Invalid(format!("{}{}", quote, value))
    }

    fn number(&mut self, first: char) -> Token {
        let mut text = String::from(first);
        while let Some(&next) = self.chars.peek() {
            let exponent_sign =
                (next == '-' || next == '+') && matches!(text.chars().last(), Some('e' | 'E'));
            if next.is_ascii_digit() || next == '.' || next == 'e' || next == 'E' || exponent_sign {
                text.push(next);
                self.chars.next();
            } else {
                break;
            }
        }
        match text.parse::<f64>() {
            Ok(n) => Token::Number(n),
            Err(_) => Token::Invalid(text),
        }
    }
}

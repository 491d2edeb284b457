//! Boolean selection expressions over target fields and labels, e.g.
//! `labels.env == "prod" && (name =~ "^web-" || !(labels.tier != "edge"))`.

use crate::errors::FleetError;
use crate::model::Target;
use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Eq,
    Ne,
    Match,
    NotMatch,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
enum Field {
    Name,
    PublicAddress,
    PrivateAddress,
    Label(String),
}

impl Field {
    fn resolve(name: &str) -> Result<Self, FleetError> {
        match name {
            "name" => Ok(Field::Name),
            "public_address" => Ok(Field::PublicAddress),
            "private_address" => Ok(Field::PrivateAddress),
            _ => match name.strip_prefix("labels.") {
                Some(key) if !key.is_empty() => Ok(Field::Label(key.to_string())),
                _ => Err(FleetError::directory(format!(
                    "unknown filter field '{}'",
                    name
                ))
                .with_hint("Use name, public_address, private_address or labels.<key>.")),
            },
        }
    }

    fn value<'a>(&self, target: &'a Target) -> &'a str {
        match self {
            Field::Name => &target.name,
            Field::PublicAddress => &target.public_address,
            Field::PrivateAddress => &target.private_address,
            Field::Label(key) => target.label(key),
        }
    }
}

#[derive(Debug, Clone)]
enum Comparison {
    Eq(String),
    Ne(String),
    Match(Regex),
    NotMatch(Regex),
}

#[derive(Debug, Clone)]
enum Node {
    Const(bool),
    Compare(Field, Comparison),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

impl Node {
    fn eval(&self, target: &Target) -> bool {
        match self {
            Node::Const(value) => *value,
            Node::Compare(field, cmp) => {
                let actual = field.value(target);
                match cmp {
                    Comparison::Eq(expected) => actual == expected,
                    Comparison::Ne(expected) => actual != expected,
                    Comparison::Match(re) => re.is_match(actual),
                    Comparison::NotMatch(re) => !re.is_match(actual),
                }
            }
            Node::Not(inner) => !inner.eval(target),
            Node::And(lhs, rhs) => lhs.eval(target) && rhs.eval(target),
            Node::Or(lhs, rhs) => lhs.eval(target) || rhs.eval(target),
        }
    }
}

fn syntax_error(message: impl Into<String>) -> FleetError {
    FleetError::directory(format!("invalid filter expression: {}", message.into()))
}

fn tokenize(input: &str) -> Result<Vec<Token>, FleetError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '=' if next == Some('~') => {
                tokens.push(Token::Match);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' if next == Some('~') => {
                tokens.push(Token::NotMatch);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(syntax_error("unterminated string literal")),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                value.push(*escaped);
                                i += 2;
                            } else {
                                return Err(syntax_error("dangling escape"));
                            }
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '-' | '.' | '/'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(syntax_error(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Node, FleetError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Node::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Node, FleetError> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Node::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Node, FleetError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Node, FleetError> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax_error("expected ')'")),
                }
            }
            Some(Token::Ident(word)) if word == "true" => Ok(Node::Const(true)),
            Some(Token::Ident(word)) if word == "false" => Ok(Node::Const(false)),
            Some(Token::Ident(word)) => {
                let field = Field::resolve(&word)?;
                let op = self
                    .bump()
                    .ok_or_else(|| syntax_error(format!("expected operator after '{}'", word)))?;
                let literal = match self.bump() {
                    Some(Token::Str(value)) | Some(Token::Ident(value)) => value,
                    _ => return Err(syntax_error(format!("expected value after '{}'", word))),
                };
                let comparison = match op {
                    Token::Eq => Comparison::Eq(literal),
                    Token::Ne => Comparison::Ne(literal),
                    Token::Match => Comparison::Match(compile(&literal)?),
                    Token::NotMatch => Comparison::NotMatch(compile(&literal)?),
                    _ => return Err(syntax_error(format!("expected operator after '{}'", word))),
                };
                Ok(Node::Compare(field, comparison))
            }
            Some(other) => Err(syntax_error(format!("unexpected token {:?}", other))),
            None => Err(syntax_error("unexpected end of expression")),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, FleetError> {
    Regex::new(pattern).map_err(|err| syntax_error(format!("bad regex '{}': {}", pattern, err)))
}

/// A parsed selection expression. The empty expression selects everything.
#[derive(Debug, Clone)]
pub struct TargetFilter {
    root: Node,
}

impl TargetFilter {
    pub fn all() -> Self {
        Self {
            root: Node::Const(true),
        }
    }

    pub fn parse(expression: &str) -> Result<Self, FleetError> {
        let tokens = tokenize(expression)?;
        if tokens.is_empty() {
            return Ok(Self::all());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(syntax_error(format!(
                "trailing input starting at {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(Self { root })
    }

    pub fn matches(&self, target: &Target) -> bool {
        self.root.eval(target)
    }

    pub fn select(&self, targets: Vec<Target>) -> Vec<Target> {
        targets.into_iter().filter(|t| self.matches(t)).collect()
    }
}

//! A small expression language and the JSON templates built on it.
//!
//! Expressions support literals, member access (`a.b`, `a['b']`, `a[0]`),
//! `.length`, comparison, `+`/`-`, `!`, `&&`/`||` and a handful of
//! functions (`len`, `lowercase`, `uppercase`, `str`, `matchRE`).
//!
//! Templates are JSON values where `{"$eval": expr}` is replaced by the
//! value of `expr`, `{"$map": list, "each(x)": template}` maps over an
//! array, and `${expr}` inside a string interpolates.

use std::collections::BTreeSet;

use regex::RegexBuilder;
use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("cannot access {property} of {target}")]
    InvalidAccess { property: String, target: String },

    #[error("type error: {0}")]
    Type(String),

    #[error("invalid template: {0}")]
    Template(String),
}

type Result<T> = std::result::Result<T, ExpressionError>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Op(&'static str),
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '.' => {
                tokens.push((start, Token::Dot));
                i += 1;
            }
            ',' => {
                tokens.push((start, Token::Comma));
                i += 1;
            }
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            '[' => {
                tokens.push((start, Token::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push((start, Token::RBracket));
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ExpressionError::Syntax {
                                position: start,
                                message: "unterminated string".into(),
                            })
                        }
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                text.push(*next);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Str(text)));
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text.parse::<f64>().map_err(|_| ExpressionError::Syntax {
                    position: start,
                    message: format!("invalid number {}", text),
                })?;
                tokens.push((start, Token::Number(number)));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            }
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push((start, Token::Op(op)));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '<' => "<",
                    '>' => ">",
                    '+' => "+",
                    '-' => "-",
                    '!' => "!",
                    _ => {
                        return Err(ExpressionError::Syntax {
                            position: start,
                            message: format!("unexpected character '{}'", c),
                        })
                    }
                };
                tokens.push((start, Token::Op(op)));
                i += 1;
            }
        }
    }

    Ok(tokens)
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    List(Vec<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.len)
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(ExpressionError::Syntax {
            position: self.position(),
            message: message.into(),
        })
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            self.error(format!("expected {:?}", expected))
        }
    }

    fn binary(
        &mut self,
        ops: &[&'static str],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            if !ops.contains(&op) {
                break;
            }
            self.pos += 1;
            let right = next(self)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn or(&mut self) -> Result<Expr> {
        self.binary(&["||"], Self::and)
    }

    fn and(&mut self) -> Result<Expr> {
        self.binary(&["&&"], Self::equality)
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary(&["==", "!="], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Expr> {
        self.binary(&["<", ">", "<=", ">="], Self::additive)
    }

    fn additive(&mut self) -> Result<Expr> {
        self.binary(&["+", "-"], Self::unary)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Op("!")) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::Op("-")) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.peek().cloned() {
                        Some(Token::Ident(name)) => {
                            self.pos += 1;
                            expr = Expr::Member(Box::new(expr), name);
                        }
                        _ => return self.error("expected property name"),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn list(&mut self, close: Token) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        if self.peek() == Some(&close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.or()?);
            match self.peek() {
                Some(Token::Comma) => self.pos += 1,
                Some(token) if *token == close => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return self.error("expected ',' or closing bracket"),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = match self.peek().cloned() {
            Some(token) => token,
            None => return self.error("unexpected end of expression"),
        };
        self.pos += 1;
        match token {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let args = self.list(Token::RParen)?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Ident(name)),
            },
            Token::LParen => {
                let expr = self.or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => Ok(Expr::List(self.list(Token::RBracket)?)),
            other => {
                self.pos -= 1;
                self.error(format!("unexpected token {:?}", other))
            }
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Parse an expression.
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        len: source.len(),
    };
    let expr = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return parser.error("unexpected trailing input");
    }
    Ok(expr)
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(_) => "boolean".into(),
        Value::Number(_) => "number".into(),
        Value::String(_) => "string".into(),
        Value::Array(_) => "array".into(),
        Value::Object(_) => "object".into(),
    }
}

fn as_number(value: &Value, op: &str) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| ExpressionError::Type(format!("{} expects numbers, got {}", op, describe(value))))
}

fn member(target: &Value, property: &str) -> Result<Value> {
    match target {
        Value::Object(object) => Ok(object.get(property).cloned().unwrap_or(Value::Null)),
        Value::Array(items) if property == "length" => Ok(Value::from(items.len())),
        Value::String(text) if property == "length" => Ok(Value::from(text.chars().count())),
        other => Err(ExpressionError::InvalidAccess {
            property: property.to_string(),
            target: describe(other),
        }),
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value> {
    let arg = |index: usize| args.get(index).cloned().unwrap_or(Value::Null);
    match name {
        "len" => match arg(0) {
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::String(text) => Ok(Value::from(text.chars().count())),
            Value::Object(object) => Ok(Value::from(object.len())),
            Value::Null => Ok(Value::from(0)),
            other => Err(ExpressionError::Type(format!("len() of {}", describe(&other)))),
        },
        "lowercase" => match arg(0) {
            Value::String(text) => Ok(Value::String(text.to_lowercase())),
            other => Err(ExpressionError::Type(format!("lowercase() of {}", describe(&other)))),
        },
        "uppercase" => match arg(0) {
            Value::String(text) => Ok(Value::String(text.to_uppercase())),
            other => Err(ExpressionError::Type(format!("uppercase() of {}", describe(&other)))),
        },
        "str" => Ok(Value::String(stringify(&arg(0))?)),
        "matchRE" => {
            let (pattern, flags, text) = match (arg(0), arg(1), arg(2)) {
                (Value::String(p), Value::String(f), Value::String(t)) => (p, f, t),
                (Value::String(p), Value::Null, Value::String(t)) => (p, String::new(), t),
                _ => {
                    return Err(ExpressionError::Type(
                        "matchRE(pattern, flags, text) expects strings".into(),
                    ))
                }
            };
            let regex = RegexBuilder::new(&pattern)
                .case_insensitive(flags.contains('i'))
                .multi_line(flags.contains('m'))
                .build()
                .map_err(|e| ExpressionError::Type(e.to_string()))?;
            let found: Vec<Value> = if flags.contains('g') {
                regex
                    .find_iter(&text)
                    .map(|m| Value::String(m.as_str().to_string()))
                    .collect()
            } else {
                regex
                    .find(&text)
                    .map(|m| Value::String(m.as_str().to_string()))
                    .into_iter()
                    .collect()
            };
            Ok(Value::Array(found))
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

fn stringify(value: &Value) -> Result<String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Null => Ok("null".into()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ExpressionError::Type(format!(
            "cannot interpolate {}",
            describe(other)
        ))),
    }
}

/// Evaluate a parsed expression against a context object.
pub fn eval(expr: &Expr, context: &Map<String, Value>) -> Result<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => context
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownIdentifier(name.clone())),
        Expr::List(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| eval(item, context))
                .collect::<Result<_>>()?,
        )),
        Expr::Member(target, property) => member(&eval(target, context)?, property),
        Expr::Index(target, index) => {
            let target = eval(target, context)?;
            match (&target, eval(index, context)?) {
                (_, Value::String(key)) => member(&target, &key),
                (Value::Array(items), Value::Number(n)) => {
                    let len = items.len() as i64;
                    let i = n.as_i64().unwrap_or(-1 - len);
                    let i = if i < 0 { len + i } else { i };
                    Ok(usize::try_from(i)
                        .ok()
                        .and_then(|i| items.get(i))
                        .cloned()
                        .unwrap_or(Value::Null))
                }
                (_, index) => Err(ExpressionError::InvalidAccess {
                    property: index.to_string(),
                    target: describe(&target),
                }),
            }
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, context))
                .collect::<Result<Vec<_>>>()?;
            call(name, args)
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, context)?))),
        Expr::Neg(inner) => Ok(number(-as_number(&eval(inner, context)?, "-")?)),
        Expr::Binary(op, left, right) => {
            let left = eval(left, context)?;
            match *op {
                "&&" => {
                    if !truthy(&left) {
                        return Ok(left);
                    }
                    eval(right, context)
                }
                "||" => {
                    if truthy(&left) {
                        return Ok(left);
                    }
                    eval(right, context)
                }
                _ => {
                    let right = eval(right, context)?;
                    binary(op, &left, &right)
                }
            }
        }
    }
}

fn binary(op: &str, left: &Value, right: &Value) -> Result<Value> {
    match op {
        "==" => Ok(Value::Bool(crate::schema::json_eq(left, right))),
        "!=" => Ok(Value::Bool(!crate::schema::json_eq(left, right))),
        "+" => match (left, right) {
            (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, stringify(b)?))),
            (a, Value::String(b)) => Ok(Value::String(format!("{}{}", stringify(a)?, b))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b).cloned().collect()))
            }
            _ => Ok(number(as_number(left, op)? + as_number(right, op)?)),
        },
        "-" => Ok(number(as_number(left, op)? - as_number(right, op)?)),
        "<" | ">" | "<=" | ">=" => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => as_number(left, op)?
                    .partial_cmp(&as_number(right, op)?)
                    .ok_or_else(|| ExpressionError::Type("cannot compare NaN".into()))?,
            };
            Ok(Value::Bool(match op {
                "<" => ordering.is_lt(),
                ">" => ordering.is_gt(),
                "<=" => ordering.is_le(),
                _ => ordering.is_ge(),
            }))
        }
        other => Err(ExpressionError::Type(format!("unknown operator {}", other))),
    }
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, context: &Map<String, Value>) -> Result<Value> {
    eval(&parse(source)?, context)
}

/// Every `contract.links[verb]` (or `contract.links.verb`) referenced by an expression.
pub fn referenced_link_verbs(expr: &Expr, verbs: &mut BTreeSet<String>) {
    let is_links = |target: &Expr| {
        matches!(target, Expr::Member(inner, name)
            if name == "links" && matches!(inner.as_ref(), Expr::Ident(root) if root == "contract"))
    };
    match expr {
        Expr::Index(target, index) => {
            if is_links(target) {
                if let Expr::Literal(Value::String(verb)) = index.as_ref() {
                    verbs.insert(verb.clone());
                }
            }
            referenced_link_verbs(target, verbs);
            referenced_link_verbs(index, verbs);
        }
        Expr::Member(target, name) => {
            if is_links(target) {
                verbs.insert(name.clone());
            }
            referenced_link_verbs(target, verbs);
        }
        Expr::List(items) | Expr::Call(_, items) => {
            for item in items {
                referenced_link_verbs(item, verbs);
            }
        }
        Expr::Not(inner) | Expr::Neg(inner) => referenced_link_verbs(inner, verbs),
        Expr::Binary(_, left, right) => {
            referenced_link_verbs(left, verbs);
            referenced_link_verbs(right, verbs);
        }
        Expr::Literal(_) | Expr::Ident(_) => {}
    }
}

fn interpolate(text: &str, context: &Map<String, Value>) -> Result<String> {
    let mut output = String::new();
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ExpressionError::Template(format!("unterminated interpolation in {}", text)))?;
        output.push_str(&stringify(&evaluate(&after[..end], context)?)?);
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

fn each_binding(key: &str) -> Option<(String, Option<String>)> {
    let inner = key.strip_prefix("each(")?.strip_suffix(')')?;
    let mut names = inner.split(',').map(str::trim);
    let item = names.next().filter(|name| !name.is_empty())?.to_string();
    let index = names.next().map(str::to_string);
    Some((item, index))
}

/// Render a template, failing on the first unresolvable placeholder.
pub fn render(template: &Value, context: &Map<String, Value>) -> Result<Value> {
    match template {
        Value::Object(object) => {
            if let Some(source) = object.get("$eval") {
                let source = source
                    .as_str()
                    .ok_or_else(|| ExpressionError::Template("$eval must be a string".into()))?;
                return evaluate(source, context);
            }
            if let Some(list) = object.get("$map") {
                return render_map(object, list, context, render);
            }
            let mut rendered = Map::with_capacity(object.len());
            for (key, value) in object {
                rendered.insert(key.clone(), render(value, context)?);
            }
            Ok(Value::Object(rendered))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| render(item, context))
                .collect::<Result<_>>()?,
        )),
        Value::String(text) if text.contains("${") => Ok(Value::String(interpolate(text, context)?)),
        other => Ok(other.clone()),
    }
}

/// Render a template, degrading each unresolvable placeholder to `null`.
pub fn render_lenient(template: &Value, context: &Map<String, Value>) -> Value {
    match template {
        Value::Object(object) if object.contains_key("$eval") || object.contains_key("$map") => {
            render(template, context).unwrap_or(Value::Null)
        }
        Value::Object(object) => Value::Object(
            object
                .iter()
                .map(|(key, value)| (key.clone(), render_lenient(value, context)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_lenient(item, context))
                .collect(),
        ),
        Value::String(text) if text.contains("${") => interpolate(text, context)
            .map(Value::String)
            .unwrap_or(Value::Null),
        other => other.clone(),
    }
}

fn render_map(
    object: &Map<String, Value>,
    list: &Value,
    context: &Map<String, Value>,
    each: fn(&Value, &Map<String, Value>) -> Result<Value>,
) -> Result<Value> {
    let (binding, template) = object
        .iter()
        .find_map(|(key, value)| each_binding(key).map(|binding| (binding, value)))
        .ok_or_else(|| ExpressionError::Template("$map requires an each(x) key".into()))?;
    let items = match render(list, context)? {
        Value::Array(items) => items,
        other => {
            return Err(ExpressionError::Template(format!(
                "$map expects an array, got {}",
                describe(&other)
            )))
        }
    };

    let (item_name, index_name) = binding;
    let mut output = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let mut scope = context.clone();
        scope.insert(item_name.clone(), item);
        if let Some(index_name) = &index_name {
            scope.insert(index_name.clone(), Value::from(index));
        }
        output.push(each(template, &scope)?);
    }
    Ok(Value::Array(output))
}

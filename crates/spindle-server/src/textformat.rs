//! A reader for the protobuf text format, scoped to what configuration
//! documents need: scalar fields, nested messages, repeated fields and
//! `#` comments.
//!
//! The input is lowered into a `serde_json::Value` tree (repeated fields
//! accumulate into arrays, bare identifiers become strings so enum values
//! deserialize naturally), which then drives the ordinary serde pipeline.

use std::fmt;

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("line {line}: {message}")]
pub struct TextFormatError {
    line: usize,
    message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Number),
    LBrace,
    RBrace,
    Colon,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier {name}"),
            Token::Str(_) => f.write_str("string"),
            Token::Num(_) => f.write_str("number"),
            Token::LBrace => f.write_str("'{'"),
            Token::RBrace => f.write_str("'}'"),
            Token::Colon => f.write_str("':'"),
        }
    }
}

/// Parses a text-format document into a JSON object value.
pub fn to_value(input: &str) -> Result<Value, TextFormatError> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let object = parser.message(true)?;
    Ok(Value::Object(object))
}

fn lex(input: &str) -> Result<Vec<(Token, usize)>, TextFormatError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            // Separators between fields are optional noise.
            ',' | ';' => {
                chars.next();
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '{' => {
                tokens.push((Token::LBrace, line));
                chars.next();
            }
            '}' => {
                tokens.push((Token::RBrace, line));
                chars.next();
            }
            ':' => {
                tokens.push((Token::Colon, line));
                chars.next();
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(TextFormatError {
                                line,
                                message: "unterminated string literal".into(),
                            });
                        }
                        Some(c) if c == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => literal.push('\n'),
                            Some('t') => literal.push('\t'),
                            Some('r') => literal.push('\r'),
                            Some(c @ ('\\' | '"' | '\'')) => literal.push(c),
                            other => {
                                return Err(TextFormatError {
                                    line,
                                    message: format!("unsupported escape {other:?}"),
                                });
                            }
                        },
                        Some('\n') => {
                            return Err(TextFormatError {
                                line,
                                message: "newline in string literal".into(),
                            });
                        }
                        Some(c) => literal.push(c),
                    }
                }
                tokens.push((Token::Str(literal), line));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let mut literal = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = parse_number(&literal).ok_or_else(|| TextFormatError {
                    line,
                    message: format!("invalid number literal {literal:?}"),
                })?;
                tokens.push((Token::Num(number), line));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut literal = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(literal), line));
            }
            other => {
                return Err(TextFormatError {
                    line,
                    message: format!("unexpected character {other:?}"),
                });
            }
        }
    }

    Ok(tokens)
}

fn parse_number(literal: &str) -> Option<Number> {
    if let Ok(int) = literal.parse::<i64>() {
        return Some(Number::from(int));
    }
    literal.parse::<f64>().ok().and_then(Number::from_f64)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|(_, line)| *line)
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> TextFormatError {
        TextFormatError {
            line: self.line(),
            message: message.into(),
        }
    }

    /// Parses fields until end-of-input (top level) or a closing brace.
    fn message(&mut self, top_level: bool) -> Result<Map<String, Value>, TextFormatError> {
        let mut object = Map::new();
        loop {
            match self.peek() {
                None if top_level => return Ok(object),
                None => return Err(self.error("missing closing '}'")),
                Some(Token::RBrace) if !top_level => {
                    self.next();
                    return Ok(object);
                }
                Some(Token::RBrace) => return Err(self.error("unmatched '}'")),
                Some(Token::Ident(_)) => {
                    let Some((Token::Ident(field), _)) = self.next() else {
                        unreachable!("peeked an identifier");
                    };
                    let value = self.field_value()?;
                    insert_field(&mut object, field, value);
                }
                Some(other) => {
                    return Err(self.error(format!("expected a field name, found {other}")));
                }
            }
        }
    }

    /// A field is either `name: scalar`, `name: { ... }` or `name { ... }`.
    fn field_value(&mut self) -> Result<Value, TextFormatError> {
        match self.peek() {
            Some(Token::Colon) => {
                self.next();
                match self.next() {
                    Some((Token::Str(s), _)) => Ok(Value::String(s)),
                    Some((Token::Num(n), _)) => Ok(Value::Number(n)),
                    Some((Token::Ident(ident), _)) => Ok(match ident.as_str() {
                        "true" => Value::Bool(true),
                        "false" => Value::Bool(false),
                        _ => Value::String(ident),
                    }),
                    Some((Token::LBrace, _)) => Ok(Value::Object(self.message(false)?)),
                    Some((token, _)) => Err(self.error(format!("expected a value, found {token}"))),
                    None => Err(self.error("expected a value")),
                }
            }
            Some(Token::LBrace) => {
                self.next();
                Ok(Value::Object(self.message(false)?))
            }
            Some(other) => Err(self.error(format!("expected ':' or '{{', found {other}"))),
            None => Err(self.error("expected ':' or '{'")),
        }
    }
}

/// Repeated occurrences of a field accumulate into an array.
fn insert_field(object: &mut Map<String, Value>, field: String, value: Value) {
    match object.get_mut(&field) {
        None => {
            object.insert(field, value);
        }
        Some(Value::Array(existing)) => existing.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_scalars() {
        let value = to_value(r#"name: "lb" port: 443 enabled: true ratio: -1.5"#).unwrap();
        assert_eq!(
            value,
            json!({"name": "lb", "port": 443, "enabled": true, "ratio": -1.5})
        );
    }

    #[test]
    fn parses_nested_messages_with_and_without_colon() {
        let value = to_value("outer { inner: { port: 1 } other { port: 2 } }").unwrap();
        assert_eq!(
            value,
            json!({"outer": {"inner": {"port": 1}, "other": {"port": 2}}})
        );
    }

    #[test]
    fn repeated_fields_become_arrays() {
        let value = to_value(r#"urls: "a" urls: "b" urls: "c""#).unwrap();
        assert_eq!(value, json!({"urls": ["a", "b", "c"]}));
    }

    #[test]
    fn bare_identifiers_are_enum_strings() {
        let value = to_value("protocol: HTTPS").unwrap();
        assert_eq!(value, json!({"protocol": "HTTPS"}));
    }

    #[test]
    fn comments_and_separators_are_skipped() {
        let value = to_value(
            "# a header comment\nport: 443, name: \"lb\"; # trailing\n",
        )
        .unwrap();
        assert_eq!(value, json!({"port": 443, "name": "lb"}));
    }

    #[test]
    fn string_escapes() {
        let value = to_value(r#"name: "a\tb\"c""#).unwrap();
        assert_eq!(value, json!({"name": "a\tb\"c"}));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = to_value(r#"name: "oops"#).unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn missing_brace_is_an_error() {
        let err = to_value("outer { port: 1").unwrap_err();
        assert!(err.to_string().contains("missing closing"));
    }

    #[test]
    fn unmatched_brace_is_an_error() {
        assert!(to_value("port: 1 }").is_err());
    }

    #[test]
    fn error_reports_the_line() {
        let err = to_value("port: 1\nname ?").unwrap_err();
        assert!(err.to_string().starts_with("line 2"), "{err}");
    }
}

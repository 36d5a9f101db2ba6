//! Rule expression parser
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! expr    := xor ( "or" xor )*
//! xor     := and ( "xor" and )*
//! and     := unary ( "and" unary )*
//! unary   := "not" unary | primary
//! primary := "(" expr ")" | "true" | "false" | call
//! call    := IDENT "(" [ arg ( "," arg )* ] ")"
//! arg     := IDENT | STRING | INTEGER | "true" | "false" | "[" [ arg ( "," arg )* ] "]"
//! ```

use super::expr::{Expr, Predicate};
use super::predicate::DEFAULT_NUMBER_BITS;
use crate::record::{Value, ValueType};
use std::collections::BTreeSet;

/// Parse failure with the byte offset into the expression text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("at offset {offset}: {message}")]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            b')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            b'[' => {
                tokens.push((i, Token::LBracket));
                i += 1;
            }
            b']' => {
                tokens.push((i, Token::RBracket));
                i += 1;
            }
            b',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            b'"' | b'\'' => {
                let start = i;
                let quote = c;
                i += 1;
                // a backslash takes the next byte literally
                let mut body = Vec::new();
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' && i + 1 < bytes.len() {
                        i += 1;
                    }
                    body.push(bytes[i]);
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(ParseError::new(start, "unterminated string literal"));
                }
                let body = String::from_utf8(body)
                    .map_err(|_| ParseError::new(start, "string literal is not valid UTF-8"))?;
                tokens.push((start, Token::Str(body)));
                i += 1;
            }
            b'-' | b'0'..=b'9' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let text = &input[start..i];
                let n = text
                    .parse::<i64>()
                    .map_err(|_| ParseError::new(start, format!("invalid integer '{}'", text)))?;
                tokens.push((start, Token::Int(n)));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push((start, Token::Ident(input[start..i].to_string())));
            }
            _ => {
                let ch = input[i..].chars().next().unwrap_or('?');
                return Err(ParseError::new(i, format!("unexpected character '{}'", ch)));
            }
        }
    }

    Ok(tokens)
}

/// Call argument before it is checked against the predicate's signature
#[derive(Debug, Clone)]
enum Arg {
    Ident(String),
    Literal(Value),
    List(Vec<Arg>),
}

struct Parser<'a> {
    tokens: &'a [(usize, Token)],
    pos: usize,
    end: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: &Token, what: &str) -> Result<(), ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(ParseError::new(
                offset,
                format!("expected {}, found {:?}", what, tok),
            )),
            None => Err(ParseError::new(offset, format!("expected {}, found end", what))),
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s == kw)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_xor()?;
        while self.at_keyword("or") {
            self.pos += 1;
            let right = self.parse_xor()?;
            left = Expr::or(left, right);
        }
        Ok(left)
    }

    fn parse_xor(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.at_keyword("xor") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::xor(left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        while self.at_keyword("and") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::and(left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.at_keyword("not") {
            self.pos += 1;
            return Ok(Expr::not(self.parse_unary()?));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Const(true)),
                "false" => Ok(Expr::Const(false)),
                "and" | "or" | "xor" | "not" => Err(ParseError::new(
                    offset,
                    format!("unexpected keyword '{}'", name),
                )),
                _ => {
                    self.expect(&Token::LParen, "'(' after predicate name")?;
                    let args = self.parse_args(Token::RParen)?;
                    build_predicate(name, args, offset).map(Expr::Pred)
                }
            },
            Some(tok) => Err(ParseError::new(offset, format!("unexpected {:?}", tok))),
            None => Err(ParseError::new(offset, "unexpected end of expression")),
        }
    }

    fn parse_args(&mut self, close: Token) -> Result<Vec<Arg>, ParseError> {
        let mut args = Vec::new();
        if self.peek() == Some(&close) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_arg()?);
            let offset = self.offset();
            match self.next() {
                Some(Token::Comma) => continue,
                Some(tok) if *tok == close => return Ok(args),
                Some(tok) => {
                    return Err(ParseError::new(
                        offset,
                        format!("expected ',' or {:?}, found {:?}", close, tok),
                    ))
                }
                None => return Err(ParseError::new(offset, "unterminated argument list")),
            }
        }
    }

    fn parse_arg(&mut self) -> Result<Arg, ParseError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Ident(s)) if s == "true" => Ok(Arg::Literal(Value::Bool(true))),
            Some(Token::Ident(s)) if s == "false" => Ok(Arg::Literal(Value::Bool(false))),
            Some(Token::Ident(s)) => Ok(Arg::Ident(s.clone())),
            Some(Token::Str(s)) => Ok(Arg::Literal(Value::Str(s.clone()))),
            Some(Token::Int(n)) => Ok(Arg::Literal(Value::Int(*n))),
            Some(Token::LBracket) => self.parse_args(Token::RBracket).map(Arg::List),
            Some(tok) => Err(ParseError::new(offset, format!("unexpected {:?} in arguments", tok))),
            None => Err(ParseError::new(offset, "unexpected end in arguments")),
        }
    }
}

/// A field name may be written bare or quoted
fn field_arg(arg: &Arg, offset: usize) -> Result<String, ParseError> {
    match arg {
        Arg::Ident(s) | Arg::Literal(Value::Str(s)) => Ok(s.clone()),
        other => Err(ParseError::new(
            offset,
            format!("expected a field name, found {:?}", other),
        )),
    }
}

/// A comparison value; bare identifiers are read as strings
fn value_arg(arg: &Arg, offset: usize) -> Result<Value, ParseError> {
    match arg {
        Arg::Ident(s) => Ok(Value::Str(s.clone())),
        Arg::Literal(v) => Ok(v.clone()),
        Arg::List(_) => Err(ParseError::new(offset, "lists cannot be compared with has_value")),
    }
}

fn arity(name: &str, args: &[Arg], want: &[usize], offset: usize) -> Result<(), ParseError> {
    if want.contains(&args.len()) {
        Ok(())
    } else {
        Err(ParseError::new(
            offset,
            format!("{} takes {:?} argument(s), got {}", name, want, args.len()),
        ))
    }
}

fn build_predicate(name: &str, args: Vec<Arg>, offset: usize) -> Result<Predicate, ParseError> {
    match name {
        "is_present" => {
            arity(name, &args, &[1], offset)?;
            Ok(Predicate::IsPresent {
                field: field_arg(&args[0], offset)?,
            })
        }
        "has_value" => {
            arity(name, &args, &[2], offset)?;
            Ok(Predicate::HasValue {
                field: field_arg(&args[0], offset)?,
                value: value_arg(&args[1], offset)?,
            })
        }
        "is_type" => {
            arity(name, &args, &[2], offset)?;
            let ty_name = field_arg(&args[1], offset)?;
            let ty = ValueType::from_name(&ty_name)
                .ok_or_else(|| ParseError::new(offset, format!("unknown type '{}'", ty_name)))?;
            Ok(Predicate::IsType {
                field: field_arg(&args[0], offset)?,
                ty,
            })
        }
        "is_positive_number" => {
            arity(name, &args, &[1, 2], offset)?;
            let bits = match args.get(1) {
                None => DEFAULT_NUMBER_BITS,
                Some(Arg::Literal(Value::Int(b))) if (1..=64).contains(b) => *b as u32,
                Some(other) => {
                    return Err(ParseError::new(
                        offset,
                        format!("bit width must be an integer in 1..=64, found {:?}", other),
                    ))
                }
            };
            Ok(Predicate::IsPositiveNumber {
                field: field_arg(&args[0], offset)?,
                bits,
            })
        }
        "authorized_keys" => {
            // Accept both `authorized_keys([a, b])` and `authorized_keys(a, b)`
            let items: &[Arg] = match args.as_slice() {
                [Arg::List(items)] => items.as_slice(),
                other => other,
            };
            let keys = items
                .iter()
                .map(|a| field_arg(a, offset))
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(Predicate::AuthorizedKeys { keys })
        }
        "distinct" => {
            arity(name, &args, &[2], offset)?;
            Ok(Predicate::Distinct {
                left: field_arg(&args[0], offset)?,
                right: field_arg(&args[1], offset)?,
            })
        }
        other => Err(ParseError::new(offset, format!("unknown predicate '{}'", other))),
    }
}

/// Parse a rule expression
pub fn parse_expr(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        end: input.len(),
    };
    let expr = parser.parse_or()?;
    if parser.pos != tokens.len() {
        return Err(ParseError::new(parser.offset(), "trailing input after expression"));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    #[test]
    fn test_parse_implication() {
        let expr = parse_expr("not has_value(established, true) or is_present(key)").unwrap();
        assert_eq!(
            expr,
            Expr::implies(
                Expr::Pred(Predicate::HasValue {
                    field: "established".into(),
                    value: Value::Bool(true),
                }),
                Expr::Pred(Predicate::IsPresent { field: "key".into() }),
            )
        );
    }

    #[test]
    fn test_precedence() {
        // and binds tighter than xor, xor tighter than or
        let expr = parse_expr("true or false and false xor true").unwrap();
        assert_eq!(
            expr,
            Expr::or(
                Expr::Const(true),
                Expr::xor(
                    Expr::and(Expr::Const(false), Expr::Const(false)),
                    Expr::Const(true),
                ),
            )
        );
    }

    #[test]
    fn test_quoted_and_bare_fields_agree() {
        let a = parse_expr(r#"is_present("to_module")"#).unwrap();
        let b = parse_expr("is_present(to_module)").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_authorized_keys_list() {
        let expr = parse_expr("authorized_keys([name, type, 'node'])").unwrap();
        let rec = Record::new().with("name", "m").with("node", "n");
        assert!(expr.evaluate(&rec).unwrap());
        let rec = rec.with("extra", 1);
        assert!(!expr.evaluate(&rec).unwrap());
    }

    #[test]
    fn test_is_positive_number_bits() {
        let expr = parse_expr("is_positive_number(vendor_id, 16)").unwrap();
        assert_eq!(
            expr,
            Expr::Pred(Predicate::IsPositiveNumber {
                field: "vendor_id".into(),
                bits: 16,
            })
        );
        assert!(parse_expr("is_positive_number(port, 0)").is_err());
    }

    #[test]
    fn test_round_trip_through_display() {
        let text = "(is_present(a) xor is_present(b)) and not distinct(a, b)";
        let expr = parse_expr(text).unwrap();
        assert_eq!(parse_expr(&expr.to_string()).unwrap(), expr);
    }

    #[test]
    fn test_escaped_string_literals() {
        let expr = parse_expr(r#"has_value(f, "a\"b\\c")"#).unwrap();
        assert_eq!(
            expr,
            Expr::Pred(Predicate::HasValue {
                field: "f".into(),
                value: Value::Str(r#"a"b\c"#.into()),
            })
        );
        assert_eq!(parse_expr(&expr.to_string()).unwrap(), expr);
        assert_eq!(
            parse_expr(r"has_value(f, 'it\'s')").unwrap(),
            parse_expr(r#"has_value(f, "it's")"#).unwrap()
        );
    }

    #[test]
    fn test_errors_carry_offsets() {
        let err = parse_expr("is_present(a) and").unwrap_err();
        assert_eq!(err.offset, 17);

        let err = parse_expr("is_present(a) is_present(b)").unwrap_err();
        assert_eq!(err.offset, 14);

        let err = parse_expr("is_missing(a)").unwrap_err();
        assert!(err.message.contains("unknown predicate"));

        let err = parse_expr("is_type(a, float)").unwrap_err();
        assert!(err.message.contains("unknown type"));

        assert!(parse_expr("has_value(a, 'x").is_err());
        assert!(parse_expr("is_present(a) & true").is_err());
    }
}

//! URL object notation codec.
//!
//! A compact encoding of a JSON document for URL query strings, shorter than
//! percent-encoded JSON. Objects open with `$`, arrays with `@`, both close
//! with `;` (optional at end of input). String values follow `=`, typed
//! literals (numbers, booleans, null) follow `:`. Entries and items are
//! separated by `&`. Reserved characters inside keys and strings are escaped
//! with `/`.
//!
//! Example: `{"select":{"key":["geo","time"],"value":[]},"from":"datapoints"}`
//! encodes as `$select$key@=geo&=time;&value@;;&from=datapoints`.

use serde_json::{Map, Number, Value};

const RESERVED: &[char] = &['$', '@', '&', ';', '=', ':', '/'];

/// Parse a URL-object-notation string into a JSON value.
pub fn parse(input: &str) -> Result<Value, String> {
    let mut parser = Parser {
        chars: input.chars().collect(),
        pos: 0,
    };
    let value = parser.value()?;
    parser.skip_terminators();
    if parser.pos < parser.chars.len() {
        return Err(format!(
            "unexpected trailing input at position {}",
            parser.pos
        ));
    }
    Ok(value)
}

/// Encode a JSON value in URL object notation.
pub fn stringify(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    // The outermost containers need no terminator. An escaped semicolon at
    // the end of a string value has an odd number of slashes before it and
    // must stay.
    while out.ends_with(';') {
        let slashes = out[..out.len() - 1]
            .chars()
            .rev()
            .take_while(|c| *c == '/')
            .count();
        if slashes % 2 == 1 {
            break;
        }
        out.pop();
    }
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('$');
            let mut first = true;
            for (key, item) in map {
                if !first {
                    out.push('&');
                }
                first = false;
                write_escaped(key, out);
                match item {
                    Value::String(s) => {
                        out.push('=');
                        write_escaped(s, out);
                    }
                    Value::Object(_) | Value::Array(_) => write_value(item, out),
                    other => {
                        out.push(':');
                        out.push_str(&other.to_string());
                    }
                }
            }
            out.push(';');
        }
        Value::Array(items) => {
            out.push('@');
            let mut first = true;
            for item in items {
                if !first {
                    out.push('&');
                }
                first = false;
                match item {
                    Value::String(s) => {
                        out.push('=');
                        write_escaped(s, out);
                    }
                    Value::Object(_) | Value::Array(_) => write_value(item, out),
                    other => {
                        out.push(':');
                        out.push_str(&other.to_string());
                    }
                }
            }
            out.push(';');
        }
        Value::String(s) => {
            out.push('=');
            write_escaped(s, out);
        }
        other => {
            out.push(':');
            out.push_str(&other.to_string());
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    for c in s.chars() {
        if RESERVED.contains(&c) {
            out.push('/');
        }
        out.push(c);
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn value(&mut self) -> Result<Value, String> {
        match self.peek() {
            Some('$') => self.object(),
            Some('@') => self.array(),
            Some('=') => {
                self.pos += 1;
                Ok(Value::String(self.text()?))
            }
            Some(':') => {
                self.pos += 1;
                self.literal()
            }
            other => Err(format!(
                "expected one of '$', '@', '=', ':' at position {}, found {:?}",
                self.pos, other
            )),
        }
    }

    fn object(&mut self) -> Result<Value, String> {
        self.pos += 1; // consume '$'
        let mut map = Map::new();
        loop {
            match self.peek() {
                None => break,
                Some(';') => {
                    self.pos += 1;
                    break;
                }
                _ => {}
            }
            let key = self.text()?;
            let value = self.value()?;
            map.insert(key, value);
            match self.peek() {
                Some('&') => {
                    self.pos += 1;
                }
                Some(';') => {
                    self.pos += 1;
                    break;
                }
                None => break,
                Some(c) => {
                    return Err(format!(
                        "expected '&' or ';' at position {}, found {:?}",
                        self.pos, c
                    ))
                }
            }
        }
        Ok(Value::Object(map))
    }

    fn array(&mut self) -> Result<Value, String> {
        self.pos += 1; // consume '@'
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => break,
                Some(';') => {
                    self.pos += 1;
                    break;
                }
                Some('&') if items.is_empty() => {
                    return Err(format!("unexpected '&' at position {}", self.pos))
                }
                _ => {}
            }
            items.push(self.value()?);
            match self.peek() {
                Some('&') => {
                    self.pos += 1;
                }
                Some(';') => {
                    self.pos += 1;
                    break;
                }
                None => break,
                Some(c) => {
                    return Err(format!(
                        "expected '&' or ';' at position {}, found {:?}",
                        self.pos, c
                    ))
                }
            }
        }
        Ok(Value::Array(items))
    }

    /// Read characters until a reserved delimiter, honouring `/` escapes.
    fn text(&mut self) -> Result<String, String> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            match c {
                '/' => {
                    self.pos += 1;
                    match self.peek() {
                        Some(escaped) => {
                            out.push(escaped);
                            self.pos += 1;
                        }
                        None => return Err("dangling escape at end of input".to_string()),
                    }
                }
                '$' | '@' | '&' | ';' | '=' | ':' => break,
                _ => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(out)
    }

    fn literal(&mut self) -> Result<Value, String> {
        let text = self.text()?;
        match text.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" => Ok(Value::Null),
            _ => {
                if let Ok(n) = text.parse::<i64>() {
                    return Ok(Value::Number(Number::from(n)));
                }
                if let Ok(f) = text.parse::<f64>() {
                    if let Some(n) = Number::from_f64(f) {
                        return Ok(Value::Number(n));
                    }
                }
                Err(format!("invalid literal: {text}"))
            }
        }
    }

    fn skip_terminators(&mut self) {
        while self.peek() == Some(';') {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_flat_object() {
        let value = parse("$from=concepts&language=fi-FI").unwrap();
        assert_eq!(value, json!({"from": "concepts", "language": "fi-FI"}));
    }

    #[test]
    fn test_parse_nested_query() {
        let value = parse("$select$key@=geo&=time;&value@;;&from=datapoints").unwrap();
        assert_eq!(
            value,
            json!({"select": {"key": ["geo", "time"], "value": []}, "from": "datapoints"})
        );
    }

    #[test]
    fn test_parse_literals() {
        let value = parse("$count:42&share:0.5&flag:true&missing:null").unwrap();
        assert_eq!(
            value,
            json!({"count": 42, "share": 0.5, "flag": true, "missing": null})
        );
    }

    #[test]
    fn test_parse_where_with_join() {
        let input = "$select$key@=city&=time;&value@=population;;&from=datapoints\
                     &where$geo=/$geo;&join$/$geo$key=geo&where$latitude$/$lt:25";
        let value = parse(input).unwrap();
        assert_eq!(
            value,
            json!({
                "select": {"key": ["city", "time"], "value": ["population"]},
                "from": "datapoints",
                "where": {"geo": "$geo"},
                "join": {"$geo": {"key": "geo", "where": {"latitude": {"$lt": 25}}}}
            })
        );
    }

    #[test]
    fn test_roundtrip() {
        let value = json!({
            "select": {"key": ["concept"], "value": ["description"]},
            "from": "concepts",
            "language": "fi-FI",
            "order_by": [{"concept": "desc"}]
        });
        let encoded = stringify(&value);
        assert_eq!(parse(&encoded).unwrap(), value);
    }

    #[test]
    fn test_roundtrip_escaped_string() {
        let value = json!({"where": {"name": "rock & roll; $5"}});
        let encoded = stringify(&value);
        assert_eq!(parse(&encoded).unwrap(), value);
    }

    #[test]
    fn test_roundtrip_trailing_escaped_terminator() {
        let value = json!({"note": "ends with;"});
        let encoded = stringify(&value);
        assert_eq!(parse(&encoded).unwrap(), value);

        let value = json!({"note": "ends with/"});
        let encoded = stringify(&value);
        assert_eq!(parse(&encoded).unwrap(), value);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("not urlon").is_err());
        assert!(parse("$a=1;junk").is_err());
        assert!(parse("$a").is_err());
    }

    #[test]
    fn test_empty_array() {
        assert_eq!(parse("$value@").unwrap(), json!({"value": []}));
        assert_eq!(parse("$value@;&x=y").unwrap(), json!({"value": [], "x": "y"}));
    }
}

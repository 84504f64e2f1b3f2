//! Parser for command line value overrides, e.g.
//! `image.tag=1.2,hosts[0].name=a\,b,ports={80,443}`.

use std::iter::Peekable;
use std::str::Chars;

use serde_yaml::{Mapping, Value};

use crate::Error;

/// Indices above this are rejected, so `a[999999999]=x` can't allocate
/// arbitrary amounts of memory.
const MAX_INDEX: usize = 65536;

/// How the right-hand side of an assignment is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `--set`: `true`, `false`, `null` and integers are typed.
    Typed,
    /// `--set-string`: everything is a string.
    String,
    /// `--set-file`: the value is a path, its contents become the value.
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawValue {
    Scalar(String),
    List(Vec<String>),
}

/// One `path=value` pair of an override string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Assignment {
    pub path: Vec<Segment>,
    pub value: RawValue,
}

/// Splits an override string into its assignments.
pub(crate) fn parse(input: &str) -> Result<Vec<Assignment>, Error> {
    let mut chars = input.chars().peekable();
    let mut assignments = Vec::new();

    while chars.peek().is_some() {
        let path = parse_key(&mut chars)?;
        let value = parse_value(&mut chars)?;
        assignments.push(Assignment { path, value });
    }

    Ok(assignments)
}

fn display_path(path: &[Segment], rest: &str) -> String {
    let mut s = String::new();
    for segment in path {
        match segment {
            Segment::Key(k) if s.is_empty() => s.push_str(k),
            Segment::Key(k) => {
                s.push('.');
                s.push_str(k);
            }
            Segment::Index(i) => s.push_str(&format!("[{}]", i)),
        }
    }
    if !rest.is_empty() {
        if !s.is_empty() {
            s.push('.');
        }
        s.push_str(rest);
    }
    s
}

fn parse_key(chars: &mut Peekable<Chars>) -> Result<Vec<Segment>, Error> {
    let mut path = Vec::new();
    let mut key = String::new();
    // set after a '.', a name has to follow
    let mut want_name = false;

    loop {
        match chars.next() {
            None | Some(',') => {
                return Err(Error::Values(format!(
                    "key \"{}\" has no value",
                    display_path(&path, &key)
                )))
            }
            Some('\\') => match chars.next() {
                Some(c) => key.push(c),
                None => {
                    return Err(Error::Values(format!(
                        "key \"{}\" ends with an escape",
                        display_path(&path, &key)
                    )))
                }
            },
            Some('=') => {
                if !key.is_empty() {
                    path.push(Segment::Key(std::mem::take(&mut key)));
                } else if path.is_empty() || want_name {
                    return Err(Error::Values(format!(
                        "key \"{}\" has an empty name",
                        display_path(&path, "")
                    )));
                }
                return Ok(path);
            }
            Some('.') => {
                if key.is_empty() && (path.is_empty() || want_name) {
                    return Err(Error::Values(format!(
                        "key \"{}\" has an empty name",
                        display_path(&path, "")
                    )));
                }
                if !key.is_empty() {
                    path.push(Segment::Key(std::mem::take(&mut key)));
                }
                want_name = true;
            }
            Some('[') => {
                if !key.is_empty() {
                    path.push(Segment::Key(std::mem::take(&mut key)));
                } else if path.is_empty() || want_name {
                    return Err(Error::Values(
                        "list index without a name in front of it".to_string(),
                    ));
                }
                let index = parse_index(chars)?;
                path.push(Segment::Index(index));
                want_name = false;

                match chars.peek() {
                    Some('.') | Some('=') | Some('[') => {}
                    _ => {
                        return Err(Error::Values(format!(
                            "key \"{}\" has characters after its index",
                            display_path(&path, "")
                        )))
                    }
                }
            }
            Some(c) => {
                key.push(c);
                want_name = false;
            }
        }
    }
}

fn parse_index(chars: &mut Peekable<Chars>) -> Result<usize, Error> {
    let mut digits = String::new();
    loop {
        match chars.next() {
            Some(']') => break,
            Some(c) => digits.push(c),
            None => return Err(Error::Values("unterminated list index".to_string())),
        }
    }

    let index: usize = digits
        .parse()
        .map_err(|_| Error::Values(format!("invalid list index \"{}\"", digits)))?;
    if index > MAX_INDEX {
        return Err(Error::Values(format!(
            "list index {} exceeds the maximum of {}",
            index, MAX_INDEX
        )));
    }
    Ok(index)
}

fn parse_value(chars: &mut Peekable<Chars>) -> Result<RawValue, Error> {
    if chars.peek() == Some(&'{') {
        chars.next();
        let mut items = Vec::new();
        let mut item = String::new();
        loop {
            match chars.next() {
                None => return Err(Error::Values("list must terminate with '}'".to_string())),
                Some('\\') => {
                    if let Some(c) = chars.next() {
                        item.push(c)
                    }
                }
                Some(',') => items.push(std::mem::take(&mut item)),
                Some('}') => {
                    items.push(item);
                    break;
                }
                Some(c) => item.push(c),
            }
        }
        match chars.next() {
            None | Some(',') => {}
            Some(c) => {
                return Err(Error::Values(format!(
                    "unexpected '{}' after list value",
                    c
                )))
            }
        }
        // `{}` is the empty list
        if items.len() == 1 && items[0].is_empty() {
            items.clear();
        }
        return Ok(RawValue::List(items));
    }

    let mut value = String::new();
    loop {
        match chars.next() {
            None | Some(',') => break,
            Some('\\') => {
                if let Some(c) = chars.next() {
                    value.push(c)
                }
            }
            Some(c) => value.push(c),
        }
    }
    Ok(RawValue::Scalar(value))
}

/// Infers the type of a `--set` scalar.
pub(crate) fn typed(value: String) -> Value {
    if value.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if value.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if value.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if value == "0" {
        return Value::Number(0.into());
    }
    // leading zeros are kept as they are, e.g. for octal file modes
    if value.starts_with('0') {
        return Value::String(value);
    }
    match value.parse::<i64>() {
        Ok(i) => Value::Number(i.into()),
        Err(_) => Value::String(value),
    }
}

/// Sets `value` at `path` in `dest`, creating intermediate maps and lists,
/// and replacing anything of the wrong shape on the way.
pub(crate) fn set(dest: &mut Mapping, path: &[Segment], value: Value) -> Result<(), Error> {
    match path.split_first() {
        Some((Segment::Key(key), rest)) => {
            let slot = dest
                .entry(Value::String(key.clone()))
                .or_insert(Value::Null);
            set_in(slot, rest, value);
            Ok(())
        }
        _ => Err(Error::Values("value path must start with a name".to_string())),
    }
}

fn set_in(target: &mut Value, path: &[Segment], value: Value) {
    match path.split_first() {
        None => *target = value,
        Some((Segment::Key(key), rest)) => {
            if !target.is_mapping() {
                *target = Value::Mapping(Mapping::new());
            }
            if let Value::Mapping(map) = target {
                let slot = map.entry(Value::String(key.clone())).or_insert(Value::Null);
                set_in(slot, rest, value);
            }
        }
        Some((Segment::Index(index), rest)) => {
            if !target.is_sequence() {
                *target = Value::Sequence(Vec::new());
            }
            if let Value::Sequence(seq) = target {
                if seq.len() <= *index {
                    seq.resize(index + 1, Value::Null);
                }
                set_in(&mut seq[*index], rest, value);
            }
        }
    }
}

//! Semicolon separated parameter lists used by URIs and headers

use crate::parse::{IResult, parse_quoted, slice_str, token};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::multi::many0;
use nom::sequence::{preceded, tuple};
use std::fmt;

/// A single `;name` or `;name=value` parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: BytesStr,
    pub value: Option<BytesStr>,
}

impl Param {
    pub fn new<N, V>(name: N, value: V) -> Self
    where
        N: Into<BytesStr>,
        V: Into<BytesStr>,
    {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag<N: Into<BytesStr>>(name: N) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;

        if let Some(value) = &self.value {
            write!(f, "={value}")?;
        }

        Ok(())
    }
}

/// Ordered list of [`Param`]s, printed with a leading `;` each
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    inner: Vec<Param>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.inner.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.inner.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Param> {
        self.inner
            .iter_mut()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// The value of the parameter `name`, if present with a value
    pub fn get_val(&self, name: &str) -> Option<&BytesStr> {
        self.get(name).and_then(|p| p.value.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, param: Param) {
        self.inner.push(param);
    }

    /// Replace the value of `name` or append a new parameter
    pub fn push_or_edit<N, V>(&mut self, name: N, value: V)
    where
        N: Into<BytesStr>,
        V: Into<BytesStr>,
    {
        let name = name.into();
        let value = value.into();

        if let Some(param) = self.get_mut(&name) {
            param.value = Some(value);
        } else {
            self.inner.push(Param::new(name, value));
        }
    }

    /// Remove the parameter `name` and return its value
    pub fn take(&mut self, name: &str) -> Option<BytesStr> {
        let idx = self
            .inner
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))?;

        self.inner.remove(idx).value
    }

    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                many0(preceded(
                    char(';'),
                    tuple((
                        take_while1(token),
                        opt(preceded(
                            char('='),
                            alt((parse_quoted, take_while1(param_value))),
                        )),
                    )),
                )),
                |params| Params {
                    inner: params
                        .into_iter()
                        .map(|(name, value)| Param {
                            name: slice_str(src, name),
                            value: value.map(|v| slice_str(src, v)),
                        })
                        .collect(),
                },
            )(i)
        }
    }
}

impl FromIterator<Param> for Params {
    fn from_iter<T: IntoIterator<Item = Param>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for param in &self.inner {
            write!(f, ";{param}")?;
        }

        Ok(())
    }
}

#[rustfmt::skip]
fn param_value(c: char) -> bool {
    token(c) || matches!(c, '[' | ']' | ':' | '/')
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(i: &'static str) -> Params {
        let src = Bytes::from_static(i.as_bytes());
        let i = std::str::from_utf8(&src).unwrap();

        Params::parse(&src)(i).unwrap().1
    }

    #[test]
    fn parse_params() {
        let params = parse(";branch=z9hG4bKabc;rport;received=10.0.0.1");

        assert_eq!(params.get_val("branch").unwrap(), "z9hG4bKabc");
        assert!(params.contains("rport"));
        assert_eq!(params.get_val("Received").unwrap(), "10.0.0.1");
        assert_eq!(params.get_val("rport"), None);
    }

    #[test]
    fn print_params() {
        let mut params = Params::new();
        params.push(Param::new("tag", "abc"));
        params.push(Param::flag("lr"));

        assert_eq!(params.to_string(), ";tag=abc;lr");
    }

    #[test]
    fn edit_params() {
        let mut params = parse(";rport");

        params.push_or_edit("rport", "5060");
        assert_eq!(params.get_val("rport").unwrap(), "5060");

        assert_eq!(params.take("rport").unwrap(), "5060");
        assert!(params.is_empty());
    }
}

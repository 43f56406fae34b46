//! Ordered multimap of raw header values with typed decode on demand

use super::{HeaderError, Name, TypedHeader};
use bytesstr::BytesStr;
use std::fmt;

/// All headers of a message, stored as raw values in wire order.
///
/// Values are neither parsed nor validated on insertion; typed accessors
/// decode lazily and report [`HeaderError`] on malformed input.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(Name, BytesStr)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a raw header value
    pub fn insert<V: Into<BytesStr>>(&mut self, name: Name, value: V) {
        self.entries.push((name, value.into()));
    }

    /// Prepend a raw header value, used for Via stacking
    pub fn insert_front<V: Into<BytesStr>>(&mut self, name: Name, value: V) {
        self.entries.insert(0, (name, value.into()));
    }

    /// Encode a typed header and append it
    pub fn insert_typed<H: TypedHeader>(&mut self, header: &H) {
        self.insert(H::NAME, header.to_string());
    }

    /// Encode a typed header and prepend it
    pub fn insert_typed_front<H: TypedHeader>(&mut self, header: &H) {
        self.insert_front(H::NAME, header.to_string());
    }

    /// Replace all values of the header's name with the given one
    pub fn set_typed<H: TypedHeader>(&mut self, header: &H) {
        self.remove(&H::NAME);
        self.insert_typed(header);
    }

    pub fn set<V: Into<BytesStr>>(&mut self, name: Name, value: V) {
        self.remove(&name);
        self.insert(name, value);
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// First raw value of `name`
    pub fn get(&self, name: &Name) -> Option<&BytesStr> {
        self.entries
            .iter()
            .find_map(|(n, v)| (n == name).then_some(v))
    }

    /// All raw values of `name` in wire order
    pub fn get_all<'s>(&'s self, name: &'s Name) -> impl Iterator<Item = &'s BytesStr> + 's {
        self.entries
            .iter()
            .filter_map(move |(n, v)| (n == name).then_some(v))
    }

    /// Remove every value of `name`
    pub fn remove(&mut self, name: &Name) {
        self.entries.retain(|(n, _)| n != name);
    }

    /// Remove and return the first value of `name`
    pub fn take(&mut self, name: &Name) -> Option<BytesStr> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;

        Some(self.entries.remove(idx).1)
    }

    /// Copy all values of `name` into `dst`
    pub fn clone_into(&self, dst: &mut Headers, name: Name) {
        for value in self.get_all(&name) {
            dst.insert(name.clone(), value.clone());
        }
    }

    /// Decode the first value of `H::NAME`
    pub fn typed<H: TypedHeader>(&self) -> Result<H, HeaderError> {
        self.try_typed::<H>()?
            .ok_or(HeaderError::Missing(H::NAME))
    }

    /// Decode the first value of `name` as `H`, for types shared between
    /// header positions (From/To, the authentication pairs)
    pub fn typed_named<H: TypedHeader>(&self, name: &Name) -> Result<H, HeaderError> {
        let value = self
            .get(name)
            .ok_or_else(|| HeaderError::Missing(name.clone()))?;

        let (_, header) = H::parse(value.as_ref(), value.as_str().trim())
            .map_err(|_| HeaderError::malformed(name.clone(), value))?;

        Ok(header)
    }

    /// Encode a typed header under an explicit name and append it
    pub fn insert_typed_named<H: TypedHeader>(&mut self, name: Name, header: &H) {
        self.insert(name, header.to_string());
    }

    /// Decode the first value of `H::NAME`, `None` when absent
    pub fn try_typed<H: TypedHeader>(&self) -> Result<Option<H>, HeaderError> {
        let Some(value) = self.get(&H::NAME) else {
            return Ok(None);
        };

        decode_one::<H>(value).map(Some)
    }

    /// Decode every value of `H::NAME`, splitting comma separated lists
    pub fn typed_list<H: TypedHeader>(&self) -> Result<Vec<H>, HeaderError> {
        let mut out = Vec::new();

        for value in self.get_all(&H::NAME) {
            let mut i = value.as_str().trim();

            while !i.is_empty() {
                let (rest, header) = H::parse(value.as_ref(), i)
                    .map_err(|_| HeaderError::malformed(H::NAME, value))?;

                out.push(header);

                let rest = rest.trim_start();
                i = match rest.strip_prefix(',') {
                    Some(rest) => rest.trim_start(),
                    None if rest.is_empty() => rest,
                    None => return Err(HeaderError::malformed(H::NAME, value)),
                };
            }
        }

        Ok(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Name, &BytesStr)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }
}

fn decode_one<H: TypedHeader>(value: &BytesStr) -> Result<H, HeaderError> {
    let (_, header) = H::parse(value.as_ref(), value.as_str().trim())
        .map_err(|_| HeaderError::malformed(H::NAME, value))?;

    Ok(header)
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}: {value}\r\n")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::typed::CSeq;
    use crate::Method;

    #[test]
    fn insert_and_get() {
        let mut headers = Headers::new();
        headers.insert(Name::from("i"), "abc@host");

        assert_eq!(headers.get(&Name::CALL_ID).unwrap(), "abc@host");
        assert!(headers.contains(&Name::from("Call-Id")));
    }

    #[test]
    fn typed_roundtrip() {
        let mut headers = Headers::new();
        headers.insert_typed(&CSeq::new(42, Method::INVITE));

        let cseq: CSeq = headers.typed().unwrap();
        assert_eq!(cseq.cseq, 42);
        assert_eq!(cseq.method, Method::INVITE);
    }

    #[test]
    fn display_prints_canonical_names() {
        let mut headers = Headers::new();
        headers.insert(Name::from("l"), "0");

        assert_eq!(headers.to_string(), "Content-Length: 0\r\n");
    }
}

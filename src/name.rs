//! DNS name representation.
//!
//! A [`Name`] is a sequence of length-prefixed labels in wire order (leftmost
//! label first), plus an offset index so individual labels can be addressed
//! without rescanning. Absolute names end with the empty root label; relative
//! names do not. Both kinds can coexist in the same trie because the key
//! codec keeps them in disjoint subtrees.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

/// Maximum wire length of a name, including the root label.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a single label.
pub const MAX_LABEL_LEN: usize = 63;

/// Errors from parsing a name out of presentation format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    /// The input was empty.
    #[error("empty name")]
    Empty,
    /// A label was empty (`a..b`) or the name began with a dot.
    #[error("empty label")]
    EmptyLabel,
    /// A label exceeded [`MAX_LABEL_LEN`] bytes.
    #[error("label longer than {MAX_LABEL_LEN} bytes")]
    LabelTooLong,
    /// The whole name exceeded [`MAX_NAME_LEN`] bytes in wire form.
    #[error("name longer than {MAX_NAME_LEN} bytes")]
    NameTooLong,
    /// A backslash escape was truncated or out of range.
    #[error("bad escape sequence")]
    BadEscape,
}

/// A DNS name: length-prefixed labels with a label-offset index.
#[derive(Clone)]
pub struct Name {
    /// Wire-format label data: for each label, a length byte then that many
    /// data bytes. An absolute name ends with a zero length byte.
    ndata: Vec<u8>,
    /// Offset of each label's length byte within `ndata`, leftmost first.
    offsets: Vec<u8>,
}

impl Name {
    /// The root name `.`.
    pub fn root() -> Self {
        Name {
            ndata: vec![0],
            offsets: vec![0],
        }
    }

    /// Parse a name from presentation format.
    ///
    /// A trailing unescaped dot makes the name absolute. `\DDD` (three
    /// decimal digits) and `\X` escapes are accepted per RFC 1035
    /// presentation syntax.
    ///
    /// ```
    /// use dnsqp::Name;
    ///
    /// let rel = Name::from_text("www.example").unwrap();
    /// assert!(!rel.is_absolute());
    /// let abs = Name::from_text("www.example.").unwrap();
    /// assert!(abs.is_absolute());
    /// assert_eq!(abs.label_count(), 3);
    /// ```
    pub fn from_text(text: &str) -> Result<Self, NameError> {
        if text.is_empty() {
            return Err(NameError::Empty);
        }
        if text == "." {
            return Ok(Name::root());
        }

        let mut ndata = Vec::with_capacity(text.len() + 1);
        let mut offsets = Vec::new();
        let mut label = Vec::with_capacity(MAX_LABEL_LEN);
        let mut absolute = false;

        let mut bytes = text.bytes().peekable();
        loop {
            match bytes.next() {
                Some(b'.') => {
                    if label.is_empty() {
                        return Err(NameError::EmptyLabel);
                    }
                    push_label(&mut ndata, &mut offsets, &label)?;
                    label.clear();
                    if bytes.peek().is_none() {
                        absolute = true;
                        break;
                    }
                }
                Some(b'\\') => label.push(unescape(&mut bytes)?),
                Some(b) => label.push(b),
                None => break,
            }
        }
        if !label.is_empty() {
            push_label(&mut ndata, &mut offsets, &label)?;
        }
        if absolute {
            offsets.push(ndata.len() as u8);
            ndata.push(0);
        }
        if ndata.len() > MAX_NAME_LEN {
            return Err(NameError::NameTooLong);
        }
        Ok(Name { ndata, offsets })
    }

    /// Number of labels, counting the root label of an absolute name.
    pub fn label_count(&self) -> usize {
        self.offsets.len()
    }

    /// True when the name ends with the empty root label.
    pub fn is_absolute(&self) -> bool {
        *self.ndata.last().expect("name has at least one label") == 0
    }

    /// The data bytes of label `i` (leftmost label is 0), without the
    /// length prefix.
    pub fn label(&self, i: usize) -> &[u8] {
        let off = self.offsets[i] as usize;
        let len = self.ndata[off] as usize;
        &self.ndata[off + 1..off + 1 + len]
    }

    /// Iterate over label data, leftmost label first.
    pub fn labels(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.label_count()).map(|i| self.label(i))
    }

    /// Wire-format bytes of the name.
    pub fn as_wire(&self) -> &[u8] {
        &self.ndata
    }
}

fn push_label(ndata: &mut Vec<u8>, offsets: &mut Vec<u8>, label: &[u8]) -> Result<(), NameError> {
    if label.len() > MAX_LABEL_LEN {
        return Err(NameError::LabelTooLong);
    }
    if ndata.len() + 1 + label.len() > MAX_NAME_LEN {
        return Err(NameError::NameTooLong);
    }
    offsets.push(ndata.len() as u8);
    ndata.push(label.len() as u8);
    ndata.extend_from_slice(label);
    Ok(())
}

fn unescape(bytes: &mut std::iter::Peekable<std::str::Bytes<'_>>) -> Result<u8, NameError> {
    let first = bytes.next().ok_or(NameError::BadEscape)?;
    if !first.is_ascii_digit() {
        return Ok(first);
    }
    let mut value = (first - b'0') as u16;
    for _ in 0..2 {
        let d = bytes.next().ok_or(NameError::BadEscape)?;
        if !d.is_ascii_digit() {
            return Err(NameError::BadEscape);
        }
        value = value * 10 + (d - b'0') as u16;
    }
    u8::try_from(value).map_err(|_| NameError::BadEscape)
}

/// Names compare in DNS canonical order: by most significant (rightmost)
/// label first, case-insensitively, with a missing label sorting before any
/// present label. This matches the lexicographic order of the trie keys
/// produced by the key codec.
impl Ord for Name {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut a = (0..self.label_count()).rev().map(|i| self.label(i));
        let mut b = (0..other.label_count()).rev().map(|i| other.label(i));
        loop {
            match (a.next(), b.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(la), Some(lb)) => {
                    let folded = la
                        .iter()
                        .map(|c| c.to_ascii_lowercase())
                        .cmp(lb.iter().map(|c| c.to_ascii_lowercase()));
                    if folded != Ordering::Equal {
                        return folded;
                    }
                }
            }
        }
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Name {}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ndata == [0] {
            return write!(f, ".");
        }
        for (i, label) in self.labels().enumerate() {
            if label.is_empty() {
                // root label of an absolute name
                write!(f, ".")?;
                continue;
            }
            if i > 0 {
                write!(f, ".")?;
            }
            for &b in label {
                match b {
                    b'.' | b'\\' => write!(f, "\\{}", b as char)?,
                    0x21..=0x7e => write!(f, "{}", b as char)?,
                    _ => write!(f, "\\{:03}", b)?,
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

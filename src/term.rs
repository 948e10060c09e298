//! External-term-format codec for the on-disk term subset.
//!
//! Only the shapes that actually appear in a database file are supported:
//! integers, atoms, binaries, lists, and tuples. Every encoded term starts
//! with the `0x83` format magic; tags follow the external term format so the
//! serialized prefix of a leaf node is stable enough to search for in raw
//! file bytes.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

pub const TERM_MAGIC: u8 = 0x83;

const TAG_SMALL_INTEGER: u8 = 0x61;
const TAG_INTEGER: u8 = 0x62;
const TAG_ATOM: u8 = 0x64;
const TAG_SMALL_TUPLE: u8 = 0x68;
const TAG_LARGE_TUPLE: u8 = 0x69;
const TAG_NIL: u8 = 0x6A;
const TAG_LIST: u8 = 0x6C;
const TAG_BINARY: u8 = 0x6D;
const TAG_SMALL_BIG: u8 = 0x6E;

/// Nesting bound for the decoder; scan input is attacker-shaped bytes.
const MAX_DEPTH: usize = 128;

#[derive(Debug, Error)]
pub enum TermError {
    #[error("term does not start with the format magic")]
    BadMagic,
    #[error("truncated term")]
    Truncated,
    #[error("unknown term tag {0:#04x}")]
    UnknownTag(u8),
    #[error("term nesting exceeds decoder limit")]
    TooDeep,
    #[error("length field overflows remaining input")]
    LengthOverflow,
    #[error("trailing bytes after term")]
    Trailing,
    #[error("atom is not valid utf-8")]
    InvalidAtom,
    #[error("list has a non-nil tail")]
    ImproperList,
    #[error("big integer does not fit in 64 bits")]
    BigOutOfRange,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Term {
    Int(i64),
    Atom(String),
    Binary(Vec<u8>),
    List(Vec<Term>),
    Tuple(Vec<Term>),
}

impl Term {
    pub fn atom(name: &str) -> Term {
        Term::Atom(name.to_string())
    }

    pub fn nil() -> Term {
        Term::Atom("nil".to_string())
    }

    pub fn bool(value: bool) -> Term {
        Term::Atom(if value { "true" } else { "false" }.to_string())
    }

    pub fn is_atom(&self, name: &str) -> bool {
        matches!(self, Term::Atom(a) if a == name)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Term::Atom(a) if a == "true" => Some(true),
            Term::Atom(a) if a == "false" => Some(false),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Term::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Term::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Term]> {
        match self {
            Term::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Int(v) => write!(f, "{v}"),
            Term::Atom(a) => write!(f, "{a}"),
            Term::Binary(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "<<{s:?}>>"),
                Err(_) => write!(f, "<<{} bytes>>", b.len()),
            },
            Term::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Term::Tuple(items) => {
                write!(f, "{{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Total order over terms: integers, then atoms, then tuples, lists, and
/// binaries, mirroring the term order of the source format. Tree keys are
/// homogeneous in practice, but the comparator must still be total.
pub fn term_cmp(a: &Term, b: &Term) -> Ordering {
    fn rank(t: &Term) -> u8 {
        match t {
            Term::Int(_) => 0,
            Term::Atom(_) => 1,
            Term::Tuple(_) => 2,
            Term::List(_) => 3,
            Term::Binary(_) => 4,
        }
    }

    match (a, b) {
        (Term::Int(x), Term::Int(y)) => x.cmp(y),
        (Term::Atom(x), Term::Atom(y)) => x.cmp(y),
        (Term::Binary(x), Term::Binary(y)) => x.cmp(y),
        (Term::Tuple(x), Term::Tuple(y)) => {
            x.len().cmp(&y.len()).then_with(|| seq_cmp(x, y))
        }
        (Term::List(x), Term::List(y)) => {
            seq_cmp(x, y).then_with(|| x.len().cmp(&y.len()))
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

fn seq_cmp(a: &[Term], b: &[Term]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = term_cmp(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub fn encode(term: &Term) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(TERM_MAGIC);
    encode_into(term, &mut out);
    out
}

fn encode_into(term: &Term, out: &mut Vec<u8>) {
    match term {
        Term::Int(v) => encode_int(*v, out),
        Term::Atom(name) => {
            let bytes = name.as_bytes();
            debug_assert!(bytes.len() <= u16::MAX as usize);
            out.push(TAG_ATOM);
            out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        Term::Binary(bytes) => {
            out.push(TAG_BINARY);
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(bytes);
        }
        Term::List(items) => {
            if items.is_empty() {
                out.push(TAG_NIL);
            } else {
                out.push(TAG_LIST);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    encode_into(item, out);
                }
                out.push(TAG_NIL);
            }
        }
        Term::Tuple(items) => {
            if items.len() <= u8::MAX as usize {
                out.push(TAG_SMALL_TUPLE);
                out.push(items.len() as u8);
            } else {
                out.push(TAG_LARGE_TUPLE);
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
            }
            for item in items {
                encode_into(item, out);
            }
        }
    }
}

fn encode_int(v: i64, out: &mut Vec<u8>) {
    if (0..=255).contains(&v) {
        out.push(TAG_SMALL_INTEGER);
        out.push(v as u8);
    } else if (i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&v) {
        out.push(TAG_INTEGER);
        out.extend_from_slice(&(v as i32).to_be_bytes());
    } else {
        let sign = if v < 0 { 1 } else { 0 };
        let mut magnitude = v.unsigned_abs();
        let mut digits = Vec::with_capacity(8);
        while magnitude > 0 {
            digits.push((magnitude & 0xFF) as u8);
            magnitude >>= 8;
        }
        out.push(TAG_SMALL_BIG);
        out.push(digits.len() as u8);
        out.push(sign);
        out.extend_from_slice(&digits);
    }
}

/// Decodes one term, returning it along with the number of input bytes
/// consumed.
pub fn decode(bytes: &[u8]) -> Result<(Term, usize), TermError> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    if reader.take_u8()? != TERM_MAGIC {
        return Err(TermError::BadMagic);
    }
    let term = decode_value(&mut reader, 0)?;
    Ok((term, reader.pos))
}

/// Decodes one term and requires the input to be fully consumed.
pub fn decode_exact(bytes: &[u8]) -> Result<Term, TermError> {
    let (term, consumed) = decode(bytes)?;
    if consumed != bytes.len() {
        return Err(TermError::Trailing);
    }
    Ok(term)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take_u8(&mut self) -> Result<u8, TermError> {
        let b = *self.buf.get(self.pos).ok_or(TermError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn take_u16(&mut self) -> Result<u16, TermError> {
        let slice = self.take_slice(2)?;
        Ok(u16::from_be_bytes([slice[0], slice[1]]))
    }

    fn take_u32(&mut self) -> Result<u32, TermError> {
        let slice = self.take_slice(4)?;
        Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn take_slice(&mut self, n: usize) -> Result<&'a [u8], TermError> {
        if self.remaining() < n {
            return Err(TermError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

fn decode_value(reader: &mut Reader<'_>, depth: usize) -> Result<Term, TermError> {
    if depth > MAX_DEPTH {
        return Err(TermError::TooDeep);
    }
    let tag = reader.take_u8()?;
    match tag {
        TAG_SMALL_INTEGER => Ok(Term::Int(i64::from(reader.take_u8()?))),
        TAG_INTEGER => {
            let slice = reader.take_slice(4)?;
            Ok(Term::Int(i64::from(i32::from_be_bytes([
                slice[0], slice[1], slice[2], slice[3],
            ]))))
        }
        TAG_SMALL_BIG => {
            let n = reader.take_u8()? as usize;
            let sign = reader.take_u8()?;
            if n > 8 {
                return Err(TermError::BigOutOfRange);
            }
            let digits = reader.take_slice(n)?;
            let mut magnitude: u64 = 0;
            for (i, &d) in digits.iter().enumerate() {
                magnitude |= u64::from(d) << (8 * i);
            }
            let value = if sign == 0 {
                i64::try_from(magnitude).map_err(|_| TermError::BigOutOfRange)?
            } else if magnitude == i64::MAX as u64 + 1 {
                i64::MIN
            } else {
                let m = i64::try_from(magnitude).map_err(|_| TermError::BigOutOfRange)?;
                -m
            };
            Ok(Term::Int(value))
        }
        TAG_ATOM => {
            let len = reader.take_u16()? as usize;
            let bytes = reader.take_slice(len)?;
            let name = std::str::from_utf8(bytes).map_err(|_| TermError::InvalidAtom)?;
            Ok(Term::Atom(name.to_string()))
        }
        TAG_BINARY => {
            let len = reader.take_u32()? as usize;
            if len > reader.remaining() {
                return Err(TermError::LengthOverflow);
            }
            Ok(Term::Binary(reader.take_slice(len)?.to_vec()))
        }
        TAG_NIL => Ok(Term::List(Vec::new())),
        TAG_LIST => {
            let count = reader.take_u32()? as usize;
            if count > reader.remaining() {
                return Err(TermError::LengthOverflow);
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(reader, depth + 1)?);
            }
            if reader.take_u8()? != TAG_NIL {
                return Err(TermError::ImproperList);
            }
            Ok(Term::List(items))
        }
        TAG_SMALL_TUPLE => {
            let arity = reader.take_u8()? as usize;
            decode_tuple(reader, arity, depth)
        }
        TAG_LARGE_TUPLE => {
            let arity = reader.take_u32()? as usize;
            if arity > reader.remaining() {
                return Err(TermError::LengthOverflow);
            }
            decode_tuple(reader, arity, depth)
        }
        other => Err(TermError::UnknownTag(other)),
    }
}

fn decode_tuple(
    reader: &mut Reader<'_>,
    arity: usize,
    depth: usize,
) -> Result<Term, TermError> {
    let mut items = Vec::with_capacity(arity.min(64));
    for _ in 0..arity {
        items.push(decode_value(reader, depth + 1)?);
    }
    Ok(Term::Tuple(items))
}

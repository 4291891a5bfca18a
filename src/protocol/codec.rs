//! Format-string driven pack/unpack in network byte order.
//!
//! Patterns follow the familiar `struct` notation with two twists forced by the
//! PostgreSQL wire format: byte order is always big-endian (endianness
//! characters are rejected), and `s` means a NUL-terminated string of unknown
//! width rather than a fixed-size buffer. Because a string's width is only
//! discovered while scanning, unpacking walks the buffer field by field instead
//! of precomputing a total size.
//!
//! | char | field | value |
//! |------|-------|-------|
//! | `x` | pad byte | none |
//! | `c` | raw byte | [`Value::Byte`] |
//! | `b` / `B` | 1-byte int | [`Value::I8`] / [`Value::U8`] |
//! | `?` | 1-byte bool | [`Value::Bool`] |
//! | `h` / `H` | 2-byte int | [`Value::I16`] / [`Value::U16`] |
//! | `i` `l` / `I` `L` | 4-byte int | [`Value::I32`] / [`Value::U32`] |
//! | `q` / `Q` | 8-byte int as two 4-byte halves | [`Value::I64`] / [`Value::U64`] |
//! | `s` | C-string | [`Value::Str`] |
//!
//! Digits immediately before a character repeat it (`3H` = `H H H`); `s` takes
//! no repeat count. Whitespace is ignored.
//!
//! `q` (signed 64-bit) is only available with the `experimental-i64` feature.

use bytes::{BufMut, BytesMut};

use crate::error::{PgWireError, Result};

/// One fixed- or variable-width field in a format pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Pad,
    Byte,
    I8,
    U8,
    Bool,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    CString,
}

impl Field {
    fn from_char(c: char) -> Result<Field> {
        let field = match c {
            'x' => Field::Pad,
            'c' => Field::Byte,
            'b' => Field::I8,
            'B' => Field::U8,
            '?' => Field::Bool,
            'h' => Field::I16,
            'H' => Field::U16,
            'i' | 'l' => Field::I32,
            'I' | 'L' => Field::U32,
            'q' => Field::I64,
            'Q' => Field::U64,
            's' => Field::CString,
            '@' | '=' | '<' | '>' | '!' => {
                return Err(PgWireError::InvalidFormat(format!(
                    "byte order is always network order; '{c}' is not allowed"
                )));
            }
            'p' | 'n' | 'N' | 'P' => {
                return Err(PgWireError::InvalidFormat(format!(
                    "'{c}' is a native-only format character"
                )));
            }
            other => {
                return Err(PgWireError::InvalidFormat(format!(
                    "unknown format character {other:?}"
                )));
            }
        };
        Ok(field)
    }

    /// Wire width in bytes, or `None` for C-strings.
    pub fn width(self) -> Option<usize> {
        match self {
            Field::Pad | Field::Byte | Field::I8 | Field::U8 | Field::Bool => Some(1),
            Field::I16 | Field::U16 => Some(2),
            Field::I32 | Field::U32 => Some(4),
            Field::I64 | Field::U64 => Some(8),
            Field::CString => None,
        }
    }

    fn carries_value(self) -> bool {
        !matches!(self, Field::Pad)
    }
}

/// A parsed format pattern.
///
/// Specs are cheap value objects; message codecs re-derive them from their
/// pattern on every call rather than caching them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
    fields: Vec<Field>,
}

impl FormatSpec {
    pub fn parse(pattern: &str) -> Result<FormatSpec> {
        let mut fields = Vec::new();
        let mut count: Option<usize> = None;

        for c in pattern.chars() {
            if c.is_ascii_whitespace() {
                if count.is_some() {
                    return Err(PgWireError::InvalidFormat(format!(
                        "repeat count must immediately precede its character in {pattern:?}"
                    )));
                }
                continue;
            }

            if let Some(d) = c.to_digit(10) {
                let n = count
                    .unwrap_or(0)
                    .checked_mul(10)
                    .and_then(|n| n.checked_add(d as usize))
                    .ok_or_else(|| {
                        PgWireError::InvalidFormat(format!("repeat count overflow in {pattern:?}"))
                    })?;
                count = Some(n);
                continue;
            }

            let field = Field::from_char(c)?;
            match (field, count.take()) {
                (Field::CString, Some(_)) => {
                    return Err(PgWireError::InvalidFormat(
                        "C-strings are variable width and take no repeat count".into(),
                    ));
                }
                (field, Some(n)) => fields.extend(std::iter::repeat_n(field, n)),
                (field, None) => fields.push(field),
            }
        }

        if count.is_some() {
            return Err(PgWireError::InvalidFormat(format!(
                "dangling repeat count at end of {pattern:?}"
            )));
        }

        Ok(FormatSpec { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of values this spec produces or consumes (pad bytes excluded).
    pub fn arity(&self) -> usize {
        self.fields.iter().filter(|f| f.carries_value()).count()
    }

    /// Total encoded width, if the spec contains no C-strings.
    pub fn fixed_width(&self) -> Option<usize> {
        self.fields.iter().map(|f| f.width()).sum()
    }

    pub fn pack_into(&self, values: &[Value], out: &mut BytesMut) -> Result<()> {
        if values.len() != self.arity() {
            return Err(PgWireError::InvalidFormat(format!(
                "format takes {} values, got {}",
                self.arity(),
                values.len()
            )));
        }

        // Encode into scratch space so a mid-way failure leaves `out` untouched.
        let mut buf = BytesMut::with_capacity(self.fixed_width().unwrap_or(64));
        let mut values = values.iter();

        for (i, field) in self.fields.iter().copied().enumerate() {
            if field == Field::Pad {
                buf.put_u8(0);
                continue;
            }
            // arity was checked above
            let Some(value) = values.next() else {
                break;
            };
            match (field, value) {
                (Field::Byte, Value::Byte(v)) | (Field::U8, Value::U8(v)) => buf.put_u8(*v),
                (Field::I8, Value::I8(v)) => buf.put_i8(*v),
                (Field::Bool, Value::Bool(v)) => buf.put_u8(u8::from(*v)),
                (Field::I16, Value::I16(v)) => buf.put_i16(*v),
                (Field::U16, Value::U16(v)) => buf.put_u16(*v),
                (Field::I32, Value::I32(v)) => buf.put_i32(*v),
                (Field::U32, Value::U32(v)) => buf.put_u32(*v),
                (Field::U64, Value::U64(v)) => {
                    buf.put_u32((*v >> 32) as u32);
                    buf.put_u32(*v as u32);
                }
                (Field::I64, Value::I64(v)) => pack_i64(*v, &mut buf)?,
                (Field::CString, Value::Str(s)) => {
                    if s.as_bytes().contains(&0) {
                        return Err(PgWireError::InvalidFormat(format!(
                            "field {i}: string contains an interior NUL"
                        )));
                    }
                    buf.put_slice(s.as_bytes());
                    buf.put_u8(0);
                }
                (field, value) => {
                    return Err(PgWireError::InvalidFormat(format!(
                        "field {i}: {field:?} cannot hold {value:?}"
                    )));
                }
            }
        }

        out.extend_from_slice(&buf);
        Ok(())
    }

    pub fn unpack_from(&self, buf: &[u8], offset: usize) -> Result<(Vec<Value>, usize)> {
        if offset > buf.len() {
            return Err(PgWireError::LengthMismatch {
                expected: offset,
                actual: buf.len(),
            });
        }

        let mut pos = offset;
        let mut values = Vec::with_capacity(self.arity());

        for (i, field) in self.fields.iter().copied().enumerate() {
            let value = match field {
                Field::Pad => {
                    take(buf, &mut pos, 1)?;
                    continue;
                }
                Field::Byte => Value::Byte(take(buf, &mut pos, 1)?[0]),
                Field::I8 => Value::I8(take(buf, &mut pos, 1)?[0] as i8),
                Field::U8 => Value::U8(take(buf, &mut pos, 1)?[0]),
                Field::Bool => Value::Bool(take(buf, &mut pos, 1)?[0] != 0),
                Field::I16 => Value::I16(i16::from_be_bytes(take_array(buf, &mut pos)?)),
                Field::U16 => Value::U16(u16::from_be_bytes(take_array(buf, &mut pos)?)),
                Field::I32 => Value::I32(i32::from_be_bytes(take_array(buf, &mut pos)?)),
                Field::U32 => Value::U32(u32::from_be_bytes(take_array(buf, &mut pos)?)),
                Field::U64 => {
                    let high = u32::from_be_bytes(take_array(buf, &mut pos)?);
                    let low = u32::from_be_bytes(take_array(buf, &mut pos)?);
                    Value::U64((u64::from(high) << 32) | u64::from(low))
                }
                Field::I64 => Value::I64(unpack_i64(buf, &mut pos)?),
                Field::CString => {
                    let rest = &buf[pos..];
                    let nul = rest.iter().position(|&b| b == 0).ok_or(
                        PgWireError::LengthMismatch {
                            expected: buf.len() + 1,
                            actual: buf.len(),
                        },
                    )?;
                    let s = std::str::from_utf8(&rest[..nul]).map_err(|e| {
                        PgWireError::InvalidFormat(format!("field {i}: invalid utf-8: {e}"))
                    })?;
                    pos += nul + 1;
                    Value::Str(s.to_owned())
                }
            };
            values.push(value);
        }

        Ok((values, pos))
    }

    pub fn unpack_exact(&self, buf: &[u8]) -> Result<Vec<Value>> {
        let (values, consumed) = self.unpack_from(buf, 0)?;
        if consumed != buf.len() {
            return Err(PgWireError::LengthMismatch {
                expected: consumed,
                actual: buf.len(),
            });
        }
        Ok(values)
    }
}

#[cfg(feature = "experimental-i64")]
fn pack_i64(v: i64, buf: &mut BytesMut) -> Result<()> {
    // Arithmetic shift keeps the sign in the high half; the low half is raw bits.
    buf.put_i32((v >> 32) as i32);
    buf.put_u32(v as u32);
    Ok(())
}

#[cfg(not(feature = "experimental-i64"))]
fn pack_i64(_v: i64, _buf: &mut BytesMut) -> Result<()> {
    Err(PgWireError::Unsupported(
        "signed 64-bit fields need the experimental-i64 feature".into(),
    ))
}

#[cfg(feature = "experimental-i64")]
fn unpack_i64(buf: &[u8], pos: &mut usize) -> Result<i64> {
    let high = i32::from_be_bytes(take_array(buf, pos)?);
    let low = u32::from_be_bytes(take_array(buf, pos)?);
    Ok((i64::from(high) << 32) | i64::from(low))
}

#[cfg(not(feature = "experimental-i64"))]
fn unpack_i64(_buf: &[u8], _pos: &mut usize) -> Result<i64> {
    Err(PgWireError::Unsupported(
        "signed 64-bit fields need the experimental-i64 feature".into(),
    ))
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = *pos + n;
    if end > buf.len() {
        return Err(PgWireError::LengthMismatch {
            expected: end,
            actual: buf.len(),
        });
    }
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

fn take_array<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(buf, pos, N)?);
    Ok(out)
}

/// A decoded (or to-be-encoded) field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Byte(u8),
    I8(i8),
    U8(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Str(String),
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::I8(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::U8(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::I16(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::U16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

/// Typed, in-order access to unpacked values.
///
/// ```ignore
/// let mut f = Fields::unpack_exact("s s", payload)?;
/// let (name, value) = (f.string()?, f.string()?);
/// ```
#[derive(Debug)]
pub struct Fields {
    values: std::vec::IntoIter<Value>,
    index: usize,
}

macro_rules! typed_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&mut self) -> Result<$ty> {
            match self.next_value()? {
                Value::$variant(v) => Ok(v),
                other => Err(self.mismatch(stringify!($variant), &other)),
            }
        }
    };
}

impl Fields {
    pub fn new(values: Vec<Value>) -> Self {
        Fields {
            values: values.into_iter(),
            index: 0,
        }
    }

    pub fn unpack_exact(pattern: &str, buf: &[u8]) -> Result<Fields> {
        unpack_exact(pattern, buf).map(Fields::new)
    }

    fn next_value(&mut self) -> Result<Value> {
        let v = self.values.next().ok_or_else(|| {
            PgWireError::InvalidFormat(format!("missing value at field {}", self.index))
        })?;
        self.index += 1;
        Ok(v)
    }

    fn mismatch(&self, want: &str, got: &Value) -> PgWireError {
        PgWireError::InvalidFormat(format!(
            "field {}: expected {want}, got {got:?}",
            self.index - 1
        ))
    }

    typed_accessor!(byte, Byte, u8);
    typed_accessor!(i8, I8, i8);
    typed_accessor!(u8, U8, u8);
    typed_accessor!(bool, Bool, bool);
    typed_accessor!(i16, I16, i16);
    typed_accessor!(u16, U16, u16);
    typed_accessor!(i32, I32, i32);
    typed_accessor!(u32, U32, u32);
    typed_accessor!(i64, I64, i64);
    typed_accessor!(u64, U64, u64);
    typed_accessor!(string, Str, String);
}

/// Pack `values` according to `pattern`.
pub fn pack(pattern: &str, values: &[Value]) -> Result<Vec<u8>> {
    let mut out = BytesMut::new();
    pack_into(pattern, values, &mut out)?;
    Ok(out.to_vec())
}

/// Pack `values` according to `pattern`, appending to `out`.
pub fn pack_into(pattern: &str, values: &[Value], out: &mut BytesMut) -> Result<()> {
    FormatSpec::parse(pattern)?.pack_into(values, out)
}

/// Unpack from `buf` starting at `offset`; returns the values and the offset
/// just past the last consumed byte.
pub fn unpack_from(pattern: &str, buf: &[u8], offset: usize) -> Result<(Vec<Value>, usize)> {
    FormatSpec::parse(pattern)?.unpack_from(buf, offset)
}

/// Unpack all of `buf`; fails with `LengthMismatch` on leftover or missing bytes.
pub fn unpack_exact(pattern: &str, buf: &[u8]) -> Result<Vec<Value>> {
    FormatSpec::parse(pattern)?.unpack_exact(buf)
}

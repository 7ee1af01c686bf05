//! AMQP 1.0 primitive type system: the subset of constructors that appear in
//! connection-establishment performatives, plus enough of the rest to skip
//! over fields we do not interpret.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

type Result<T> = std::result::Result<T, CodecError>;

// Type constructors
mod code {
    pub const DESCRIBED: u8 = 0x00;
    pub const NULL: u8 = 0x40;
    pub const TRUE: u8 = 0x41;
    pub const FALSE: u8 = 0x42;
    pub const UINT0: u8 = 0x43;
    pub const ULONG0: u8 = 0x44;
    pub const LIST0: u8 = 0x45;
    pub const UBYTE: u8 = 0x50;
    pub const BYTE: u8 = 0x51;
    pub const SMALL_UINT: u8 = 0x52;
    pub const SMALL_ULONG: u8 = 0x53;
    pub const SMALL_INT: u8 = 0x54;
    pub const SMALL_LONG: u8 = 0x55;
    pub const BOOLEAN: u8 = 0x56;
    pub const USHORT: u8 = 0x60;
    pub const SHORT: u8 = 0x61;
    pub const UINT: u8 = 0x70;
    pub const INT: u8 = 0x71;
    pub const FLOAT: u8 = 0x72;
    pub const CHAR: u8 = 0x73;
    pub const ULONG: u8 = 0x80;
    pub const LONG: u8 = 0x81;
    pub const DOUBLE: u8 = 0x82;
    pub const TIMESTAMP: u8 = 0x83;
    pub const UUID: u8 = 0x98;
    pub const VBIN8: u8 = 0xa0;
    pub const STR8: u8 = 0xa1;
    pub const SYM8: u8 = 0xa3;
    pub const VBIN32: u8 = 0xb0;
    pub const STR32: u8 = 0xb1;
    pub const SYM32: u8 = 0xb3;
    pub const LIST8: u8 = 0xc0;
    pub const MAP8: u8 = 0xc1;
    pub const LIST32: u8 = 0xd0;
    pub const MAP32: u8 = 0xd1;
    pub const ARRAY8: u8 = 0xe0;
    pub const ARRAY32: u8 = 0xf0;
}

/// A decoded AMQP value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    Timestamp(i64),
    Uuid([u8; 16]),
    Binary(Vec<u8>),
    String(String),
    Symbol(String),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Array(Vec<Value>),
    Described(Box<Value>, Box<Value>),
}

impl Value {
    pub fn symbol(s: impl Into<String>) -> Self {
        Value::Symbol(s.into())
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text of a string or symbol.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Any unsigned integer that fits in a u64.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Ubyte(v) => Some(v as u64),
            Value::Ushort(v) => Some(v as u64),
            Value::Uint(v) => Some(v as u64),
            Value::Ulong(v) => Some(v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Ubyte(_) => "ubyte",
            Value::Ushort(_) => "ushort",
            Value::Uint(_) => "uint",
            Value::Ulong(_) => "ulong",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Char(_) => "char",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
            Value::Binary(_) => "binary",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Array(_) => "array",
            Value::Described(..) => "described",
        }
    }
}

#[inline]
fn ensure(buf: &[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(CodecError::Truncated {
            needed: n - buf.len(),
        });
    }
    Ok(())
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    ensure(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

fn utf8(bytes: &[u8], what: &'static str) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CodecError::InvalidUtf8(what))
}

/// Deepest nesting of described values and compounds accepted from a peer.
pub const MAX_NESTING: usize = 32;

/// Decode one value, advancing `buf` past it.
pub fn decode_value(buf: &mut &[u8]) -> Result<Value> {
    decode_nested(buf, 0)
}

fn decode_nested(buf: &mut &[u8], depth: usize) -> Result<Value> {
    let ctor = take_u8(buf)?;
    decode_with(ctor, buf, depth)
}

fn decode_with(ctor: u8, buf: &mut &[u8], depth: usize) -> Result<Value> {
    if depth > MAX_NESTING {
        return Err(CodecError::InvalidField {
            field: "nesting",
            reason: format!("deeper than {} levels", MAX_NESTING),
        });
    }
    let inner = depth + 1;
    let v = match ctor {
        code::DESCRIBED => {
            let descriptor = decode_nested(buf, inner)?;
            let value = decode_nested(buf, inner)?;
            Value::Described(Box::new(descriptor), Box::new(value))
        }
        code::NULL => Value::Null,
        code::TRUE => Value::Bool(true),
        code::FALSE => Value::Bool(false),
        code::BOOLEAN => Value::Bool(take_u8(buf)? != 0),
        code::UBYTE => Value::Ubyte(take_u8(buf)?),
        code::USHORT => {
            ensure(buf, 2)?;
            Value::Ushort(buf.get_u16())
        }
        code::UINT => Value::Uint(take_u32(buf)?),
        code::SMALL_UINT => Value::Uint(take_u8(buf)? as u32),
        code::UINT0 => Value::Uint(0),
        code::ULONG => {
            ensure(buf, 8)?;
            Value::Ulong(buf.get_u64())
        }
        code::SMALL_ULONG => Value::Ulong(take_u8(buf)? as u64),
        code::ULONG0 => Value::Ulong(0),
        code::BYTE => Value::Byte(take_u8(buf)? as i8),
        code::SHORT => {
            ensure(buf, 2)?;
            Value::Short(buf.get_i16())
        }
        code::INT => {
            ensure(buf, 4)?;
            Value::Int(buf.get_i32())
        }
        code::SMALL_INT => Value::Int(take_u8(buf)? as i8 as i32),
        code::LONG => {
            ensure(buf, 8)?;
            Value::Long(buf.get_i64())
        }
        code::SMALL_LONG => Value::Long(take_u8(buf)? as i8 as i64),
        code::FLOAT => {
            ensure(buf, 4)?;
            Value::Float(buf.get_f32())
        }
        code::DOUBLE => {
            ensure(buf, 8)?;
            Value::Double(buf.get_f64())
        }
        code::CHAR => {
            let c = take_u32(buf)?;
            Value::Char(char::from_u32(c).ok_or(CodecError::InvalidUtf8("char"))?)
        }
        code::TIMESTAMP => {
            ensure(buf, 8)?;
            Value::Timestamp(buf.get_i64())
        }
        code::UUID => {
            let mut id = [0u8; 16];
            id.copy_from_slice(take(buf, 16)?);
            Value::Uuid(id)
        }
        code::VBIN8 => {
            let n = take_u8(buf)? as usize;
            Value::Binary(take(buf, n)?.to_vec())
        }
        code::VBIN32 => {
            let n = take_u32(buf)? as usize;
            Value::Binary(take(buf, n)?.to_vec())
        }
        code::STR8 => {
            let n = take_u8(buf)? as usize;
            Value::String(utf8(take(buf, n)?, "string")?)
        }
        code::STR32 => {
            let n = take_u32(buf)? as usize;
            Value::String(utf8(take(buf, n)?, "string")?)
        }
        code::SYM8 => {
            let n = take_u8(buf)? as usize;
            Value::Symbol(utf8(take(buf, n)?, "symbol")?)
        }
        code::SYM32 => {
            let n = take_u32(buf)? as usize;
            Value::Symbol(utf8(take(buf, n)?, "symbol")?)
        }
        code::LIST0 => Value::List(Vec::new()),
        code::LIST8 | code::LIST32 => {
            let (mut body, count) = compound(ctor == code::LIST32, buf)?;
            let mut items = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                items.push(decode_nested(&mut body, inner)?);
            }
            Value::List(items)
        }
        code::MAP8 | code::MAP32 => {
            let (mut body, count) = compound(ctor == code::MAP32, buf)?;
            if count % 2 != 0 {
                return Err(CodecError::InvalidField {
                    field: "map",
                    reason: format!("odd element count {}", count),
                });
            }
            let mut pairs = Vec::with_capacity((count / 2).min(256));
            for _ in 0..count / 2 {
                let k = decode_nested(&mut body, inner)?;
                let v = decode_nested(&mut body, inner)?;
                pairs.push((k, v));
            }
            Value::Map(pairs)
        }
        code::ARRAY8 | code::ARRAY32 => {
            let (mut body, count) = compound(ctor == code::ARRAY32, buf)?;
            let elem = take_u8(&mut body)?;
            let mut items = Vec::with_capacity(count.min(256));
            if elem == code::DESCRIBED {
                let descriptor = decode_nested(&mut body, inner)?;
                let elem = take_u8(&mut body)?;
                for _ in 0..count {
                    let v = decode_with(elem, &mut body, inner)?;
                    items.push(Value::Described(Box::new(descriptor.clone()), Box::new(v)));
                }
            } else {
                for _ in 0..count {
                    items.push(decode_with(elem, &mut body, inner)?);
                }
            }
            Value::Array(items)
        }
        other => return Err(CodecError::UnknownConstructor(other)),
    };
    Ok(v)
}

// Split off a compound body. Size covers the count field and the elements.
fn compound<'a>(wide: bool, buf: &mut &'a [u8]) -> Result<(&'a [u8], usize)> {
    let (size, count_len) = if wide {
        (take_u32(buf)? as usize, 4)
    } else {
        (take_u8(buf)? as usize, 1)
    };
    let mut body = take(buf, size)?;
    if size < count_len {
        return Err(CodecError::Truncated {
            needed: count_len - size,
        });
    }
    let count = if wide {
        body.get_u32() as usize
    } else {
        body.get_u8() as usize
    };
    Ok((body, count))
}

/// Encode one value with its constructor.
pub fn encode_value(v: &Value, buf: &mut BytesMut) -> Result<()> {
    match v {
        Value::Null => buf.put_u8(code::NULL),
        Value::Bool(true) => buf.put_u8(code::TRUE),
        Value::Bool(false) => buf.put_u8(code::FALSE),
        Value::Ubyte(n) => {
            buf.put_u8(code::UBYTE);
            buf.put_u8(*n);
        }
        Value::Ushort(n) => {
            buf.put_u8(code::USHORT);
            buf.put_u16(*n);
        }
        Value::Uint(0) => buf.put_u8(code::UINT0),
        Value::Uint(n) if *n < 256 => {
            buf.put_u8(code::SMALL_UINT);
            buf.put_u8(*n as u8);
        }
        Value::Uint(n) => {
            buf.put_u8(code::UINT);
            buf.put_u32(*n);
        }
        Value::Ulong(0) => buf.put_u8(code::ULONG0),
        Value::Ulong(n) if *n < 256 => {
            buf.put_u8(code::SMALL_ULONG);
            buf.put_u8(*n as u8);
        }
        Value::Ulong(n) => {
            buf.put_u8(code::ULONG);
            buf.put_u64(*n);
        }
        Value::Byte(n) => {
            buf.put_u8(code::BYTE);
            buf.put_i8(*n);
        }
        Value::Short(n) => {
            buf.put_u8(code::SHORT);
            buf.put_i16(*n);
        }
        Value::Int(n) if i8::try_from(*n).is_ok() => {
            buf.put_u8(code::SMALL_INT);
            buf.put_i8(*n as i8);
        }
        Value::Int(n) => {
            buf.put_u8(code::INT);
            buf.put_i32(*n);
        }
        Value::Long(n) if i8::try_from(*n).is_ok() => {
            buf.put_u8(code::SMALL_LONG);
            buf.put_i8(*n as i8);
        }
        Value::Long(n) => {
            buf.put_u8(code::LONG);
            buf.put_i64(*n);
        }
        Value::Float(f) => {
            buf.put_u8(code::FLOAT);
            buf.put_f32(*f);
        }
        Value::Double(f) => {
            buf.put_u8(code::DOUBLE);
            buf.put_f64(*f);
        }
        Value::Char(c) => {
            buf.put_u8(code::CHAR);
            buf.put_u32(*c as u32);
        }
        Value::Timestamp(t) => {
            buf.put_u8(code::TIMESTAMP);
            buf.put_i64(*t);
        }
        Value::Uuid(id) => {
            buf.put_u8(code::UUID);
            buf.put_slice(id);
        }
        Value::Binary(b) => put_variable(buf, code::VBIN8, code::VBIN32, b)?,
        Value::String(s) => put_variable(buf, code::STR8, code::STR32, s.as_bytes())?,
        Value::Symbol(s) => put_variable(buf, code::SYM8, code::SYM32, s.as_bytes())?,
        Value::List(items) if items.is_empty() => buf.put_u8(code::LIST0),
        Value::List(items) => {
            let mut body = BytesMut::new();
            for item in items {
                encode_value(item, &mut body)?;
            }
            put_compound(buf, code::LIST8, code::LIST32, items.len(), &body)?;
        }
        Value::Map(pairs) => {
            let mut body = BytesMut::new();
            for (k, v) in pairs {
                encode_value(k, &mut body)?;
                encode_value(v, &mut body)?;
            }
            put_compound(buf, code::MAP8, code::MAP32, pairs.len() * 2, &body)?;
        }
        Value::Array(items) => encode_array(items, buf)?,
        Value::Described(descriptor, value) => {
            buf.put_u8(code::DESCRIBED);
            encode_value(descriptor, buf)?;
            encode_value(value, buf)?;
        }
    }
    Ok(())
}

fn put_variable(buf: &mut BytesMut, short: u8, wide: u8, bytes: &[u8]) -> Result<()> {
    if bytes.len() < 256 {
        buf.put_u8(short);
        buf.put_u8(bytes.len() as u8);
    } else {
        let n = u32::try_from(bytes.len()).map_err(|_| CodecError::TooLarge("variable-width value"))?;
        buf.put_u8(wide);
        buf.put_u32(n);
    }
    buf.put_slice(bytes);
    Ok(())
}

fn put_compound(buf: &mut BytesMut, short: u8, wide: u8, count: usize, body: &[u8]) -> Result<()> {
    if body.len() + 1 < 256 && count < 256 {
        buf.put_u8(short);
        buf.put_u8((body.len() + 1) as u8);
        buf.put_u8(count as u8);
    } else {
        let size = u32::try_from(body.len() + 4).map_err(|_| CodecError::TooLarge("compound"))?;
        let count = u32::try_from(count).map_err(|_| CodecError::TooLarge("compound count"))?;
        buf.put_u8(wide);
        buf.put_u32(size);
        buf.put_u32(count);
    }
    buf.put_slice(body);
    Ok(())
}

// Arrays share one element constructor, so only the wide fixed forms are used.
fn array_constructor(v: &Value) -> Result<u8> {
    Ok(match v {
        Value::Null => code::NULL,
        Value::Bool(_) => code::BOOLEAN,
        Value::Ubyte(_) => code::UBYTE,
        Value::Ushort(_) => code::USHORT,
        Value::Uint(_) => code::UINT,
        Value::Ulong(_) => code::ULONG,
        Value::Int(_) => code::INT,
        Value::Long(_) => code::LONG,
        Value::Binary(_) => code::VBIN32,
        Value::String(_) => code::STR32,
        Value::Symbol(_) => code::SYM32,
        other => {
            return Err(CodecError::InvalidField {
                field: "array",
                reason: format!("unsupported element type {}", other.type_name()),
            })
        }
    })
}

fn encode_array(items: &[Value], buf: &mut BytesMut) -> Result<()> {
    let ctor = match items.first() {
        Some(first) => array_constructor(first)?,
        None => code::NULL,
    };
    let mut body = BytesMut::new();
    body.put_u8(ctor);
    for item in items {
        if array_constructor(item)? != ctor {
            return Err(CodecError::InvalidField {
                field: "array",
                reason: "mixed element types".into(),
            });
        }
        match item {
            Value::Null => {}
            Value::Bool(b) => body.put_u8(*b as u8),
            Value::Ubyte(n) => body.put_u8(*n),
            Value::Ushort(n) => body.put_u16(*n),
            Value::Uint(n) => body.put_u32(*n),
            Value::Ulong(n) => body.put_u64(*n),
            Value::Int(n) => body.put_i32(*n),
            Value::Long(n) => body.put_i64(*n),
            Value::Binary(b) => {
                body.put_u32(b.len() as u32);
                body.put_slice(b);
            }
            Value::String(s) | Value::Symbol(s) => {
                body.put_u32(s.len() as u32);
                body.put_slice(s.as_bytes());
            }
            _ => unreachable!("array_constructor rejects other types"),
        }
    }
    put_compound(buf, code::ARRAY8, code::ARRAY32, items.len(), &body)
}

//! Performatives exchanged while a connection is being established.
//!
//! Each performative is a described list. Decoding is lenient about trailing
//! fields (absent means default) and strict about the types of the fields it
//! interprets.

use std::collections::BTreeMap;

use bytes::BytesMut;

use super::types::{decode_value, encode_value, Value};
use crate::error::CodecError;
use crate::protocol::descriptor;

type Result<T> = std::result::Result<T, CodecError>;

/// SASL outcome codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SaslCode {
    Ok = 0,
    Auth = 1,
    Sys = 2,
    SysPerm = 3,
    SysTemp = 4,
}

impl SaslCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => SaslCode::Ok,
            1 => SaslCode::Auth,
            2 => SaslCode::Sys,
            3 => SaslCode::SysPerm,
            4 => SaslCode::SysTemp,
            _ => return None,
        })
    }
}

/// AMQP error carried by CLOSE.
#[derive(Debug, Clone, PartialEq)]
pub struct AmqpError {
    pub condition: String,
    pub description: Option<String>,
}

impl AmqpError {
    pub fn new(condition: impl Into<String>, description: impl Into<String>) -> Self {
        AmqpError {
            condition: condition.into(),
            description: Some(description.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    /// Absent on the wire means no limit.
    pub max_frame_size: u32,
    pub channel_max: u16,
    pub idle_timeout: Option<u32>,
    pub offered_capabilities: Vec<String>,
    pub desired_capabilities: Vec<String>,
    pub properties: BTreeMap<String, Value>,
}

impl Open {
    pub fn new(container_id: impl Into<String>) -> Self {
        Open {
            container_id: container_id.into(),
            hostname: None,
            max_frame_size: u32::MAX,
            channel_max: u16::MAX,
            idle_timeout: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Close {
    pub error: Option<AmqpError>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaslMechanisms {
    pub mechanisms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslInit {
    pub mechanism: String,
    pub initial_response: Vec<u8>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaslChallenge {
    pub challenge: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaslResponse {
    pub response: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaslOutcome {
    pub code: SaslCode,
    pub additional_data: Option<Vec<u8>>,
}

/// A decoded frame body.
#[derive(Debug, Clone, PartialEq)]
pub enum Performative {
    Open(Open),
    Close(Close),
    SaslMechanisms(SaslMechanisms),
    SaslInit(SaslInit),
    SaslChallenge(SaslChallenge),
    SaslResponse(SaslResponse),
    SaslOutcome(SaslOutcome),
    /// Anything else, passed through opaque.
    Unknown { descriptor: u64, fields: Vec<Value> },
}

impl Performative {
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Close(_) => "close",
            Performative::SaslMechanisms(_) => "sasl-mechanisms",
            Performative::SaslInit(_) => "sasl-init",
            Performative::SaslChallenge(_) => "sasl-challenge",
            Performative::SaslResponse(_) => "sasl-response",
            Performative::SaslOutcome(_) => "sasl-outcome",
            Performative::Unknown { .. } => "unknown",
        }
    }

    /// Decode a frame body. Bytes after the performative (a message
    /// payload, for transfers) are ignored.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let (code, fields) = match decode_value(&mut buf)? {
            Value::Described(d, v) => (descriptor_code(&d)?, list_fields(*v)?),
            other => {
                return Err(CodecError::InvalidField {
                    field: "performative",
                    reason: format!("expected described type, got {}", other.type_name()),
                })
            }
        };
        let mut f = Fields::new(fields);
        Ok(match code {
            descriptor::OPEN => {
                let container_id = f.required_str("container-id")?;
                let hostname = f.opt_str("hostname")?;
                let max_frame_size = f.opt_uint("max-frame-size")?.unwrap_or(u32::MAX);
                let channel_max = f.opt_ushort("channel-max")?.unwrap_or(u16::MAX);
                let idle_timeout = f.opt_uint("idle-time-out")?;
                f.skip(2); // outgoing-locales, incoming-locales
                Performative::Open(Open {
                    container_id,
                    hostname,
                    max_frame_size,
                    channel_max,
                    idle_timeout,
                    offered_capabilities: f.symbols("offered-capabilities")?,
                    desired_capabilities: f.symbols("desired-capabilities")?,
                    properties: f.properties("properties")?,
                })
            }
            descriptor::CLOSE => Performative::Close(Close {
                error: f.error("error")?,
            }),
            descriptor::SASL_MECHANISMS => Performative::SaslMechanisms(SaslMechanisms {
                mechanisms: f.symbols("sasl-server-mechanisms")?,
            }),
            descriptor::SASL_INIT => Performative::SaslInit(SaslInit {
                mechanism: f.required_str("mechanism")?,
                initial_response: f.binary("initial-response")?,
                hostname: f.opt_str("hostname")?,
            }),
            descriptor::SASL_CHALLENGE => Performative::SaslChallenge(SaslChallenge {
                challenge: f.binary("challenge")?,
            }),
            descriptor::SASL_RESPONSE => Performative::SaslResponse(SaslResponse {
                response: f.binary("response")?,
            }),
            descriptor::SASL_OUTCOME => {
                let raw = f.opt_ubyte("code")?.ok_or(CodecError::InvalidField {
                    field: "code",
                    reason: "mandatory field missing".into(),
                })?;
                let code = SaslCode::from_u8(raw).ok_or_else(|| CodecError::InvalidField {
                    field: "code",
                    reason: format!("unknown sasl code {}", raw),
                })?;
                let data = f.binary("additional-data")?;
                Performative::SaslOutcome(SaslOutcome {
                    code,
                    additional_data: if data.is_empty() { None } else { Some(data) },
                })
            }
            other => Performative::Unknown {
                descriptor: other,
                fields: f.into_rest(),
            },
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let (code, fields) = match self {
            Performative::Open(o) => (
                descriptor::OPEN,
                vec![
                    Value::string(o.container_id.clone()),
                    opt_string(&o.hostname),
                    Value::Uint(o.max_frame_size),
                    Value::Ushort(o.channel_max),
                    o.idle_timeout.map(Value::Uint).unwrap_or(Value::Null),
                    Value::Null,
                    Value::Null,
                    symbol_array(&o.offered_capabilities),
                    symbol_array(&o.desired_capabilities),
                    if o.properties.is_empty() {
                        Value::Null
                    } else {
                        Value::Map(
                            o.properties
                                .iter()
                                .map(|(k, v)| (Value::symbol(k.clone()), v.clone()))
                                .collect(),
                        )
                    },
                ],
            ),
            Performative::Close(c) => (
                descriptor::CLOSE,
                vec![match &c.error {
                    Some(e) => Value::Described(
                        Box::new(Value::Ulong(descriptor::ERROR)),
                        Box::new(Value::List(trim(vec![
                            Value::symbol(e.condition.clone()),
                            opt_string(&e.description),
                        ]))),
                    ),
                    None => Value::Null,
                }],
            ),
            Performative::SaslMechanisms(m) => (
                descriptor::SASL_MECHANISMS,
                vec![Value::Array(
                    m.mechanisms.iter().cloned().map(Value::Symbol).collect(),
                )],
            ),
            Performative::SaslInit(i) => (
                descriptor::SASL_INIT,
                vec![
                    Value::symbol(i.mechanism.clone()),
                    Value::Binary(i.initial_response.clone()),
                    opt_string(&i.hostname),
                ],
            ),
            Performative::SaslChallenge(c) => (
                descriptor::SASL_CHALLENGE,
                vec![Value::Binary(c.challenge.clone())],
            ),
            Performative::SaslResponse(r) => (
                descriptor::SASL_RESPONSE,
                vec![Value::Binary(r.response.clone())],
            ),
            Performative::SaslOutcome(o) => (
                descriptor::SASL_OUTCOME,
                vec![
                    Value::Ubyte(o.code as u8),
                    o.additional_data
                        .clone()
                        .map(Value::Binary)
                        .unwrap_or(Value::Null),
                ],
            ),
            Performative::Unknown { descriptor, fields } => (*descriptor, fields.clone()),
        };
        encode_value(
            &Value::Described(
                Box::new(Value::Ulong(code)),
                Box::new(Value::List(trim(fields))),
            ),
            buf,
        )
    }
}

fn opt_string(s: &Option<String>) -> Value {
    s.clone().map(Value::String).unwrap_or(Value::Null)
}

fn symbol_array(items: &[String]) -> Value {
    if items.is_empty() {
        Value::Null
    } else {
        Value::Array(items.iter().cloned().map(Value::Symbol).collect())
    }
}

// Trailing nulls are implied by a shorter list.
fn trim(mut fields: Vec<Value>) -> Vec<Value> {
    while fields.last().map_or(false, Value::is_null) {
        fields.pop();
    }
    fields
}

fn descriptor_code(d: &Value) -> Result<u64> {
    if let Some(code) = d.as_u64() {
        return Ok(code);
    }
    let name = match d {
        Value::Symbol(s) => s.as_str(),
        other => {
            return Err(CodecError::InvalidField {
                field: "descriptor",
                reason: format!("unexpected {}", other.type_name()),
            })
        }
    };
    Ok(match name {
        "amqp:open:list" => descriptor::OPEN,
        "amqp:begin:list" => descriptor::BEGIN,
        "amqp:close:list" => descriptor::CLOSE,
        "amqp:error:list" => descriptor::ERROR,
        "amqp:sasl-mechanisms:list" => descriptor::SASL_MECHANISMS,
        "amqp:sasl-init:list" => descriptor::SASL_INIT,
        "amqp:sasl-challenge:list" => descriptor::SASL_CHALLENGE,
        "amqp:sasl-response:list" => descriptor::SASL_RESPONSE,
        "amqp:sasl-outcome:list" => descriptor::SASL_OUTCOME,
        other => {
            return Err(CodecError::InvalidField {
                field: "descriptor",
                reason: format!("unknown symbolic descriptor {}", other),
            })
        }
    })
}

fn list_fields(v: Value) -> Result<Vec<Value>> {
    match v {
        Value::List(items) => Ok(items),
        other => Err(CodecError::InvalidField {
            field: "performative",
            reason: format!("expected list body, got {}", other.type_name()),
        }),
    }
}

// Positional field reader over a performative's list.
struct Fields {
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(items: Vec<Value>) -> Self {
        Fields {
            items: items.into_iter(),
        }
    }

    fn next(&mut self) -> Value {
        self.items.next().unwrap_or(Value::Null)
    }

    fn skip(&mut self, n: usize) {
        for _ in 0..n {
            self.next();
        }
    }

    fn into_rest(self) -> Vec<Value> {
        self.items.collect()
    }

    fn invalid(field: &'static str, got: &Value) -> CodecError {
        CodecError::InvalidField {
            field,
            reason: format!("unexpected {}", got.type_name()),
        }
    }

    fn opt_str(&mut self, field: &'static str) -> Result<Option<String>> {
        match self.next() {
            Value::Null => Ok(None),
            Value::String(s) | Value::Symbol(s) => Ok(Some(s)),
            other => Err(Self::invalid(field, &other)),
        }
    }

    fn required_str(&mut self, field: &'static str) -> Result<String> {
        self.opt_str(field)?.ok_or(CodecError::InvalidField {
            field,
            reason: "mandatory field missing".into(),
        })
    }

    fn opt_uint(&mut self, field: &'static str) -> Result<Option<u32>> {
        match self.next() {
            Value::Null => Ok(None),
            Value::Uint(n) => Ok(Some(n)),
            other => Err(Self::invalid(field, &other)),
        }
    }

    fn opt_ushort(&mut self, field: &'static str) -> Result<Option<u16>> {
        match self.next() {
            Value::Null => Ok(None),
            Value::Ushort(n) => Ok(Some(n)),
            other => Err(Self::invalid(field, &other)),
        }
    }

    fn opt_ubyte(&mut self, field: &'static str) -> Result<Option<u8>> {
        match self.next() {
            Value::Null => Ok(None),
            Value::Ubyte(n) => Ok(Some(n)),
            other => Err(Self::invalid(field, &other)),
        }
    }

    fn binary(&mut self, field: &'static str) -> Result<Vec<u8>> {
        match self.next() {
            Value::Null => Ok(Vec::new()),
            Value::Binary(b) => Ok(b),
            other => Err(Self::invalid(field, &other)),
        }
    }

    // A "multiple" symbol field: null, one symbol, or an array of symbols.
    fn symbols(&mut self, field: &'static str) -> Result<Vec<String>> {
        match self.next() {
            Value::Null => Ok(Vec::new()),
            Value::Symbol(s) => Ok(vec![s]),
            Value::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::Symbol(s) => Ok(s),
                    other => Err(Self::invalid(field, &other)),
                })
                .collect(),
            other => Err(Self::invalid(field, &other)),
        }
    }

    fn properties(&mut self, field: &'static str) -> Result<BTreeMap<String, Value>> {
        match self.next() {
            Value::Null => Ok(BTreeMap::new()),
            Value::Map(pairs) => pairs
                .into_iter()
                .map(|(k, v)| match k {
                    Value::Symbol(s) | Value::String(s) => Ok((s, v)),
                    other => Err(Self::invalid(field, &other)),
                })
                .collect(),
            other => Err(Self::invalid(field, &other)),
        }
    }

    fn error(&mut self, field: &'static str) -> Result<Option<AmqpError>> {
        match self.next() {
            Value::Null => Ok(None),
            Value::Described(_, body) => {
                let mut f = Fields::new(list_fields(*body)?);
                Ok(Some(AmqpError {
                    condition: f.required_str("condition")?,
                    description: f.opt_str("description")?,
                }))
            }
            other => Err(Self::invalid(field, &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(p: &Performative) -> Performative {
        let mut buf = BytesMut::new();
        p.encode(&mut buf).unwrap();
        Performative::decode(&buf).unwrap()
    }

    #[test]
    fn test_open_absent_fields_take_defaults() {
        // described(0x10, list[ "c1" ])
        let bytes = [0x00, 0x53, 0x10, 0xc0, 0x05, 0x01, 0xa1, 0x02, b'c', b'1'];
        match Performative::decode(&bytes).unwrap() {
            Performative::Open(o) => {
                assert_eq!(o.container_id, "c1");
                assert_eq!(o.max_frame_size, u32::MAX);
                assert_eq!(o.channel_max, u16::MAX);
                assert!(o.desired_capabilities.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_open_with_capabilities_and_properties() {
        let mut open = Open::new("server");
        open.max_frame_size = 4096;
        open.channel_max = 1;
        open.desired_capabilities = vec!["ADDRESS-AUTHZ".into()];
        open.properties
            .insert("product".into(), Value::string("amqpd"));
        assert_eq!(round_trip(&Performative::Open(open.clone())), Performative::Open(open));
    }

    #[test]
    fn test_single_symbol_capability_accepted() {
        // open("c", null, null, null, null, null, null, null, :ADDRESS-AUTHZ)
        let mut body = BytesMut::new();
        let mut fields = vec![Value::string("c")];
        fields.extend(std::iter::repeat(Value::Null).take(7));
        fields.push(Value::symbol("ADDRESS-AUTHZ"));
        encode_value(
            &Value::Described(Box::new(Value::Ulong(0x10)), Box::new(Value::List(fields))),
            &mut body,
        )
        .unwrap();
        match Performative::decode(&body).unwrap() {
            Performative::Open(o) => assert_eq!(o.desired_capabilities, vec!["ADDRESS-AUTHZ"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_close_error_round_trip() {
        let close = Performative::Close(Close {
            error: Some(AmqpError::new("amqp:connection:forced", "SASL is required first")),
        });
        assert_eq!(round_trip(&close), close);
        let empty = Performative::Close(Close::default());
        assert_eq!(round_trip(&empty), empty);
    }

    #[test]
    fn test_symbolic_descriptor() {
        let mut buf = BytesMut::new();
        encode_value(
            &Value::Described(
                Box::new(Value::symbol("amqp:sasl-init:list")),
                Box::new(Value::List(vec![
                    Value::symbol("ANONYMOUS"),
                    Value::Binary(b"guest".to_vec()),
                ])),
            ),
            &mut buf,
        )
        .unwrap();
        match Performative::decode(&buf).unwrap() {
            Performative::SaslInit(i) => {
                assert_eq!(i.mechanism, "ANONYMOUS");
                assert_eq!(i.initial_response, b"guest");
                assert_eq!(i.hostname, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_performative_passes_through() {
        let begin = Performative::Unknown {
            descriptor: descriptor::BEGIN,
            fields: vec![Value::Null, Value::Uint(0), Value::Uint(100), Value::Uint(100)],
        };
        // leading null survives, only trailing nulls are trimmed
        assert_eq!(round_trip(&begin), begin);
    }

    #[test]
    fn test_outcome_rejects_unknown_code() {
        let mut buf = BytesMut::new();
        encode_value(
            &Value::Described(
                Box::new(Value::Ulong(descriptor::SASL_OUTCOME)),
                Box::new(Value::List(vec![Value::Ubyte(9)])),
            ),
            &mut buf,
        )
        .unwrap();
        assert!(Performative::decode(&buf).is_err());
    }

    #[test]
    fn test_open_wrong_field_type_rejected() {
        let mut buf = BytesMut::new();
        encode_value(
            &Value::Described(
                Box::new(Value::Ulong(descriptor::OPEN)),
                Box::new(Value::List(vec![Value::string("c"), Value::Null, Value::Long(1)])),
            ),
            &mut buf,
        )
        .unwrap();
        assert!(matches!(
            Performative::decode(&buf),
            Err(CodecError::InvalidField { field: "max-frame-size", .. })
        ));
    }
}

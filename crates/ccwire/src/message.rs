//! # Protocol Records
//!
//! The messages exchanged between the peer and a running chaincode, and the
//! records carried in their payloads.
//!
//! ## Invariants
//! - **Panic Safety**: decoding returns `Result` on any malformed input.
//! - **Forward Compatibility**: unknown fields are skipped; unknown message
//!   type codes decode to `MessageType::Unknown` instead of failing.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::error::WireError;
use crate::pack::Decoder;
use crate::pack::Encoder;

/// A record with a fixed field layout.
pub trait Record: Sized {
    fn encode_into(&self, enc: &mut Encoder) -> Result<()>;
    fn decode_from(dec: &mut Decoder<'_>) -> Result<Self>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc)?;
        Ok(enc.into_bytes()?)
    }

    /// Decodes a record that must span the whole buffer.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let record = Self::decode_from(&mut dec)?;
        match dec.remaining() {
            0 => Ok(record),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

/// Protocol message types. Codes are stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Undefined,
    Register,
    Registered,
    Init,
    Ready,
    Transaction,
    Completed,
    Error,
    GetState,
    PutState,
    DelState,
    InvokeChaincode,
    Response,
    GetStateByRange,
    GetQueryResult,
    QueryStateNext,
    QueryStateClose,
    Keepalive,
    GetHistoryForKey,
    GetStateMetadata,
    PutStateMetadata,
    /// A code this build does not know.
    Unknown(u32),
}

impl MessageType {
    pub fn code(self) -> u32 {
        match self {
            Self::Undefined => 0,
            Self::Register => 1,
            Self::Registered => 2,
            Self::Init => 3,
            Self::Ready => 4,
            Self::Transaction => 5,
            Self::Completed => 6,
            Self::Error => 7,
            Self::GetState => 8,
            Self::PutState => 9,
            Self::DelState => 10,
            Self::InvokeChaincode => 11,
            Self::Response => 13,
            Self::GetStateByRange => 14,
            Self::GetQueryResult => 15,
            Self::QueryStateNext => 16,
            Self::QueryStateClose => 17,
            Self::Keepalive => 18,
            Self::GetHistoryForKey => 19,
            Self::GetStateMetadata => 20,
            Self::PutStateMetadata => 21,
            Self::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Undefined,
            1 => Self::Register,
            2 => Self::Registered,
            3 => Self::Init,
            4 => Self::Ready,
            5 => Self::Transaction,
            6 => Self::Completed,
            7 => Self::Error,
            8 => Self::GetState,
            9 => Self::PutState,
            10 => Self::DelState,
            11 => Self::InvokeChaincode,
            13 => Self::Response,
            14 => Self::GetStateByRange,
            15 => Self::GetQueryResult,
            16 => Self::QueryStateNext,
            17 => Self::QueryStateClose,
            18 => Self::Keepalive,
            19 => Self::GetHistoryForKey,
            20 => Self::GetStateMetadata,
            21 => Self::PutStateMetadata,
            other => Self::Unknown(other),
        }
    }

    /// True for the two types that end a transaction.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "UNDEFINED",
            Self::Register => "REGISTER",
            Self::Registered => "REGISTERED",
            Self::Init => "INIT",
            Self::Ready => "READY",
            Self::Transaction => "TRANSACTION",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::GetState => "GET_STATE",
            Self::PutState => "PUT_STATE",
            Self::DelState => "DEL_STATE",
            Self::InvokeChaincode => "INVOKE_CHAINCODE",
            Self::Response => "RESPONSE",
            Self::GetStateByRange => "GET_STATE_BY_RANGE",
            Self::GetQueryResult => "GET_QUERY_RESULT",
            Self::QueryStateNext => "QUERY_STATE_NEXT",
            Self::QueryStateClose => "QUERY_STATE_CLOSE",
            Self::Keepalive => "KEEPALIVE",
            Self::GetHistoryForKey => "GET_HISTORY_FOR_KEY",
            Self::GetStateMetadata => "GET_STATE_METADATA",
            Self::PutStateMetadata => "PUT_STATE_METADATA",
            Self::Unknown(code) => return write!(f, "UNKNOWN({})", code),
        };
        f.write_str(name)
    }
}

/// An event emitted by a chaincode during a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeEvent {
    pub chaincode_id: String,
    pub tx_id: String,
    pub event_name: String,
    pub payload: Vec<u8>,
}

impl Record for ChaincodeEvent {
    fn encode_into(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        write_str(enc, "chaincode_id", &self.chaincode_id)?;
        write_str(enc, "tx_id", &self.tx_id)?;
        write_str(enc, "event_name", &self.event_name)?;
        write_bytes(enc, "payload", &self.payload)?;
        enc.map_end()?;
        Ok(())
    }

    fn decode_from(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut event = Self::default();
        let mut map = dec.map()?;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "chaincode_id" => event.chaincode_id = val.str()?.to_string(),
                "tx_id" => event.tx_id = val.str()?.to_string(),
                "event_name" => event.event_name = val.str()?.to_string(),
                "payload" => event.payload = val.bytes()?.to_vec(),
                _ => val.skip()?,
            }
        }
        Ok(event)
    }
}

/// The envelope exchanged over a chaincode stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeMessage {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    pub txid: String,
    pub channel_id: String,
    pub chaincode_event: Option<ChaincodeEvent>,
}

impl ChaincodeMessage {
    pub fn new(
        message_type: MessageType,
        channel_id: impl Into<String>,
        txid: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            payload,
            txid: txid.into(),
            channel_id: channel_id.into(),
            chaincode_event: None,
        }
    }

    pub fn with_event(mut self, event: ChaincodeEvent) -> Self {
        self.chaincode_event = Some(event);
        self
    }
}

impl Record for ChaincodeMessage {
    fn encode_into(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        write_u32(enc, "type", self.message_type.code())?;
        write_bytes(enc, "payload", &self.payload)?;
        write_str(enc, "txid", &self.txid)?;
        write_str(enc, "channel_id", &self.channel_id)?;
        enc.variant_begin("chaincode_event")?;
        match &self.chaincode_event {
            Some(event) => {
                enc.option_some_begin()?;
                event.encode_into(enc)?;
                enc.option_some_end()?;
            }
            None => enc.option_none()?,
        }
        enc.variant_end()?;
        enc.map_end()?;
        Ok(())
    }

    fn decode_from(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut message_type = None;
        let mut payload = Vec::new();
        let mut txid = String::new();
        let mut channel_id = String::new();
        let mut chaincode_event = None;

        let mut map = dec.map()?;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "type" => message_type = Some(MessageType::from_code(val.u32()?)),
                "payload" => payload = val.bytes()?.to_vec(),
                "txid" => txid = val.str()?.to_string(),
                "channel_id" => channel_id = val.str()?.to_string(),
                "chaincode_event" => {
                    chaincode_event = match val.option()? {
                        Some(mut inner) => Some(ChaincodeEvent::decode_from(&mut inner)?),
                        None => None,
                    }
                }
                _ => val.skip()?,
            }
        }

        Ok(Self {
            message_type: message_type.ok_or(WireError::MissingField("type"))?,
            payload,
            txid,
            channel_id,
            chaincode_event,
        })
    }
}

/// Arguments of an INIT or TRANSACTION, plus proposal decorations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeInput {
    pub args: Vec<Vec<u8>>,
    pub decorations: BTreeMap<String, Vec<u8>>,
}

impl ChaincodeInput {
    /// Builds an input from string arguments, e.g. `["transfer", "a", "b"]`.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            args: args.into_iter().map(|a| a.as_ref().to_vec()).collect(),
            decorations: BTreeMap::new(),
        }
    }
}

impl Record for ChaincodeInput {
    fn encode_into(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;

        enc.variant_begin("args")?;
        enc.list_begin()?;
        for arg in &self.args {
            enc.bytes(arg)?;
        }
        enc.list_end()?;
        enc.variant_end()?;

        enc.variant_begin("decorations")?;
        enc.map_begin()?;
        for (name, value) in &self.decorations {
            write_bytes(enc, name, value)?;
        }
        enc.map_end()?;
        enc.variant_end()?;

        enc.map_end()?;
        Ok(())
    }

    fn decode_from(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut input = Self::default();
        let mut map = dec.map()?;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "args" => {
                    let mut list = val.list()?;
                    while let Some(mut item) = list.next()? {
                        input.args.push(item.bytes()?.to_vec());
                    }
                }
                "decorations" => {
                    let mut decorations = val.map()?;
                    while let Some((name, mut value)) = decorations.next()? {
                        input.decorations.insert(name.to_string(), value.bytes()?.to_vec());
                    }
                }
                _ => val.skip()?,
            }
        }
        Ok(input)
    }
}

/// The application-level result returned by a chaincode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub status: i32,
    pub message: String,
    pub payload: Vec<u8>,
}

impl Response {
    pub const OK: i32 = 200;
    pub const ERROR_THRESHOLD: i32 = 400;
    pub const ERROR: i32 = 500;

    pub fn success(payload: impl Into<Vec<u8>>) -> Self {
        Self { status: Self::OK, message: String::new(), payload: payload.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { status: Self::ERROR, message: message.into(), payload: Vec::new() }
    }
}

impl Record for Response {
    fn encode_into(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        enc.variant_begin("status")?;
        enc.s32(self.status)?;
        enc.variant_end()?;
        write_str(enc, "message", &self.message)?;
        write_bytes(enc, "payload", &self.payload)?;
        enc.map_end()?;
        Ok(())
    }

    fn decode_from(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut status = None;
        let mut message = String::new();
        let mut payload = Vec::new();
        let mut map = dec.map()?;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "status" => status = Some(val.s32()?),
                "message" => message = val.str()?.to_string(),
                "payload" => payload = val.bytes()?.to_vec(),
                _ => val.skip()?,
            }
        }
        Ok(Self {
            status: status.ok_or(WireError::MissingField("status"))?,
            message,
            payload,
        })
    }
}

/// Identity a chaincode announces when it registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChaincodeId {
    pub name: String,
    pub version: String,
    pub path: String,
}

impl ChaincodeId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self { name: name.into(), version: version.into(), path: String::new() }
    }

    /// `name:version`, or just `name` when no version is set.
    pub fn canonical_name(&self) -> String {
        if self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.version)
        }
    }
}

impl Record for ChaincodeId {
    fn encode_into(&self, enc: &mut Encoder) -> Result<()> {
        enc.map_begin()?;
        write_str(enc, "name", &self.name)?;
        write_str(enc, "version", &self.version)?;
        write_str(enc, "path", &self.path)?;
        enc.map_end()?;
        Ok(())
    }

    fn decode_from(dec: &mut Decoder<'_>) -> Result<Self> {
        let mut name = None;
        let mut id = Self::default();
        let mut map = dec.map()?;
        while let Some((key, mut val)) = map.next()? {
            match key {
                "name" => name = Some(val.str()?.to_string()),
                "version" => id.version = val.str()?.to_string(),
                "path" => id.path = val.str()?.to_string(),
                _ => val.skip()?,
            }
        }
        id.name = name.ok_or(WireError::MissingField("name"))?;
        Ok(id)
    }
}

// Helper functions

fn write_u32(enc: &mut Encoder, key: &str, val: u32) -> Result<()> {
    enc.variant_begin(key)?;
    enc.u32(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_str(enc: &mut Encoder, key: &str, val: &str) -> Result<()> {
    enc.variant_begin(key)?;
    enc.str(val)?;
    enc.variant_end()?;
    Ok(())
}

fn write_bytes(enc: &mut Encoder, key: &str, val: &[u8]) -> Result<()> {
    enc.variant_begin(key)?;
    enc.bytes(val)?;
    enc.variant_end()?;
    Ok(())
}

pub mod error;
pub use error::Error;

use std::str::FromStr;

use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use miniscript::bitcoin::{Amount, Network, Transaction};
use serde_json::{Map, Value};

use crate::interface::{PeerInfo, Transport};

/// Lobby channel name on mainnet; other networks get a `:<network>` suffix.
pub const CHANNEL: &str = "CoinJoin";

pub const KIND_OPEN: &str = "CoinJoinOpen";
pub const KIND_JOIN: &str = "CoinJoin";
pub const KIND_FINISH: &str = "CoinJoinFinish";

const WIRE_VERSION: &str = "1";

pub fn channel_name(network: Network) -> String {
    if network == Network::Bitcoin {
        CHANNEL.into()
    } else {
        format!("{}:{}", CHANNEL, network)
    }
}

/// A message on the lobby channel.
#[derive(Debug, Clone, PartialEq)]
pub enum MixMessage {
    /// Broadcast announcement of a mix at `amount`.
    Open { id: String, amount: Amount },
    /// Unicast protocol step carrying the transaction at the current stage.
    /// `initial` marks a guest's first reply to an announcement.
    Join {
        id: String,
        tx: Transaction,
        initial: bool,
    },
    /// Unicast protocol termination by the peer.
    Finish { id: String },
}

#[derive(Debug)]
pub enum ParsingError {
    SerdeJson(serde_json::Error),
    NotAnObject,
    VersionMissing,
    VersionNotSupported(String),
    UnknownType(String),
    MissingKey(String),
    WrongValue(String),
    Consensus,
}

impl From<serde_json::Error> for ParsingError {
    fn from(value: serde_json::Error) -> Self {
        ParsingError::SerdeJson(value)
    }
}

#[derive(Debug)]
pub enum SerializeError {
    SerdeJson(serde_json::Error),
}

impl From<serde_json::Error> for SerializeError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

impl MixMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            MixMessage::Open { .. } => KIND_OPEN,
            MixMessage::Join { .. } => KIND_JOIN,
            MixMessage::Finish { .. } => KIND_FINISH,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            MixMessage::Open { id, .. }
            | MixMessage::Join { id, .. }
            | MixMessage::Finish { id } => id,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("version".into(), Value::String(WIRE_VERSION.into()));
        map.insert("type".into(), self.kind().into());
        map.insert("id".into(), Value::String(self.id().into()));
        match self {
            MixMessage::Open { amount, .. } => {
                map.insert("amount".into(), amount.to_sat().into());
            }
            MixMessage::Join { tx, initial, .. } => {
                map.insert("tx".into(), Value::String(serialize_hex(tx)));
                if *initial {
                    map.insert("initial".into(), Value::Bool(true));
                }
            }
            MixMessage::Finish { .. } => {}
        }
        map.into()
    }

    pub fn to_string(&self) -> Result<String, SerializeError> {
        Ok(serde_json::to_string(&self.to_json())?)
    }
}

impl FromStr for MixMessage {
    type Err = ParsingError;

    fn from_str(s: &str) -> Result<Self, ParsingError> {
        let json: Value = serde_json::from_str(s)?;
        let map = match json {
            Value::Object(map) => map,
            _ => return Err(ParsingError::NotAnObject),
        };
        match map.get("version") {
            Some(Value::String(v)) => {
                if v != WIRE_VERSION {
                    return Err(ParsingError::VersionNotSupported(v.into()));
                }
            }
            _ => return Err(ParsingError::VersionMissing),
        }
        let id = match map.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(_) => return Err(ParsingError::WrongValue("id".into())),
            None => return Err(ParsingError::MissingKey("id".into())),
        };
        match map.get("type") {
            Some(Value::String(t)) => match t.as_str() {
                KIND_OPEN => {
                    let amount = map
                        .get("amount")
                        .ok_or(ParsingError::MissingKey("amount".into()))?
                        .as_u64()
                        .ok_or(ParsingError::WrongValue("amount".into()))?;
                    Ok(MixMessage::Open {
                        id,
                        amount: Amount::from_sat(amount),
                    })
                }
                KIND_JOIN => {
                    let tx = match map.get("tx") {
                        Some(Value::String(hex)) => {
                            deserialize_hex(hex).map_err(|_| ParsingError::Consensus)?
                        }
                        Some(_) => return Err(ParsingError::WrongValue("tx".into())),
                        None => return Err(ParsingError::MissingKey("tx".into())),
                    };
                    let initial = map.get("initial").and_then(Value::as_bool).unwrap_or(false);
                    Ok(MixMessage::Join { id, tx, initial })
                }
                KIND_FINISH => Ok(MixMessage::Finish { id }),
                t => Err(ParsingError::UnknownType(t.into())),
            },
            _ => Err(ParsingError::MissingKey("type".into())),
        }
    }
}

/// A parsed inbound record: the wire message plus its envelope identities.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub msg: MixMessage,
    pub sender: String,
    pub peer: PeerInfo,
}

/// Adapter over the lobby transport owning the single mixing channel.
#[derive(Debug)]
pub struct Channel<T: Transport> {
    transport: T,
    name: String,
    open: bool,
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T, network: Network) -> Self {
        Channel {
            transport,
            name: channel_name(network),
            open: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn fingerprint(&self) -> String {
        self.transport.fingerprint()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Open the channel if it is not already.
    pub fn ensure_open(&mut self) -> Result<(), Error> {
        if !self.open {
            self.transport.open_channel(&self.name)?;
            self.open = true;
            log::debug!("Channel({}).ensure_open(): channel opened", self.name);
        }
        Ok(())
    }

    /// Idempotent teardown; a channel the transport no longer knows is
    /// treated as already closed.
    pub fn close(&mut self) -> Result<(), Error> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        match self.transport.close_channel(&self.name) {
            Ok(()) | Err(crate::interface::TransportError::ChannelNotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Forget the channel without a teardown frame, after the transport
    /// itself went away.
    pub fn reset(&mut self) {
        self.open = false;
    }

    /// Broadcast `msg` under the channel key.
    pub fn post_encrypted(&mut self, msg: &MixMessage) -> Result<(), Error> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        let body = msg.to_string()?;
        self.transport.post_encrypted(&self.name, body)?;
        Ok(())
    }

    /// End-to-end encrypted unicast of `msg` to `peer`.
    pub fn post_dh(&mut self, peer: &str, msg: &MixMessage) -> Result<(), Error> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        let body = msg.to_string()?;
        self.transport.post_dh(&self.name, peer, body)?;
        Ok(())
    }

    /// Poll the transport for the next well-formed message. Malformed
    /// bodies are dropped with a debug log.
    pub fn try_receive(&mut self) -> Result<Option<Incoming>, Error> {
        if !self.open {
            return Ok(None);
        }
        while let Some(delivery) = self.transport.try_receive(&self.name)? {
            match MixMessage::from_str(&delivery.body) {
                Ok(msg) => {
                    return Ok(Some(Incoming {
                        msg,
                        sender: delivery.sender,
                        peer: delivery.peer,
                    }))
                }
                Err(e) => {
                    log::debug!(
                        "Channel({}).try_receive(): drop malformed message: {:?}",
                        self.name,
                        e
                    );
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(channel_name(Network::Bitcoin), "CoinJoin");
        assert_eq!(channel_name(Network::Regtest), "CoinJoin:regtest");
    }

    #[test]
    fn open_message() {
        let raw = r#"
            {
              "version": "1",
              "type": "CoinJoinOpen",
              "id": "abc123",
              "amount": 500000
            }
        "#;
        let msg = MixMessage::from_str(raw).unwrap();
        assert_eq!(
            msg,
            MixMessage::Open {
                id: "abc123".into(),
                amount: Amount::from_sat(500_000),
            }
        );
        let roundtrip = MixMessage::from_str(&msg.to_string().unwrap()).unwrap();
        assert_eq!(msg, roundtrip);
    }

    #[test]
    fn join_initial_defaults_to_false() {
        let tx = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn::default()],
            output: Vec::new(),
        };
        let raw = format!(
            r#"{{"version":"1","type":"CoinJoin","id":"abc","tx":"{}"}}"#,
            serialize_hex(&tx)
        );
        match MixMessage::from_str(&raw).unwrap() {
            MixMessage::Join {
                tx: parsed,
                initial,
                ..
            } if parsed == tx => assert!(!initial),
            m => panic!("unexpected message: {:?}", m),
        }
    }

    #[test]
    fn version_is_required() {
        let raw = r#"{"type":"CoinJoinFinish","id":"abc"}"#;
        assert!(matches!(
            MixMessage::from_str(raw),
            Err(ParsingError::VersionMissing)
        ));
        let raw = r#"{"version":"2","type":"CoinJoinFinish","id":"abc"}"#;
        assert!(matches!(
            MixMessage::from_str(raw),
            Err(ParsingError::VersionNotSupported(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"version":"1","type":"CoinJoinAbort","id":"abc"}"#;
        assert!(matches!(
            MixMessage::from_str(raw),
            Err(ParsingError::UnknownType(_))
        ));
    }
}

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ── Opcodes ──────────────────────────────────────────────────────────────────

/// Numeric message class carried by every [`Envelope`].
///
/// Values are part of the browser contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum Opcode {
    ReceivedData = 4000,
    Reconnect = 4001,
    UnknownError = 4002,
    InvalidOrigin = 4003,
    Dispatch = 4004,
    Heartbeat = 4005,
    MalformedData = 4006,
    Unauthorized = 4007,
    Hello = 4444,
}

impl Opcode {
    pub const ALL: [Opcode; 9] = [
        Opcode::ReceivedData,
        Opcode::Reconnect,
        Opcode::UnknownError,
        Opcode::InvalidOrigin,
        Opcode::Dispatch,
        Opcode::Heartbeat,
        Opcode::MalformedData,
        Opcode::Unauthorized,
        Opcode::Hello,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }
}

impl From<Opcode> for u16 {
    fn from(op: Opcode) -> Self {
        op.code()
    }
}

impl TryFrom<u16> for Opcode {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Opcode::ALL
            .into_iter()
            .find(|op| op.code() == code)
            .ok_or(ProtocolError::UnknownOpcode(code))
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}({})", self.code())
    }
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// JSON frame pushed to socket clients: `{"topic", "opcode", "data"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub opcode: Opcode,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(opcode: Opcode, topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            opcode,
            data: serde_json::Value::Null,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_are_stable() {
        let codes: Vec<u16> = Opcode::ALL.iter().map(|op| op.code()).collect();
        assert_eq!(codes, vec![
            4000, 4001, 4002, 4003, 4004, 4005, 4006, 4007, 4444
        ]);
    }

    #[test]
    fn envelope_serializes_opcode_as_number() {
        let env = Envelope::new(Opcode::Hello, "hi");
        let json: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(json["opcode"], 4444);
        assert_eq!(json["topic"], "hi");
        assert!(json["data"].is_null());
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let env = Envelope::from_slice(br#"{"topic":"t","opcode":4004}"#).unwrap();
        assert_eq!(env.opcode, Opcode::Dispatch);
        assert!(env.data.is_null());
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let err = Envelope::from_slice(br#"{"topic":"t","opcode":1234}"#).unwrap_err();
        assert!(err.to_string().contains("1234"));
        assert!(matches!(
            Opcode::try_from(9999),
            Err(ProtocolError::UnknownOpcode(9999))
        ));
    }
}

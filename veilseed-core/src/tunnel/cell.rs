//! Cell wire format and relay messages.
//!
//! ```text
//! cell := [type u8][circuit_id u32 BE][len u16 BE][payload; len]
//! ```
//!
//! `circuit_id` is scoped to one link (a pair of adjacent nodes). Create and
//! Created payloads are raw handshake material. Extend, Extended and Data
//! payloads are onion layers whose innermost plaintext is a bincode
//! [`RelayMessage`]. Destroy carries a single reason byte.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

use crate::overlay::PeerKey;

pub const HEADER_LEN: usize = 7;

/// Largest payload a cell may carry
pub const MAX_CELL_PAYLOAD: usize = 4096;

/// Largest chunk of stream bytes carried by one data cell
pub const MAX_STREAM_CHUNK: usize = 2048;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CellError {
    #[error("Truncated cell: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unknown cell type {0:#04x}")]
    UnknownType(u8),

    #[error("Cell payload of {0} bytes exceeds the maximum")]
    PayloadTooLarge(usize),

    #[error("{0} trailing bytes after cell")]
    TrailingBytes(usize),

    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: CellType, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellType {
    Create = 1,
    Created = 2,
    Extend = 3,
    Extended = 4,
    Data = 5,
    Destroy = 6,
}

impl CellType {
    pub fn from_byte(byte: u8) -> Result<Self, CellError> {
        match byte {
            1 => Ok(CellType::Create),
            2 => Ok(CellType::Created),
            3 => Ok(CellType::Extend),
            4 => Ok(CellType::Extended),
            5 => Ok(CellType::Data),
            6 => Ok(CellType::Destroy),
            other => Err(CellError::UnknownType(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellType::Create => "create",
            CellType::Created => "created",
            CellType::Extend => "extend",
            CellType::Extended => "extended",
            CellType::Data => "data",
            CellType::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub cell_type: CellType,
    pub circuit_id: u32,
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(cell_type: CellType, circuit_id: u32, payload: Vec<u8>) -> Self {
        Self {
            cell_type,
            circuit_id,
            payload,
        }
    }

    pub fn destroy(circuit_id: u32, reason: DestroyReason) -> Self {
        Self::new(CellType::Destroy, circuit_id, vec![reason as u8])
    }

    pub fn encode(&self) -> Result<Vec<u8>, CellError> {
        if self.payload.len() > MAX_CELL_PAYLOAD {
            return Err(CellError::PayloadTooLarge(self.payload.len()));
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.push(self.cell_type.as_byte());
        bytes.extend_from_slice(&self.circuit_id.to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Parse one cell. The buffer must hold exactly one cell.
    pub fn decode(bytes: &[u8]) -> Result<Self, CellError> {
        if bytes.len() < HEADER_LEN {
            return Err(CellError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }

        let cell_type = CellType::from_byte(bytes[0])?;
        let circuit_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let len = u16::from_be_bytes([bytes[5], bytes[6]]) as usize;

        if len > MAX_CELL_PAYLOAD {
            return Err(CellError::PayloadTooLarge(len));
        }

        let body = &bytes[HEADER_LEN..];
        if body.len() < len {
            return Err(CellError::Truncated {
                expected: HEADER_LEN + len,
                actual: bytes.len(),
            });
        }
        if body.len() > len {
            return Err(CellError::TrailingBytes(body.len() - len));
        }

        Ok(Self::new(cell_type, circuit_id, body.to_vec()))
    }
}

/// Why a circuit is being destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DestroyReason {
    Requested = 0,
    Protocol = 1,
    Timeout = 2,
    Idle = 3,
}

impl DestroyReason {
    pub fn from_payload(payload: &[u8]) -> Self {
        match payload.first() {
            Some(1) => DestroyReason::Protocol,
            Some(2) => DestroyReason::Timeout,
            Some(3) => DestroyReason::Idle,
            _ => DestroyReason::Requested,
        }
    }
}

/// Relay payload of a `Created` cell, also carried inside `Extended`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedPayload {
    pub relay_ephemeral: [u8; 32],
    pub auth: [u8; 32],
}

impl CreatedPayload {
    pub const LEN: usize = 64;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::LEN);
        bytes.extend_from_slice(&self.relay_ephemeral);
        bytes.extend_from_slice(&self.auth);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CellError> {
        if bytes.len() != Self::LEN {
            return Err(CellError::Malformed {
                kind: CellType::Created,
                reason: format!("expected {} bytes, got {}", Self::LEN, bytes.len()),
            });
        }
        let mut relay_ephemeral = [0u8; 32];
        let mut auth = [0u8; 32];
        relay_ephemeral.copy_from_slice(&bytes[..32]);
        auth.copy_from_slice(&bytes[32..]);
        Ok(Self {
            relay_ephemeral,
            auth,
        })
    }
}

/// Parse the client ephemeral key of a `Create` cell
pub fn create_payload(cell: &Cell) -> Result<[u8; 32], CellError> {
    cell.payload
        .as_slice()
        .try_into()
        .map_err(|_| CellError::Malformed {
            kind: CellType::Create,
            reason: format!("expected 32 bytes, got {}", cell.payload.len()),
        })
}

/// End-to-end message carried inside onion layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayMessage {
    /// Ask the receiving hop to add `next_addr` as hop `hop_index`
    Extend {
        hop_index: u8,
        next_addr: SocketAddr,
        next_key: PeerKey,
        client_ephemeral: [u8; 32],
    },
    /// New hop `hop_index` answered the handshake
    Extended {
        hop_index: u8,
        relay_ephemeral: [u8; 32],
        auth: [u8; 32],
    },
    Open {
        stream_id: u32,
        host: String,
        port: u16,
    },
    Opened {
        stream_id: u32,
    },
    Data {
        stream_id: u32,
        bytes: Vec<u8>,
    },
    End {
        stream_id: u32,
    },
}

impl RelayMessage {
    fn codec() -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(MAX_CELL_PAYLOAD as u64)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CellError> {
        Self::codec().serialize(self).map_err(|e| CellError::Malformed {
            kind: CellType::Data,
            reason: e.to_string(),
        })
    }

    pub fn decode(kind: CellType, bytes: &[u8]) -> Result<Self, CellError> {
        Self::codec()
            .deserialize(bytes)
            .map_err(|e| CellError::Malformed {
                kind,
                reason: e.to_string(),
            })
    }
}

// Copyright 2026 Joyent, Inc.

//! Error taxonomy and remote-fault reconstruction.
//!
//! Remote failures arrive as a wire record of {code, message, properties}.
//! A [`FaultRegistry`] maps (operation identity, code) to a constructor so
//! the caller gets back a typed error without sharing the callee's error
//! classes.  A missing constructor is itself an error, never a silent null.

use std::collections::{BTreeMap, HashMap};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::protocol::Message;

/// Wire-level failure record carried by FAIL and error RESPONSE messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: u32,
    pub message: String,
    pub properties: BTreeMap<String, String>,
}

impl Fault {
    /// Build from a FAIL record; free-form detail rides in the properties
    /// field.
    pub fn from_fail(msg: &Message) -> Fault {
        Fault {
            code: msg.error_code(),
            message: msg.error_message(),
            properties: msg.properties(),
        }
    }

    /// Build from an error RESPONSE record; RESPONSE has no properties
    /// field, so its extensions stand in as the free-form detail.
    pub fn from_response(msg: &Message) -> Fault {
        Fault {
            code: msg.error_code(),
            message: msg.error_message(),
            properties: msg.extensions(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

impl StdError for Fault {}

/// Every way a call can go wrong, seen from the caller.
#[derive(Debug)]
pub enum RpcError {
    /// The underlying socket or HTTP exchange failed.
    Transport(io::Error),
    /// The connection went away before the call reached a terminal outcome.
    ConnectionClosed,
    /// The caller-supplied deadline elapsed; the session has been torn down.
    Timeout,
    /// The peer violated the protocol in a way that could not be dropped.
    Protocol(String),
    /// Entity bytes could not be (de)serialized.
    Payload(String),
    /// A remote failure reconstructed into its registered type.
    Remote(Box<dyn StdError + Send + Sync>),
    /// A remote failure with no registered constructor.
    UnmappedFault { operation: String, fault: Fault },
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Transport(e) => write!(f, "transport error: {}", e),
            RpcError::ConnectionClosed => {
                write!(f, "connection closed before the call completed")
            }
            RpcError::Timeout => write!(f, "timed out waiting for a response"),
            RpcError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            RpcError::Payload(msg) => write!(f, "payload codec error: {}", msg),
            RpcError::Remote(e) => write!(f, "remote failure: {}", e),
            RpcError::UnmappedFault { operation, fault } => {
                write!(f, "unmapped remote fault for {}: {}", operation, fault)
            }
        }
    }
}

impl StdError for RpcError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RpcError::Transport(e) => Some(e),
            RpcError::Remote(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> RpcError {
        RpcError::Transport(e)
    }
}

type FaultCtor = Arc<dyn Fn(Fault) -> Box<dyn StdError + Send + Sync> + Send + Sync>;

/// Explicit constructor registry for remote-declared failures, populated at
/// startup and shared by every caller on the process.
#[derive(Default, Clone)]
pub struct FaultRegistry {
    ctors: HashMap<(String, u32), FaultCtor>,
}

impl FaultRegistry {
    pub fn new() -> FaultRegistry {
        FaultRegistry::default()
    }

    /// Register the constructor invoked when `operation` fails with `code`.
    pub fn register<F>(&mut self, operation: &str, code: u32, ctor: F)
    where
        F: Fn(Fault) -> Box<dyn StdError + Send + Sync> + Send + Sync + 'static,
    {
        self.ctors
            .insert((operation.to_string(), code), Arc::new(ctor));
    }

    /// Turn a wire fault back into a typed error.  An unregistered
    /// (operation, code) pair yields [`RpcError::UnmappedFault`].
    pub fn reconstruct(&self, operation: &str, fault: Fault) -> RpcError {
        match self.ctors.get(&(operation.to_string(), fault.code)) {
            Some(ctor) => RpcError::Remote(ctor(fault)),
            None => RpcError::UnmappedFault {
                operation: operation.to_string(),
                fault,
            },
        }
    }
}

impl fmt::Debug for FaultRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultRegistry")
            .field("registered", &self.ctors.len())
            .finish()
    }
}

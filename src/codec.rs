// src/codec.rs

//! Encoding of run-specs, results and exceptions.
//!
//! The scheduler and worker state machines treat these payloads as opaque
//! [`Bytes`]; only task runners and clients decode them.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

pub trait Codec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// `serde_json` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Run-spec understood by [`crate::worker::ShellRunner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    pub cmd: String,
}

/// Exception payload produced by a failing shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellFailure {
    pub exit_code: Option<i32>,
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_decodes_what_it_encodes() {
        let codec = JsonCodec;
        let spec = ShellCommand {
            cmd: "echo hi".into(),
        };
        let bytes = codec.encode(&spec).unwrap();
        assert_eq!(&bytes[..], br#"{"cmd":"echo hi"}"#);
        let back: ShellCommand = codec.decode(&bytes).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn json_codec_reports_garbage() {
        let err = JsonCodec.decode::<ShellCommand>(b"not json").unwrap_err();
        assert!(err.to_string().contains("Codec error"));
    }
}

//! Device response parsing.
//!
//! Every response body starts with a 2-character response code (the command
//! code with its second letter advanced, `DC` → `DD`) followed by a
//! 2-character error code. `00` means success.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::error::BrokerError;

/// Errors surfaced by the HSM command layer.
#[derive(Error, Debug)]
pub enum HsmError {
    /// The request never produced a device response.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The device answered with something other than the expected response.
    #[error("response is not valid: {0}")]
    InvalidResponse(String),

    /// The device rejected the command.
    #[error("hsm error: {0}")]
    Device(ErrorCode),

    /// The command could not be built from the given input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HsmError {
    /// Check if the device reported a PIN verification failure.
    #[must_use]
    pub fn is_pin_verification_failure(&self) -> bool {
        matches!(self, Self::Device(ErrorCode::PinVerificationFailure))
    }
}

/// Device error codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// `01`
    PinVerificationFailure,
    /// `10`
    TpkParity,
    /// `11`
    PvkParity,
    /// `27`
    PvkNotDoubleLength,
    /// `68`
    CommandDisabled,
    /// `69`
    PinBlockFormatDisabled,
    /// Any code without a dedicated variant, kept verbatim.
    Other(String),
}

impl ErrorCode {
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "01" => Self::PinVerificationFailure,
            "10" => Self::TpkParity,
            "11" => Self::PvkParity,
            "27" => Self::PvkNotDoubleLength,
            "68" => Self::CommandDisabled,
            "69" => Self::PinBlockFormatDisabled,
            other => Self::Other(other.to_string()),
        }
    }

    /// The 2-character wire code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::PinVerificationFailure => "01",
            Self::TpkParity => "10",
            Self::PvkParity => "11",
            Self::PvkNotDoubleLength => "27",
            Self::CommandDisabled => "68",
            Self::PinBlockFormatDisabled => "69",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PinVerificationFailure => "pin verification failure",
            Self::TpkParity => "tpk parity error",
            Self::PvkParity => "pvk parity error",
            Self::PvkNotDoubleLength => "pvk not double length",
            Self::CommandDisabled => "command disabled",
            Self::PinBlockFormatDisabled => "pin block format has been disabled",
            Self::Other(_) => "unrecognised error code",
        };
        write!(f, "{text} ({})", self.code())
    }
}

/// A successful device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsmResponse {
    pub response_code: String,
    /// Everything after the error code.
    pub body: Bytes,
}

impl HsmResponse {
    /// Parse a response body, as returned by `Broker::send`.
    ///
    /// # Errors
    ///
    /// Returns [`HsmError::InvalidResponse`] if the response is truncated or
    /// carries a response code other than `expected_code`, and
    /// [`HsmError::Device`] if the device reported an error.
    pub fn parse(raw: Bytes, expected_code: &str) -> Result<Self, HsmError> {
        if raw.len() < 4 {
            return Err(HsmError::InvalidResponse(format!(
                "{} bytes is too short for a response header",
                raw.len()
            )));
        }

        let response_code = ascii_field(&raw[..2])?;
        if response_code != expected_code {
            return Err(HsmError::InvalidResponse(format!(
                "expected response code {expected_code}, got {response_code}"
            )));
        }

        let error_code = ascii_field(&raw[2..4])?;
        if error_code != "00" {
            return Err(HsmError::Device(ErrorCode::from_code(error_code)));
        }

        Ok(Self {
            response_code: response_code.to_string(),
            body: raw.slice(4..),
        })
    }
}

fn ascii_field(bytes: &[u8]) -> Result<&str, HsmError> {
    std::str::from_utf8(bytes)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_alphanumeric()))
        .ok_or_else(|| HsmError::InvalidResponse(format!("non-alphanumeric header field {bytes:02x?}")))
}

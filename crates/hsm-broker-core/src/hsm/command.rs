//! PIN commands issued through the broker.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::broker::Broker;
use crate::pool::PoolItem;

use super::response::{HsmError, HsmResponse};

/// Verify a PIN against its PVV (IBM 3624 / Visa PVV method).
const VERIFY_PIN: &str = "DC";
const VERIFY_PIN_RESPONSE: &str = "DD";

/// Report LMK check value and firmware revision.
const DIAGNOSTICS: &str = "NC";
const DIAGNOSTICS_RESPONSE: &str = "ND";

/// PIN block format 01 (ISO 9564 format 0).
const PIN_BLOCK_FORMAT: &str = "01";

/// PVK index used for every verification.
const PVKI: &str = "1";

const MIN_PAN_LEN: usize = 13;
const PVV_LEN: usize = 4;
const PIN_BLOCK_LEN: usize = 16;
const ACCOUNT_NUMBER_LEN: usize = 12;

/// Keys, as stored under the LMK, including any key scheme tag.
#[derive(Clone)]
pub struct PinKeys {
    pub tpk: String,
    pub pvk: String,
}

impl PinKeys {
    pub fn new(tpk: impl Into<String>, pvk: impl Into<String>) -> Self {
        Self {
            tpk: tpk.into(),
            pvk: pvk.into(),
        }
    }
}

impl fmt::Debug for PinKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinKeys").finish_non_exhaustive()
    }
}

/// A PIN verification request.
///
/// Only built through [`new`](Self::new), so every instance holds
/// well-formed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinVerification {
    pan: String,
    /// Encrypted PIN block under the TPK, hex encoded.
    pin_block: String,
    pvv: String,
}

impl PinVerification {
    /// Create a validated request.
    ///
    /// # Errors
    ///
    /// Returns [`HsmError::InvalidRequest`] if the PAN has fewer than 13
    /// digits, the PVV is not 4 digits, or the PIN block is not 16 hex
    /// characters.
    pub fn new(
        pan: impl Into<String>,
        pin_block: impl Into<String>,
        pvv: impl Into<String>,
    ) -> Result<Self, HsmError> {
        let request = Self {
            pan: pan.into(),
            pin_block: pin_block.into(),
            pvv: pvv.into(),
        };
        request.validate()?;
        Ok(request)
    }

    /// Check field formats.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn validate(&self) -> Result<(), HsmError> {
        if self.pan.len() < MIN_PAN_LEN || !all_digits(&self.pan) {
            return Err(HsmError::InvalidRequest(format!(
                "PAN must be at least {MIN_PAN_LEN} digits"
            )));
        }
        if self.pvv.len() != PVV_LEN || !all_digits(&self.pvv) {
            return Err(HsmError::InvalidRequest(format!(
                "PVV must be {PVV_LEN} digits"
            )));
        }
        if self.pin_block.len() != PIN_BLOCK_LEN
            || !self.pin_block.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(HsmError::InvalidRequest(format!(
                "PIN block must be {PIN_BLOCK_LEN} hex characters"
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn pan(&self) -> &str {
        &self.pan
    }

    #[must_use]
    pub fn pin_block(&self) -> &str {
        &self.pin_block
    }

    #[must_use]
    pub fn pvv(&self) -> &str {
        &self.pvv
    }

    /// The 12 rightmost PAN digits, excluding the check digit.
    #[must_use]
    pub fn account_number(&self) -> &str {
        let end = self.pan.len() - 1;
        &self.pan[end - ACCOUNT_NUMBER_LEN..end]
    }

    /// Build the `DC` command.
    ///
    /// # Errors
    ///
    /// Returns [`HsmError::InvalidRequest`] if the request is malformed.
    pub fn command(&self, keys: &PinKeys) -> Result<Bytes, HsmError> {
        self.validate()?;

        let mut cmd = BytesMut::with_capacity(
            VERIFY_PIN.len()
                + keys.tpk.len()
                + keys.pvk.len()
                + PIN_BLOCK_LEN
                + PIN_BLOCK_FORMAT.len()
                + ACCOUNT_NUMBER_LEN
                + PVKI.len()
                + PVV_LEN,
        );
        cmd.put_slice(VERIFY_PIN.as_bytes());
        cmd.put_slice(keys.tpk.as_bytes());
        cmd.put_slice(keys.pvk.as_bytes());
        cmd.put_slice(self.pin_block.as_bytes());
        cmd.put_slice(PIN_BLOCK_FORMAT.as_bytes());
        cmd.put_slice(self.account_number().as_bytes());
        cmd.put_slice(PVKI.as_bytes());
        cmd.put_slice(self.pvv.as_bytes());
        Ok(cmd.freeze())
    }
}

fn all_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}

/// PIN operations against a device, on top of a [`Broker`].
pub struct PinService<C> {
    broker: Broker<C>,
    keys: PinKeys,
}

impl<C> PinService<C>
where
    C: PoolItem + AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(broker: Broker<C>, keys: PinKeys) -> Self {
        Self { broker, keys }
    }

    /// Verify a PIN.
    ///
    /// # Errors
    ///
    /// Returns [`HsmError::Device`] with
    /// [`ErrorCode::PinVerificationFailure`](super::ErrorCode::PinVerificationFailure)
    /// if the PIN is wrong, and other [`HsmError`]s if the request is
    /// malformed or the exchange fails.
    pub async fn verify(&self, request: &PinVerification) -> Result<(), HsmError> {
        let command = request.command(&self.keys)?;
        let raw = self.broker.send(command).await?;
        HsmResponse::parse(raw, VERIFY_PIN_RESPONSE)?;
        debug!("pin verified");
        Ok(())
    }

    /// See [`diagnostics`].
    ///
    /// # Errors
    ///
    /// Returns an [`HsmError`] if the exchange fails or the device rejects it.
    pub async fn diagnostics(&self) -> Result<Bytes, HsmError> {
        diagnostics(&self.broker).await
    }

    /// The broker requests are sent through.
    #[must_use]
    pub fn broker(&self) -> &Broker<C> {
        &self.broker
    }
}

/// Run the diagnostics command, returning the LMK check value and firmware
/// revision as reported by the device. Needs no key material.
///
/// # Errors
///
/// Returns an [`HsmError`] if the exchange fails or the device rejects it.
pub async fn diagnostics<C>(broker: &Broker<C>) -> Result<Bytes, HsmError>
where
    C: PoolItem + AsyncRead + AsyncWrite + Unpin,
{
    let raw = broker.send(Bytes::from_static(DIAGNOSTICS.as_bytes())).await?;
    let response = HsmResponse::parse(raw, DIAGNOSTICS_RESPONSE)?;
    Ok(response.body)
}

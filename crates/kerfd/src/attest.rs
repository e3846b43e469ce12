//! Attestation provider contract.
//!
//! The tunnel core treats attestation as an opaque provider of a
//! static X25519 keypair plus a JSON evidence blob. The public half of
//! the keypair occupies the first 32 bytes of the quote's report_data,
//! which is how the Noise session key gets bound to the TEE identity.
//! Quote generation itself (TDX/SEV-SNP kernel interfaces, signing
//! service roundtrips) lives behind this trait.

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use kerf_core::crypto::Keypair;

/// The payload carried in the first responder handshake message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationEvidence {
    /// "TDX" or "SEV-SNP".
    pub platform: String,
    /// Base64 quote or JWT, depending on the platform flow.
    pub attestation: String,
    /// JSON string describing the running workload.
    pub manifest: String,
    /// JSON string with the manifest signature bundle.
    pub manifest_bundle: String,
}

pub trait AttestationProvider: Send + Sync {
    /// The static keypair whose public half is bound into report_data.
    fn static_keypair(&self) -> &Keypair;

    /// Evidence blob for the handshake. Called once per connection.
    fn evidence(&self) -> Result<AttestationEvidence>;
}

/// Provider for running outside a TEE: an ephemeral keypair and a
/// placeholder quote that still follows the report_data convention, so
/// clients exercise the same verification path end to end.
pub struct DevAttestationProvider {
    keypair: Keypair,
    evidence: AttestationEvidence,
}

impl DevAttestationProvider {
    pub fn new() -> Self {
        let keypair = Keypair::generate();

        // report_data: static public key in the first 32 bytes.
        let mut report_data = [0u8; 64];
        report_data[..32].copy_from_slice(&keypair.public);

        let evidence = AttestationEvidence {
            platform: "TDX".to_string(),
            attestation: BASE64.encode(report_data),
            manifest: "{}".to_string(),
            manifest_bundle: "{}".to_string(),
        };

        tracing::warn!(
            public_key = hex::encode(keypair.public),
            "using dev attestation provider — evidence is NOT a real quote"
        );

        Self { keypair, evidence }
    }
}

impl Default for DevAttestationProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AttestationProvider for DevAttestationProvider {
    fn static_keypair(&self) -> &Keypair {
        &self.keypair
    }

    fn evidence(&self) -> Result<AttestationEvidence> {
        Ok(self.evidence.clone())
    }
}

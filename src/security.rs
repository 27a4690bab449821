use crate::model::TradeCommand;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;

type HmacSha256 = Hmac<Sha256>;

/// What an executor receives on its command subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: TradeCommand,
    /// Milliseconds since epoch at signing time
    pub ts: i64,
    pub nonce: String,
    #[serde(default)]
    pub sig: Option<String>,
}

impl CommandEnvelope {
    pub fn unsigned(command: TradeCommand, ts: i64, nonce: String) -> Self {
        Self {
            command,
            ts,
            nonce,
            sig: None,
        }
    }
}

/// HMAC-SHA256 signer so executors can authenticate the Brain.
///
/// Canonical string: `ts.nonce.command_json`, where the command is serialized
/// through `serde_json::Value` so object keys are sorted.
#[derive(Clone)]
pub struct CommandSigner {
    secret: String,
    timestamp_tolerance_secs: i64,
}

impl CommandSigner {
    pub fn new(secret: impl Into<String>, timestamp_tolerance_secs: i64) -> Result<Self, String> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err("HMAC signing enabled but no secret configured".to_string());
        }
        info!(
            "🔐 Command signer initialized (tol: {}s)",
            timestamp_tolerance_secs
        );
        Ok(Self {
            secret,
            timestamp_tolerance_secs,
        })
    }

    fn canonical(command: &TradeCommand, ts: i64, nonce: &str) -> Result<String, String> {
        let value = serde_json::to_value(command)
            .map_err(|e| format!("Failed to serialize command: {}", e))?;
        let payload = serde_json::to_string(&value)
            .map_err(|e| format!("Failed to serialize command: {}", e))?;
        Ok(format!("{}.{}.{}", ts, nonce, payload))
    }

    fn mac(&self) -> Result<HmacSha256, String> {
        HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| "Invalid secret key length".to_string())
    }

    pub fn sign(
        &self,
        command: TradeCommand,
        ts: i64,
        nonce: String,
    ) -> Result<CommandEnvelope, String> {
        let canonical = Self::canonical(&command, ts, &nonce)?;
        let mut mac = self.mac()?;
        mac.update(canonical.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        Ok(CommandEnvelope {
            command,
            ts,
            nonce,
            sig: Some(sig),
        })
    }

    /// Executor-side check, also used to self-test configuration.
    pub fn verify(&self, envelope: &CommandEnvelope, now_ms: i64) -> Result<(), String> {
        let sig = envelope.sig.as_deref().ok_or("Missing signature")?;

        let diff = (now_ms - envelope.ts).abs();
        let tolerance_ms = self.timestamp_tolerance_secs * 1000;
        if diff > tolerance_ms {
            return Err(format!(
                "Timestamp out of tolerance range (diff: {}ms, tolerance: {}ms)",
                diff, tolerance_ms
            ));
        }

        let canonical = Self::canonical(&envelope.command, envelope.ts, &envelope.nonce)?;
        let sig_bytes = hex::decode(sig).map_err(|_| "Invalid hex signature".to_string())?;

        // verify_slice compares in constant time
        let mut mac = self.mac()?;
        mac.update(canonical.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| "Signature mismatch.".to_string())
    }
}

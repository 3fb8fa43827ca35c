//! Webhook signature verification
//!
//! Signature header format: `t=<unix seconds>,v1=<hex hmac-sha256>`, where the
//! MAC covers `"{t}.{payload}"` keyed by the shared webhook secret. Multiple
//! `v1` entries are accepted (secret rotation on the provider side).

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Default timestamp tolerance (5 minutes)
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    fn secret_key(&self) -> &[u8] {
        self.secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.secret)
            .as_bytes()
    }

    fn compute(&self, timestamp: i64, payload: &str) -> BillingResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key()).map_err(|_| {
            BillingError::WebhookSignatureInvalid("invalid webhook secret key".to_string())
        })?;
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify `header` against `payload` at wall-clock time `now_unix`
    pub fn verify(&self, payload: &str, header: &str, now_unix: i64) -> BillingResult<()> {
        if self.secret.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid(
                "webhook secret not configured".to_string(),
            ));
        }

        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<&str> = Vec::new();

        for part in header.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                match key {
                    "t" => timestamp = value.parse().ok(),
                    "v1" => signatures.push(value),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            BillingError::WebhookSignatureInvalid("missing timestamp".to_string())
        })?;

        if signatures.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid(
                "missing v1 signature".to_string(),
            ));
        }

        let age = (now_unix - timestamp).abs();
        if age > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now_unix,
                diff = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid(
                "timestamp outside tolerance".to_string(),
            ));
        }

        let computed = self.compute(timestamp, payload)?;
        let matched = signatures
            .iter()
            .any(|sig| bool::from(computed.as_bytes().ct_eq(sig.as_bytes())));

        if !matched {
            return Err(BillingError::WebhookSignatureInvalid(
                "signature mismatch".to_string(),
            ));
        }

        Ok(())
    }

    /// Produce a header for `payload` signed at `timestamp`
    pub fn sign(&self, payload: &str, timestamp: i64) -> BillingResult<String> {
        Ok(format!("t={},v1={}", timestamp, self.compute(timestamp, payload)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret_for_signatures";
    const NOW: i64 = 1_760_000_000;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS)
    }

    #[test]
    fn test_valid_signature_accepted() {
        let v = verifier();
        let header = v.sign(r#"{"id":"evt_1"}"#, NOW).unwrap();
        assert!(v.verify(r#"{"id":"evt_1"}"#, &header, NOW).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let v = verifier();
        let header = v.sign(r#"{"id":"evt_1"}"#, NOW).unwrap();
        let result = v.verify(r#"{"id":"evt_2"}"#, &header, NOW);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid(_))));
    }

    #[test]
    fn test_tolerance_boundary() {
        let v = verifier();
        let header = v.sign("{}", NOW).unwrap();
        assert!(v.verify("{}", &header, NOW + 300).is_ok(), "300s old accepted");
        assert!(v.verify("{}", &header, NOW + 301).is_err(), "301s old rejected");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = SignatureVerifier::new("whsec_other", 300)
            .sign("{}", NOW)
            .unwrap();
        assert!(verifier().verify("{}", &header, NOW).is_err());
    }

    #[test]
    fn test_rotated_secret_any_v1_matches() {
        let v = verifier();
        let good = v.sign("{}", NOW).unwrap();
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v1={}", NOW, "00".repeat(32), good_sig);
        assert!(v.verify("{}", &header, NOW).is_ok());
    }

    #[test]
    fn test_malformed_headers_rejected() {
        let v = verifier();
        assert!(v.verify("{}", "", NOW).is_err());
        assert!(v.verify("{}", "v1=abc", NOW).is_err());
        assert!(v.verify("{}", &format!("t={}", NOW), NOW).is_err());
    }

    #[test]
    fn test_empty_secret_rejects_everything() {
        let v = SignatureVerifier::new("", 300);
        assert!(v.verify("{}", &format!("t={},v1=00", NOW), NOW).is_err());
    }
}

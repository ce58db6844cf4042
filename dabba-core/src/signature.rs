//! HMAC-SHA256 signatures used by the payment gateway.
//!
//! The gateway signs two things: the checkout callback (`"{order_ref}|{payment_ref}"`
//! keyed by the API key secret) and every webhook body (keyed by the webhook secret).
//! Both are hex encoded. Comparison goes through `Mac::verify_slice`, which is constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Canonical string signed for a checkout callback.
pub fn checkout_payload(gateway_order_ref: &str, gateway_payment_ref: &str) -> String {
    format!("{}|{}", gateway_order_ref, gateway_payment_ref)
}

/// Hex encoded HMAC-SHA256 of `payload` under `secret`.
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a hex signature over the exact bytes given. Malformed hex is a mismatch.
pub fn verify(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

pub fn verify_checkout(
    key_secret: &str,
    gateway_order_ref: &str,
    gateway_payment_ref: &str,
    signature_hex: &str,
) -> bool {
    let payload = checkout_payload(gateway_order_ref, gateway_payment_ref);
    verify(key_secret.as_bytes(), payload.as_bytes(), signature_hex)
}

pub fn verify_webhook(webhook_secret: &str, raw_body: &[u8], signature_hex: &str) -> bool {
    verify(webhook_secret.as_bytes(), raw_body, signature_hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEBHOOK_SECRET: &str = "whsec_dabba_test";
    const WEBHOOK_BODY: &[u8] = br#"{"event":"payment.captured"}"#;
    const WEBHOOK_SIGNATURE: &str =
        "ad016e2c8cee9597d4674f492d32efe7563547f9add79845f14bb7c59f7f61be";

    #[test]
    fn test_rfc4231_vector() {
        let sig = sign(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(sig, "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");
    }

    #[test]
    fn test_checkout_signature_vector() {
        let sig = "c0c9c1a3621ca1d04dbdaf7dcd550f0974c80d28ef49e46d21996d859d2c518d";
        assert!(verify_checkout("key_secret_test", "order_9A33XWu170gUtm", "pay_29QQoUBi66xm2f", sig));
        assert_eq!(
            sign(b"key_secret_test", checkout_payload("order_9A33XWu170gUtm", "pay_29QQoUBi66xm2f").as_bytes()),
            sig
        );
    }

    #[test]
    fn test_checkout_signature_rejects_swapped_refs() {
        let sig = "c0c9c1a3621ca1d04dbdaf7dcd550f0974c80d28ef49e46d21996d859d2c518d";
        assert!(!verify_checkout("key_secret_test", "pay_29QQoUBi66xm2f", "order_9A33XWu170gUtm", sig));
        assert!(!verify_checkout("wrong_secret", "order_9A33XWu170gUtm", "pay_29QQoUBi66xm2f", sig));
    }

    #[test]
    fn test_webhook_signature_vector() {
        assert!(verify_webhook(WEBHOOK_SECRET, WEBHOOK_BODY, WEBHOOK_SIGNATURE));
        // uppercase hex decodes to the same bytes
        assert!(verify_webhook(WEBHOOK_SECRET, WEBHOOK_BODY, &WEBHOOK_SIGNATURE.to_uppercase()));
    }

    #[test]
    fn test_webhook_single_byte_flip_fails() {
        let tampered = br#"{"event":"payment.capturee"}"#;
        assert!(!verify_webhook(WEBHOOK_SECRET, tampered, WEBHOOK_SIGNATURE));

        let mut flipped = WEBHOOK_BODY.to_vec();
        flipped[3] ^= 0x01;
        assert!(!verify_webhook(WEBHOOK_SECRET, &flipped, WEBHOOK_SIGNATURE));
    }

    #[test]
    fn test_webhook_wrong_secret_fails() {
        assert!(!verify_webhook("other_secret", WEBHOOK_BODY, WEBHOOK_SIGNATURE));
        assert!(verify_webhook(
            "other_secret",
            WEBHOOK_BODY,
            "3d65806b7f770e7f100a8dac4bf3df7d9fd89e28197de1d74470603ce0d540b9"
        ));
    }

    #[test]
    fn test_malformed_signature_is_mismatch() {
        assert!(!verify_webhook(WEBHOOK_SECRET, WEBHOOK_BODY, "not-hex"));
        assert!(!verify_webhook(WEBHOOK_SECRET, WEBHOOK_BODY, ""));
        assert!(!verify_webhook(WEBHOOK_SECRET, WEBHOOK_BODY, &WEBHOOK_SIGNATURE[..32]));
    }
}

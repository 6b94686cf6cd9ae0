//! Signature verification seam.
//!
//! Aggregated votes are signed with an aggregate signature over several
//! consensus keys. The aggregation math lives outside this crate, so
//! verification goes through [`SignatureVerifier`].

use {solana_pubkey::Pubkey, solana_signature::Signature};

/// Verifies a (possibly aggregated) signature over `payload` for `keys`.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, keys: &[Pubkey], payload: &[u8], signature: &Signature) -> bool;
}

/// Ed25519 verifier for single-signer messages.
///
/// Aggregates with more than one key are rejected; nodes running aggregated
/// votes plug in their own verifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, keys: &[Pubkey], payload: &[u8], signature: &Signature) -> bool {
        match keys {
            [key] => signature.verify(key.as_ref(), payload),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        solana_keypair::Keypair,
        solana_signer::Signer,
    };

    #[test]
    fn test_ed25519_verifier() {
        let keypair = Keypair::new();
        let signature = keypair.sign_message(b"payload");
        let verifier = Ed25519Verifier;
        assert!(verifier.verify(&[keypair.pubkey()], b"payload", &signature));
        assert!(!verifier.verify(&[keypair.pubkey()], b"other", &signature));
        assert!(!verifier.verify(
            &[keypair.pubkey(), keypair.pubkey()],
            b"payload",
            &signature
        ));
    }
}

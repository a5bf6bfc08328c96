//! Tests for BLS witness signatures and aggregation.

use tessera_crypto::bls::{BlsPublicKey, BlsSecretKey, BlsSignature};
use tessera_crypto::ed25519::SignKeypair;

fn committee(n: u8) -> Vec<BlsSecretKey> {
    (0..n)
        .map(|i| BlsSecretKey::from_seed(&[i + 10; 32]))
        .collect()
}

#[test]
fn aggregate_of_three_of_four() {
    let keys = committee(4);
    let message = b"witness: block abc at index 5";

    let signatures: Vec<_> = keys[..3].iter().map(|k| k.sign(message)).collect();
    let refs: Vec<_> = signatures.iter().collect();
    let aggregate = BlsSignature::aggregate(&refs).unwrap();

    let public: Vec<_> = keys[..3].iter().map(|k| k.public_key()).collect();
    let public_refs: Vec<_> = public.iter().collect();
    assert!(aggregate.verify_aggregate(message, &public_refs));

    // Verifying against the wrong subset fails
    let wrong: Vec<_> = keys[1..4].iter().map(|k| k.public_key()).collect();
    let wrong_refs: Vec<_> = wrong.iter().collect();
    assert!(!aggregate.verify_aggregate(message, &wrong_refs));
}

#[test]
fn aggregate_rejects_wrong_message() {
    let keys = committee(3);
    let signatures: Vec<_> = keys.iter().map(|k| k.sign(b"message one")).collect();
    let refs: Vec<_> = signatures.iter().collect();
    let aggregate = BlsSignature::aggregate(&refs).unwrap();

    let public: Vec<_> = keys.iter().map(|k| k.public_key()).collect();
    let public_refs: Vec<_> = public.iter().collect();
    assert!(!aggregate.verify_aggregate(b"message two", &public_refs));
}

#[test]
fn signature_bytes_are_48() {
    let key = BlsSecretKey::from_seed(&[42u8; 32]);
    let signature = key.sign(b"size check");
    assert_eq!(signature.to_bytes().0.len(), 48);
    assert_eq!(key.public_key().to_bytes().0.len(), 96);
}

#[test]
fn corrupted_signature_rejected() {
    let key = BlsSecretKey::from_seed(&[43u8; 32]);
    let mut bytes = key.sign(b"payload").to_bytes();
    bytes.0[1] ^= 0xFF;
    // Either the decode fails or verification does
    match BlsSignature::from_bytes(&bytes) {
        Ok(signature) => assert!(!signature.verify(b"payload", &key.public_key())),
        Err(_) => {}
    }
}

#[test]
fn public_key_validates_on_decode() {
    let garbage = tessera_types::BlsPublicKeyBytes([0x11; 96]);
    assert!(BlsPublicKey::from_bytes(&garbage).is_err());
}

#[test]
fn ed25519_and_bls_keys_are_independent() {
    // The same seed must not correlate the two schemes in any way that a
    // caller could observe through verification
    let seed = [21u8; 32];
    let sign = SignKeypair::from_seed(&seed);
    let bls = BlsSecretKey::from_seed(&seed);
    let signature = sign.sign(b"cross");
    assert!(sign.public_key().verify(b"cross", &signature));
    assert!(bls.sign(b"cross").verify(b"cross", &bls.public_key()));
}

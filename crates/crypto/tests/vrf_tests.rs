//! Tests for the VRF used by the slot lottery.

use tessera_crypto::vrf::{VrfProof, VrfPublicKey, VrfSecretKey};

#[test]
fn deterministic_from_seed() {
    let a = VrfSecretKey::from_seed(&[11u8; 32]);
    let b = VrfSecretKey::from_seed(&[11u8; 32]);
    assert_eq!(a.public_key(), b.public_key());

    let (out_a, _) = a.prove(b"input");
    let (out_b, _) = b.prove(b"input");
    assert_eq!(out_a, out_b);
}

#[test]
fn distinct_keys_distinct_outputs() {
    let a = VrfSecretKey::from_seed(&[1u8; 32]);
    let b = VrfSecretKey::from_seed(&[2u8; 32]);
    let (out_a, _) = a.prove(b"input");
    let (out_b, _) = b.prove(b"input");
    assert_ne!(out_a, out_b);
}

#[test]
fn proof_only_verifies_under_its_key() {
    let a = VrfSecretKey::from_seed(&[3u8; 32]);
    let b = VrfSecretKey::from_seed(&[4u8; 32]);
    let (_, proof) = a.prove(b"slot 9");
    assert!(a.public_key().verify(b"slot 9", &proof).is_some());
    assert!(b.public_key().verify(b"slot 9", &proof).is_none());
}

#[test]
fn tampered_proof_rejected() {
    let key = VrfSecretKey::from_seed(&[5u8; 32]);
    let (_, proof) = key.prove(b"slot 1");
    let mut bytes = proof.to_bytes();
    bytes.0[0] ^= 0x01;
    let tampered = VrfProof::from_bytes(&bytes);
    assert!(key.public_key().verify(b"slot 1", &tampered).is_none());
}

#[test]
fn public_key_wire_round_trip() {
    let key = VrfSecretKey::from_seed(&[6u8; 32]);
    let bytes = key.public_key().to_bytes();
    let restored = VrfPublicKey::from_bytes(&bytes).unwrap();
    assert_eq!(&restored, key.public_key());

    let (output, proof) = key.prove(b"after restore");
    assert_eq!(restored.verify(b"after restore", &proof), Some(output));
}

#[test]
fn fractions_spread_over_unit_interval() {
    // The lottery depends on outputs behaving uniformly; a couple of
    // hundred draws should straddle one half
    let key = VrfSecretKey::from_seed(&[7u8; 32]);
    let mut below = 0u32;
    for i in 0u32..200 {
        let (output, _) = key.prove(&i.to_be_bytes());
        if output.to_fraction() < 0.5 {
            below += 1;
        }
    }
    assert!((40..=160).contains(&below), "suspicious split: {below}/200");
}

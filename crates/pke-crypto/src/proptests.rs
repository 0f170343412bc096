
#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::content::{ecies_decrypt, ecies_encrypt, ContentError, ContentKeyPair};
    use crate::der::{is_low_s, normalize_low_s, parse_der_signature};
    use crate::rlp::{decode, encode, Item};

    fn arb_item() -> impl Strategy<Value = Item> {
        let leaf = prop_oneof![
            Just(Item::empty()),
            any::<u64>().prop_map(Item::uint),
            proptest::collection::vec(any::<u8>(), 0..80).prop_map(Item::Bytes),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            proptest::collection::vec(inner, 0..8).prop_map(Item::List)
        })
    }

    proptest! {
        #[test]
        fn test_codec_round_trip(item in arb_item()) {
            let encoded = encode(&item);
            prop_assert_eq!(decode(&encoded).unwrap(), item);
        }

        #[test]
        fn test_codec_truncation_never_decodes(item in arb_item()) {
            let encoded = encode(&item);
            for cut in 0..encoded.len() {
                prop_assert!(decode(&encoded[..cut]).is_err());
            }
        }

        #[test]
        fn test_low_s_idempotent(s in any::<[u8; 32]>()) {
            let once = normalize_low_s(&s);
            prop_assert_eq!(normalize_low_s(&once), once);
        }

        #[test]
        fn test_der_truncation_always_errors(digest in any::<[u8; 32]>()) {
            use p256::ecdsa::{signature::Signer, Signature, SigningKey};
            use rand_core::OsRng;

            let key = SigningKey::random(&mut OsRng);
            let sig: Signature = key.sign(&digest);
            let der = sig.to_der();
            let der = der.as_bytes();
            let (_, s) = parse_der_signature(der).unwrap();
            prop_assert!(is_low_s(&normalize_low_s(&s)));
            for cut in 0..der.len() {
                prop_assert!(parse_der_signature(&der[..cut]).is_err());
            }
        }

        #[test]
        fn test_der_mistagged_always_errors(digest in any::<[u8; 32]>(), tag in any::<u8>()) {
            use p256::ecdsa::{signature::Signer, Signature, SigningKey};
            use rand_core::OsRng;

            prop_assume!(tag != 0x30);
            let key = SigningKey::random(&mut OsRng);
            let sig: Signature = key.sign(&digest);
            let mut der = sig.to_der().as_bytes().to_vec();
            der[0] = tag;
            prop_assert!(parse_der_signature(&der).is_err());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn test_ecies_round_trip_and_tamper(
            plaintext in proptest::collection::vec(any::<u8>(), 0..4096),
            flip_index in any::<usize>(),
            flip_bit in 0u8..8,
        ) {
            let pair = ContentKeyPair::generate();
            let envelope = ecies_encrypt(&pair.public_key, &plaintext).unwrap();
            prop_assert_eq!(ecies_decrypt(&pair.secret, &envelope).unwrap(), plaintext);

            let mut tampered = envelope.clone();
            let i = flip_index % tampered.ciphertext.len();
            tampered.ciphertext[i] ^= 1 << flip_bit;
            prop_assert_eq!(ecies_decrypt(&pair.secret, &tampered), Err(ContentError::Authentication));

            let mut tampered = envelope.clone();
            let i = flip_index % tampered.iv.len();
            tampered.iv[i] ^= 1 << flip_bit;
            prop_assert_eq!(ecies_decrypt(&pair.secret, &tampered), Err(ContentError::Authentication));

            let mut tampered = envelope;
            let i = 1 + flip_index % 64;
            tampered.ephemeral_public_key[i] ^= 1 << flip_bit;
            prop_assert_eq!(ecies_decrypt(&pair.secret, &tampered), Err(ContentError::Authentication));
        }
    }
}

//! DER ECDSA signature parsing and P-256 low-S canonicalization.

use alloy_primitives::U256;
use thiserror::Error;

const SEQUENCE_TAG: u8 = 0x30;
const INTEGER_TAG: u8 = 0x02;

/// P-256 group order n.
pub const P256_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xbc, 0xe6, 0xfa, 0xad, 0xa7, 0x17, 0x9e, 0x84, 0xf3, 0xb9, 0xca, 0xc2, 0xfc, 0x63, 0x25, 0x51,
];

/// floor(n / 2) for P-256.
pub const P256_HALF_ORDER: [u8; 32] = [
    0x7f, 0xff, 0xff, 0xff, 0x80, 0x00, 0x00, 0x00, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xde, 0x73, 0x7d, 0x56, 0xd3, 0x8b, 0xcf, 0x42, 0x79, 0xdc, 0xe5, 0x61, 0x7e, 0x31, 0x92, 0xa8,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerError {
    #[error("der input truncated")]
    Truncated,
    #[error("unexpected tag: expected {expected:#04x}, found {found:#04x}")]
    WrongTag { expected: u8, found: u8 },
    #[error("invalid der length")]
    BadLength,
    #[error("integer wider than {0} bytes")]
    IntegerTooLarge(usize),
    #[error("{0} trailing bytes in der signature")]
    TrailingBytes(usize),
}

/// Parse a DER `SEQUENCE { INTEGER r, INTEGER s }` into fixed 32-byte
/// big-endian scalars.
pub fn parse_der_signature(der: &[u8]) -> Result<([u8; 32], [u8; 32]), DerError> {
    let mut cursor = Cursor { buf: der, pos: 0 };

    cursor.expect_tag(SEQUENCE_TAG)?;
    let seq_len = cursor.read_length()?;
    let body_end = cursor.pos.checked_add(seq_len).ok_or(DerError::BadLength)?;
    if body_end > der.len() {
        return Err(DerError::Truncated);
    }
    if body_end < der.len() {
        return Err(DerError::TrailingBytes(der.len() - body_end));
    }

    let r = cursor.read_integer()?;
    let s = cursor.read_integer()?;

    if cursor.pos != body_end {
        return Err(DerError::TrailingBytes(body_end - cursor.pos));
    }
    Ok((r, s))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Result<u8, DerError> {
        let b = *self.buf.get(self.pos).ok_or(DerError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn expect_tag(&mut self, expected: u8) -> Result<(), DerError> {
        let found = self.byte()?;
        if found != expected {
            return Err(DerError::WrongTag { expected, found });
        }
        Ok(())
    }

    fn read_length(&mut self) -> Result<usize, DerError> {
        let first = self.byte()?;
        match first {
            0x00..=0x7f => Ok(first as usize),
            0x81 => {
                let len = self.byte()?;
                // Short lengths must use the one-byte form.
                if len < 0x80 {
                    return Err(DerError::BadLength);
                }
                Ok(len as usize)
            }
            _ => Err(DerError::BadLength),
        }
    }

    fn read_integer(&mut self) -> Result<[u8; 32], DerError> {
        self.expect_tag(INTEGER_TAG)?;
        let len = self.read_length()?;
        if len == 0 {
            return Err(DerError::BadLength);
        }
        let end = self.pos.checked_add(len).ok_or(DerError::BadLength)?;
        let raw = self.buf.get(self.pos..end).ok_or(DerError::Truncated)?;
        self.pos = end;

        let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
        let digits = &raw[start..];
        if digits.len() > 32 {
            return Err(DerError::IntegerTooLarge(32));
        }
        let mut out = [0u8; 32];
        out[32 - digits.len()..].copy_from_slice(digits);
        Ok(out)
    }
}

/// Replace `s` with `n - s` when `s > n/2`. Only meaningful for P-256.
pub fn normalize_low_s(s: &[u8; 32]) -> [u8; 32] {
    let value = U256::from_be_bytes(*s);
    let half = U256::from_be_bytes(P256_HALF_ORDER);
    if value > half {
        let order = U256::from_be_bytes(P256_ORDER);
        order.wrapping_sub(value).to_be_bytes::<32>()
    } else {
        *s
    }
}

pub fn is_low_s(s: &[u8; 32]) -> bool {
    U256::from_be_bytes(*s) <= U256::from_be_bytes(P256_HALF_ORDER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn der(r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut body = vec![INTEGER_TAG, r.len() as u8];
        body.extend_from_slice(r);
        body.push(INTEGER_TAG);
        body.push(s.len() as u8);
        body.extend_from_slice(s);
        let mut out = vec![SEQUENCE_TAG, body.len() as u8];
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn test_parse_strips_sign_padding_and_left_pads() {
        let mut r = vec![0x00];
        r.extend_from_slice(&[0xff; 32]);
        let s = vec![0x01, 0x02];
        let (pr, ps) = parse_der_signature(&der(&r, &s)).unwrap();
        assert_eq!(pr, [0xff; 32]);
        let mut expected_s = [0u8; 32];
        expected_s[30] = 0x01;
        expected_s[31] = 0x02;
        assert_eq!(ps, expected_s);
    }

    #[test]
    fn test_parse_matches_p256_der_output() {
        use p256::ecdsa::{signature::Signer, Signature, SigningKey};
        use rand_core::OsRng;

        let key = SigningKey::random(&mut OsRng);
        let sig: Signature = key.sign(b"digest");
        let (r, s) = parse_der_signature(sig.to_der().as_bytes()).unwrap();
        let bytes = sig.to_bytes();
        assert_eq!(&r[..], &bytes[..32]);
        assert_eq!(&s[..], &bytes[32..]);
    }

    #[test]
    fn test_wrong_tags() {
        let mut bad = der(&[1], &[2]);
        bad[0] = 0x31;
        assert_eq!(
            parse_der_signature(&bad),
            Err(DerError::WrongTag { expected: 0x30, found: 0x31 })
        );

        let mut bad = der(&[1], &[2]);
        bad[2] = 0x03;
        assert!(matches!(parse_der_signature(&bad), Err(DerError::WrongTag { .. })));
    }

    #[test]
    fn test_truncated_and_trailing() {
        let good = der(&[1; 32], &[2; 32]);
        assert_eq!(parse_der_signature(&good[..good.len() - 1]), Err(DerError::Truncated));
        let mut extra = good.clone();
        extra.push(0);
        assert_eq!(parse_der_signature(&extra), Err(DerError::TrailingBytes(1)));
        assert_eq!(parse_der_signature(&[]), Err(DerError::Truncated));
    }

    #[test]
    fn test_integer_too_large() {
        let r = vec![0x01; 33];
        assert_eq!(
            parse_der_signature(&der(&r, &[1])),
            Err(DerError::IntegerTooLarge(32))
        );
    }

    #[test]
    fn test_low_s() {
        let mut high = P256_HALF_ORDER;
        high[31] += 1;
        assert!(!is_low_s(&high));
        let low = normalize_low_s(&high);
        assert!(is_low_s(&low));
        assert_eq!(normalize_low_s(&P256_HALF_ORDER), P256_HALF_ORDER);
        assert_eq!(normalize_low_s(&low), low);
    }
}

//! Answer-To-Reset decoding properties

use nexum_scr_core::atr::{Protocol, parse_atr};
use nexum_scr_core::capabilities::Capabilities;
use nexum_scr_core::{AtrError, ProtocolError};

const VALID_ATRS: [&str; 3] = [
    "3BF89600008131FE454A434F507632343132",
    "3B901891111FC3D4",
    "3BDA18FF81B1FE751F030031C573C001400090000C",
];

fn atr(hex_str: &str) -> Vec<u8> {
    hex::decode(hex_str).unwrap()
}

#[test]
fn test_history_length_follows_k() {
    for k in 0..=15u8 {
        let mut raw = vec![0x3B, k];
        raw.extend((0..k).map(|i| 0x40 + i));
        let parsed = parse_atr(&raw).unwrap();
        assert_eq!(parsed.history_len(), usize::from(k));
        assert_eq!(parsed.history.as_ref(), &raw[2..]);
        assert_eq!(parsed.tck, None);

        // An optional TCK on a T=0 card must still check out
        let tck = raw[1..].iter().fold(0, |acc, b| acc ^ b);
        raw.push(tck);
        let parsed = parse_atr(&raw).unwrap();
        assert_eq!(parsed.history_len(), usize::from(k));
        assert_eq!(parsed.tck, Some(tck));
        assert!(parsed.checksum_valid);
    }
}

#[test]
fn test_t0_card_with_five_history_bytes() {
    let parsed = parse_atr(&atr("3B6500009C11010103")).unwrap();
    assert_eq!(parsed.history_len(), 5);
    assert_eq!(parsed.history.as_ref(), &[0x9C, 0x11, 0x01, 0x01, 0x03]);
    assert!(parsed.is_t0_only());
    assert_eq!(parsed.extra_guard, Some(0x00));
}

#[test]
fn test_any_bit_flip_is_rejected() {
    for hex_str in VALID_ATRS {
        let raw = atr(hex_str);
        parse_atr(&raw).unwrap();
        // TS errors are covered separately; flip everything after it
        for index in 1..raw.len() {
            for bit in 0..8 {
                let mut corrupt = raw.clone();
                corrupt[index] ^= 1 << bit;
                assert!(
                    parse_atr(&corrupt).is_err(),
                    "{hex_str}: flipping bit {bit} of byte {index} went unnoticed"
                );
            }
        }
    }
}

#[test]
fn test_tck_flip_reports_checksum() {
    for hex_str in VALID_ATRS {
        let mut raw = atr(hex_str);
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert_eq!(parse_atr(&raw), Err(ProtocolError::InvalidAtr(AtrError::Checksum(0x01))));
    }
}

#[test]
fn test_t1_cards_select_t1() {
    for hex_str in VALID_ATRS {
        let parsed = parse_atr(&atr(hex_str)).unwrap();
        let (protocol, _, _) = Capabilities::selection(&parsed).unwrap();
        assert_eq!(protocol, Protocol::T1, "{hex_str}");
    }
}

#[test]
fn test_truncated_and_oversized() {
    let raw = atr("3BF89600008131FE454A434F507632343132");
    assert!(parse_atr(&raw[..5]).is_err());
    assert_eq!(
        parse_atr(&[0x3B; 34]),
        Err(ProtocolError::InvalidAtr(AtrError::TooLong(34)))
    );
    assert_eq!(parse_atr(&[0x3A, 0x00]), Err(ProtocolError::InvalidAtr(AtrError::InvalidTs(0x3A))));
}

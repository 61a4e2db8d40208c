//! One's complement checksum (RFC 1071 style) over a complete datagram, i.e. header and payload.
//!  There is no pseudo-header: the checksum covers exactly the bytes that go on the wire.

use crate::header::RudpHeader;

const CHECKSUM_RANGE: std::ops::Range<usize> = RudpHeader::CHECKSUM_OFFSET..RudpHeader::CHECKSUM_OFFSET + 2;

fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    // odd length: pad with a zero byte
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Computes the checksum of a serialized datagram and writes it into the header's checksum
///  field. The field's previous content is ignored.
pub fn fill_checksum(datagram: &mut [u8]) {
    assert!(datagram.len() >= RudpHeader::SERIALIZED_LEN, "datagram must contain a full header");

    datagram[CHECKSUM_RANGE].copy_from_slice(&[0, 0]);
    let checksum = !ones_complement_sum(datagram);
    datagram[CHECKSUM_RANGE].copy_from_slice(&checksum.to_be_bytes());
}

/// Verifies a received datagram: summing everything including the transmitted checksum must
///  yield all ones, i.e. zero after complementing.
pub fn check_header_checksum(datagram: &[u8]) -> bool {
    if datagram.len() < RudpHeader::SERIALIZED_LEN {
        return false;
    }
    !ones_complement_sum(datagram) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use rstest::rstest;
    use crate::header::HeaderFlags;
    use crate::seq_num::SeqNum;

    fn datagram(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        RudpHeader::new(4711, 8080, SeqNum::from_raw(1000), SeqNum::from_raw(2000), HeaderFlags::ACK, 10)
            .ser(&mut buf);
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[test]
    fn test_sum_known_value() {
        // example from RFC 1071, section 3
        assert_eq!(ones_complement_sum(&[0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7]), 0xddf2);
    }

    #[rstest]
    #[case::no_payload(vec![])]
    #[case::odd_payload(vec![1, 2, 3])]
    #[case::even_payload(vec![9; 1024])]
    #[case::all_ones(vec![0xff; 7])]
    fn test_fill_then_check(#[case] payload: Vec<u8>) {
        let mut buf = datagram(&payload);
        fill_checksum(&mut buf);
        assert!(check_header_checksum(&buf));
    }

    #[test]
    fn test_fill_ignores_previous_value() {
        let mut a = datagram(b"abc");
        let mut b = a.clone();
        b[RudpHeader::CHECKSUM_OFFSET] = 0x55;
        fill_checksum(&mut a);
        fill_checksum(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_single_bit_flips_are_detected() {
        let mut buf = datagram(b"some payload data");
        fill_checksum(&mut buf);

        for byte in 0..buf.len() {
            for bit in 0..8 {
                let mut corrupted = buf.clone();
                corrupted[byte] ^= 1 << bit;
                assert!(!check_header_checksum(&corrupted), "flip of bit {} in byte {} undetected", bit, byte);
            }
        }
    }

    #[test]
    fn test_unfilled_checksum_fails() {
        let buf = datagram(b"xyz");
        assert!(!check_header_checksum(&buf));
    }

    #[test]
    fn test_too_short() {
        assert!(!check_header_checksum(&[0u8; 10]));
    }
}

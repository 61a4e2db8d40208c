use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use crate::seq_num::SeqNum;

bitflags! {
    /// TCP style control flags, encoded in header byte 13 (MSB to LSB)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HeaderFlags: u8 {
        const CWR = 0x80;
        const ECE = 0x40;
        const URG = 0x20;
        const ACK = 0x10;
        const PSH = 0x08;
        const RST = 0x04;
        const SYN = 0x02;
        const FIN = 0x01;
    }
}

/// The fixed-size header that precedes every datagram's payload. All numbers are in network
///  byte order:
///
/// ```ascii
///  0: source port (u16)
///  2: destination port (u16)
///  4: sequence number (u32)
///  8: acknowledgment number (u32)
/// 12: data offset (4 bits), reserved (3 bits), NS flag (1 bit)
/// 13: flags CWR, ECE, URG, ACK, PSH, RST, SYN, FIN
/// 14: advertised receive window in packets (u16)
/// 16: checksum (u16)
/// 18: urgent pointer (u16), unused
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RudpHeader {
    pub source_port: u16,
    pub dest_port: u16,
    pub seq_num: SeqNum,
    pub ack_num: SeqNum,
    pub data_offset: u8,
    pub ns: bool,
    pub flags: HeaderFlags,
    pub recv_window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
}

impl RudpHeader {
    pub const SERIALIZED_LEN: usize = 20;
    pub const CHECKSUM_OFFSET: usize = 16;

    /// header length in 32 bit words
    pub const DEFAULT_DATA_OFFSET: u8 = (Self::SERIALIZED_LEN / 4) as u8;

    pub fn new(source_port: u16, dest_port: u16, seq_num: SeqNum, ack_num: SeqNum, flags: HeaderFlags, recv_window: u16) -> RudpHeader {
        RudpHeader {
            source_port,
            dest_port,
            seq_num,
            ack_num,
            data_offset: Self::DEFAULT_DATA_OFFSET,
            ns: false,
            flags,
            recv_window,
            checksum: 0,
            urgent_pointer: 0,
        }
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(HeaderFlags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(HeaderFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(HeaderFlags::FIN)
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(self.source_port);
        buf.put_u16(self.dest_port);
        buf.put_u32(self.seq_num.to_raw());
        buf.put_u32(self.ack_num.to_raw());
        buf.put_u8((self.data_offset << 4) | (self.ns as u8));
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.recv_window);
        buf.put_u16(self.checksum);
        buf.put_u16(self.urgent_pointer);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RudpHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("incomplete header: {} bytes", buf.remaining());
        }

        let source_port = buf.get_u16();
        let dest_port = buf.get_u16();
        let seq_num = SeqNum::from_raw(buf.get_u32());
        let ack_num = SeqNum::from_raw(buf.get_u32());
        let offset_byte = buf.get_u8();
        let flags = HeaderFlags::from_bits_retain(buf.get_u8());
        let recv_window = buf.get_u16();
        let checksum = buf.get_u16();
        let urgent_pointer = buf.get_u16();

        Ok(RudpHeader {
            source_port,
            dest_port,
            seq_num,
            ack_num,
            data_offset: offset_byte >> 4,
            ns: offset_byte & 0x01 != 0,
            flags,
            recv_window,
            checksum,
            urgent_pointer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_ser_layout() {
        let mut header = RudpHeader::new(0x1234, 0x5678, SeqNum::from_raw(1000), SeqNum::from_raw(0x01020304), HeaderFlags::SYN | HeaderFlags::ACK, 10);
        header.ns = true;
        header.checksum = 0xabcd;

        let mut buf = BytesMut::new();
        header.ser(&mut buf);

        assert_eq!(buf.as_ref(), &[
            0x12, 0x34,
            0x56, 0x78,
            0, 0, 0x03, 0xe8,
            1, 2, 3, 4,
            0x51,
            0x12,
            0, 10,
            0xab, 0xcd,
            0, 0,
        ]);
    }

    #[rstest]
    #[case::empty(HeaderFlags::empty(), false)]
    #[case::syn(HeaderFlags::SYN, false)]
    #[case::syn_ack(HeaderFlags::SYN | HeaderFlags::ACK, false)]
    #[case::fin_ack(HeaderFlags::FIN | HeaderFlags::ACK, true)]
    #[case::all(HeaderFlags::all(), true)]
    fn test_ser_deser(#[case] flags: HeaderFlags, #[case] ns: bool) {
        let mut original = RudpHeader::new(1, 65535, SeqNum::from_raw(u32::MAX), SeqNum::from_raw(5120), flags, 7);
        original.ns = ns;
        original.checksum = 99;
        original.urgent_pointer = 3;

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), RudpHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = RudpHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_deser_leaves_payload() {
        let mut buf = BytesMut::new();
        RudpHeader::new(1, 2, SeqNum::ZERO, SeqNum::ZERO, HeaderFlags::empty(), 0).ser(&mut buf);
        buf.put_slice(b"payload");

        let mut b: &[u8] = &buf;
        RudpHeader::deser(&mut b).unwrap();
        assert_eq!(b, b"payload");
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one_short(19)]
    fn test_deser_too_short(#[case] len: usize) {
        let buf = vec![0u8; len];
        let mut b: &[u8] = &buf;
        assert!(RudpHeader::deser(&mut b).is_err());
    }
}

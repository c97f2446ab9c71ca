use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crc::{Crc, CRC_32_ISCSI};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::transport::PacketFlags;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 1,
    Accept = 2,
    Refuse = 3,
    Disconnect = 4,
    DisconnectAck = 5,
    Data = 6,
    Ack = 7,
    Ping = 8,
}

/// Fixed-size header at the start of every datagram:
///
/// ```ascii
/// 0: protocol version (u8)
/// 1: CRC-32 checksum (u32 BE) of everything after the checksum field
/// 5: packet kind (u8)
/// 6: connection id (u32 BE)
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    /// chosen randomly by the connecting side, distinguishes different connections between the
    ///  same pair of addresses
    pub connection_id: u32,
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    pub const SERIALIZED_LEN: usize = 10;
    const CHECKSUM_OFFSET: usize = 1;
    const CHECKSUMMED_OFFSET: usize = 5;

    pub fn new(kind: PacketKind, connection_id: u32) -> PacketHeader {
        PacketHeader { kind, connection_id }
    }

    /// writes the header with a placeholder checksum - call [PacketHeader::finalize_checksum]
    ///  after the body was written
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(Self::PROTOCOL_VERSION_1);
        buf.put_u32(0);
        buf.put_u8(self.kind.into());
        buf.put_u32(self.connection_id);
    }

    pub fn finalize_checksum(buf: &mut BytesMut) {
        let checksum = CHECKSUM.checksum(&buf[Self::CHECKSUMMED_OFFSET..]);
        buf[Self::CHECKSUM_OFFSET..Self::CHECKSUMMED_OFFSET].copy_from_slice(&checksum.to_be_bytes());
    }

    /// Parses and verifies the header, returning it together with the remaining body
    pub fn deser(datagram: &[u8]) -> anyhow::Result<(PacketHeader, &[u8])> {
        if datagram.len() < Self::SERIALIZED_LEN {
            bail!("datagram of {} bytes is shorter than a packet header", datagram.len());
        }

        let mut buf = datagram;
        let version = buf.get_u8();
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }

        let checksum = buf.get_u32();
        let actual = CHECKSUM.checksum(&datagram[Self::CHECKSUMMED_OFFSET..]);
        if checksum != actual {
            bail!("checksum mismatch");
        }

        let raw_kind = buf.get_u8();
        let kind = PacketKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid packet kind {}", raw_kind))?;
        let connection_id = buf.get_u32();

        Ok((PacketHeader { kind, connection_id }, buf))
    }
}

/// Body of a CONNECT packet
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectBody<'a> {
    pub channel_count: u8,
    pub connect_data: &'a [u8],
}
impl <'a> ConnectBody<'a> {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.channel_count);
        buf.put_slice(self.connect_data);
    }

    pub fn deser(mut buf: &'a [u8]) -> anyhow::Result<ConnectBody<'a>> {
        if !buf.has_remaining() {
            bail!("CONNECT without channel count");
        }
        let channel_count = buf.get_u8();
        Ok(ConnectBody {
            channel_count,
            connect_data: buf,
        })
    }
}

/// Body of an ACCEPT packet: the channel count both sides agreed on
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AcceptBody {
    pub channel_count: u8,
}
impl AcceptBody {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.channel_count);
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<AcceptBody> {
        if !buf.has_remaining() {
            bail!("ACCEPT without channel count");
        }
        Ok(AcceptBody {
            channel_count: buf.get_u8(),
        })
    }
}

/// Header of a DATA packet, followed by the application payload
///
/// ```ascii
/// 0: channel (u8)
/// 1: flags (u8)
/// 2: sequence number (varint u32) - per channel, separate counters for reliable and
///     unreliable packets, unused (0) for unsequenced packets
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DataHeader {
    pub channel: u8,
    pub flags: PacketFlags,
    pub sequence: u32,
}
impl DataHeader {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.channel);
        buf.put_u8(self.flags.bits());
        buf.put_u32_varint(self.sequence);
    }

    pub fn deser(buf: &mut &[u8]) -> anyhow::Result<DataHeader> {
        if buf.remaining() < 2 {
            bail!("incomplete DATA header");
        }
        let channel = buf.get_u8();
        let raw_flags = buf.get_u8();
        let flags = PacketFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("invalid packet flags {:#04x}", raw_flags))?;
        let sequence = buf.try_get_u32_varint()?;
        Ok(DataHeader { channel, flags, sequence })
    }
}

/// Body of an ACK packet: acknowledges a single reliable DATA packet
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AckBody {
    pub channel: u8,
    pub sequence: u32,
}
impl AckBody {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.channel);
        buf.put_u32_varint(self.sequence);
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<AckBody> {
        if !buf.has_remaining() {
            bail!("incomplete ACK");
        }
        let channel = buf.get_u8();
        let sequence = buf.try_get_u32_varint()?;
        Ok(AckBody { channel, sequence })
    }
}

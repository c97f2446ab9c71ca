//! The packet send path: application packets serialize themselves into a byte buffer, which
//!  is then handed to the session as an opaque payload.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::session::{Session, SessionError};
use crate::transport::{PacketFlags, PeerHandle};

/// Something that can be sent. The session does not interpret the serialized bytes.
pub trait Packet {
    fn serialize(&self, sink: &mut BytesMut);

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize(&mut buf);
        buf.freeze()
    }
}

impl Packet for [u8] {
    fn serialize(&self, sink: &mut BytesMut) {
        sink.put_slice(self);
    }
}

impl Packet for Vec<u8> {
    fn serialize(&self, sink: &mut BytesMut) {
        sink.put_slice(self);
    }
}

impl Packet for Bytes {
    fn serialize(&self, sink: &mut BytesMut) {
        sink.put_slice(self);
    }

    fn to_bytes(&self) -> Bytes {
        self.clone()
    }
}

impl Packet for str {
    fn serialize(&self, sink: &mut BytesMut) {
        sink.put_slice(self.as_bytes());
    }
}

impl Packet for String {
    fn serialize(&self, sink: &mut BytesMut) {
        sink.put_slice(self.as_bytes());
    }
}

/// Serializes `packet` and sends it through the session, see [Session::send] for the meaning
///  of `target`.
pub fn send_packet<P: Packet + ?Sized>(session: &mut Session, target: Option<PeerHandle>, packet: &P, channel: u8, flags: PacketFlags) -> Result<(), SessionError> {
    let data = packet.to_bytes();
    trace!("serialized packet to {} bytes", data.len());
    session.send(target, data, channel, flags)
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};
    use rstest::rstest;
    use super::*;

    /// a length-prefixed chat line
    struct ChatLine {
        from: String,
        text: String,
    }

    impl Packet for ChatLine {
        fn serialize(&self, sink: &mut BytesMut) {
            sink.put_u8(self.from.len() as u8);
            sink.put_slice(self.from.as_bytes());
            sink.put_slice(self.text.as_bytes());
        }
    }

    #[rstest]
    #[case::str("ping", b"ping".to_vec())]
    #[case::empty("", Vec::new())]
    fn test_str(#[case] packet: &str, #[case] expected: Vec<u8>) {
        assert_eq!(packet.to_bytes(), Bytes::from(expected));
    }

    #[test]
    fn test_owned_and_borrowed_buffers() {
        assert_eq!(String::from("abc").to_bytes(), Bytes::from_static(b"abc"));
        assert_eq!(vec![1u8, 2, 3].to_bytes(), Bytes::from_static(&[1, 2, 3]));
        assert_eq!([4u8, 5][..].to_bytes(), Bytes::from_static(&[4, 5]));
        assert_eq!(Bytes::from_static(b"xyz").to_bytes(), Bytes::from_static(b"xyz"));
    }

    #[test]
    fn test_custom_packet() {
        let line = ChatLine { from: "bob".to_string(), text: "hi".to_string() };
        assert_eq!(line.to_bytes(), Bytes::from_static(b"\x03bobhi"));
    }

    #[test]
    fn test_serialize_appends_to_sink() {
        let mut sink = BytesMut::new();
        sink.put_u8(0xff);
        "ab".serialize(&mut sink);
        assert_eq!(sink.as_ref(), &[0xff, b'a', b'b']);
    }
}

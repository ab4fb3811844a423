// Numan Thabit 2025
// filter.rs - outbound message normalisation ahead of the write queue
use std::net::SocketAddr;

use bytes::{Buf, Bytes};

use crate::error::ChannelError;
use crate::io::caps::Caps;
use crate::msg::DatagramMessage;

/// Outbound message as handed in by the user, before normalisation. The
/// payload may be any [`Buf`], contiguous or not.
#[derive(Debug)]
pub enum OutboundMessage<B> {
    /// Bare payload for a connected channel.
    Buffer(B),
    /// Payload with an explicit recipient.
    Addressed {
        /// Datagram payload.
        payload: B,
        /// Destination, or `None` to use the connected peer.
        recipient: Option<SocketAddr>,
    },
    /// Payload the kernel should split into `segment_size`-byte datagrams.
    Segmented {
        /// Concatenation of equal-sized sub-datagrams.
        payload: B,
        /// Size of each wire datagram.
        segment_size: u16,
        /// Destination, or `None` to use the connected peer.
        recipient: Option<SocketAddr>,
    },
}

/// True when the buffer exposes its whole content as one contiguous region
/// the kernel can address directly through a single iovec.
pub fn is_contiguous<B: Buf>(buf: &B) -> bool {
    buf.chunk().len() == buf.remaining()
}

// Zero-copy when the input is already a contiguous Bytes; otherwise this is
// the copy-to-direct-buffer step.
fn to_payload<B: Buf>(mut buf: B) -> Bytes {
    let len = buf.remaining();
    buf.copy_to_bytes(len)
}

/// Normalises an outbound message into the channel's canonical shape,
/// copying the payload into a contiguous allocation when required.
///
/// First matching rule wins:
/// - segmented without platform UDP_SEGMENT support fails fast,
/// - a zero segment size fails fast,
/// - otherwise the payload is made contiguous and the shape preserved.
pub fn filter_outbound<B: Buf>(
    msg: OutboundMessage<B>,
    caps: &Caps,
) -> Result<DatagramMessage, ChannelError> {
    match msg {
        OutboundMessage::Segmented { .. } if !caps.udp_segment => Err(
            ChannelError::UnsupportedMessage("segmented datagrams need UDP_SEGMENT"),
        ),
        OutboundMessage::Segmented { segment_size: 0, .. } => Err(
            ChannelError::UnsupportedMessage("segment size must be non-zero"),
        ),
        OutboundMessage::Segmented {
            payload,
            segment_size,
            recipient,
        } => Ok(DatagramMessage::Segmented {
            payload: to_payload(payload),
            segment_size,
            recipient,
        }),
        OutboundMessage::Addressed { payload, recipient } => Ok(DatagramMessage::Addressed {
            payload: to_payload(payload),
            recipient,
        }),
        OutboundMessage::Buffer(payload) => Ok(DatagramMessage::Buffer(to_payload(payload))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps_with_gso() -> Caps {
        Caps {
            sendmmsg: true,
            recvmmsg: true,
            udp_segment: true,
            udp_gro: false,
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[test]
    fn contiguous_bytes_pass_through_without_copy() {
        let payload = Bytes::from_static(b"hello datagram");
        let ptr = payload.as_ptr();

        let msg = filter_outbound(
            OutboundMessage::Addressed {
                payload,
                recipient: Some(addr()),
            },
            &caps_with_gso(),
        )
        .unwrap();

        assert_eq!(msg.payload().as_ptr(), ptr);
        assert_eq!(msg.recipient(), Some(addr()));
    }

    #[test]
    fn chained_buf_is_copied_contiguous() {
        let chained = Bytes::from_static(b"head").chain(Bytes::from_static(b"tail"));
        assert!(!is_contiguous(&chained));

        let msg = filter_outbound(OutboundMessage::Buffer(chained), &caps_with_gso()).unwrap();
        assert_eq!(&msg.payload()[..], b"headtail");
    }

    #[test]
    fn slice_payloads_are_accepted() {
        let msg = filter_outbound(
            OutboundMessage::Buffer(&b"borrowed"[..]),
            &caps_with_gso(),
        )
        .unwrap();
        assert_eq!(&msg.payload()[..], b"borrowed");
    }

    #[test]
    fn segmented_rejected_without_udp_segment() {
        let res = filter_outbound(
            OutboundMessage::Segmented {
                payload: Bytes::from_static(b"abc"),
                segment_size: 1,
                recipient: Some(addr()),
            },
            &Caps::none(),
        );
        assert!(matches!(res, Err(ChannelError::UnsupportedMessage(_))));
    }

    #[test]
    fn segmented_rejects_zero_segment_size() {
        let res = filter_outbound(
            OutboundMessage::Segmented {
                payload: Bytes::from_static(b"abc"),
                segment_size: 0,
                recipient: None,
            },
            &caps_with_gso(),
        );
        assert!(matches!(res, Err(ChannelError::UnsupportedMessage(_))));
    }

    #[test]
    fn segmented_preserves_size_and_recipient() {
        let chained = Bytes::from_static(b"aaaa").chain(Bytes::from_static(b"bbbb"));
        let msg = filter_outbound(
            OutboundMessage::Segmented {
                payload: chained,
                segment_size: 4,
                recipient: Some(addr()),
            },
            &caps_with_gso(),
        )
        .unwrap();

        assert_eq!(msg.segment_size(), Some(4));
        assert_eq!(msg.recipient(), Some(addr()));
        assert_eq!(&msg.payload()[..], b"aaaabbbb");
    }
}

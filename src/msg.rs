// Numan Thabit 2025
// msg.rs - outbound message shapes, inbound datagrams, GRO fan-out
use std::net::SocketAddr;

use bytes::Bytes;

/// Outbound message accepted by the write queue after filtering.
///
/// Payloads are reference-counted [`Bytes`]; the channel holds exactly one
/// reference from enqueue until the message is removed from the queue, on
/// success or failure alike.
#[derive(Debug, Clone)]
pub enum DatagramMessage {
    /// Bare payload sent to the connected peer.
    Buffer(Bytes),
    /// Payload with an explicit recipient. `recipient` may be `None` only on
    /// a connected channel.
    Addressed {
        /// Datagram payload.
        payload: Bytes,
        /// Destination, or `None` to use the connected peer.
        recipient: Option<SocketAddr>,
    },
    /// One large payload the kernel splits into `segment_size`-byte datagrams
    /// via UDP_SEGMENT. Only accepted when the platform advertises
    /// segmentation support.
    Segmented {
        /// Concatenation of equal-sized sub-datagrams.
        payload: Bytes,
        /// Size of each wire datagram. Always non-zero.
        segment_size: u16,
        /// Destination, or `None` to use the connected peer.
        recipient: Option<SocketAddr>,
    },
}

impl DatagramMessage {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload().len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }

    /// Borrow of the payload bytes.
    pub fn payload(&self) -> &Bytes {
        match self {
            DatagramMessage::Buffer(payload) => payload,
            DatagramMessage::Addressed { payload, .. } => payload,
            DatagramMessage::Segmented { payload, .. } => payload,
        }
    }

    /// Explicit recipient, when one was supplied.
    pub fn recipient(&self) -> Option<SocketAddr> {
        match self {
            DatagramMessage::Buffer(_) => None,
            DatagramMessage::Addressed { recipient, .. } => *recipient,
            DatagramMessage::Segmented { recipient, .. } => *recipient,
        }
    }

    /// UDP_SEGMENT size for segmented messages.
    pub fn segment_size(&self) -> Option<u16> {
        match self {
            DatagramMessage::Segmented { segment_size, .. } => Some(*segment_size),
            _ => None,
        }
    }
}

/// Inbound datagram delivered to the pipeline.
///
/// `segment_size` is set only when UDP_GRO coalesced several wire datagrams
/// into this payload; such a datagram is fanned out before delivery so
/// downstream handlers always observe one datagram per read event.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Received bytes.
    pub payload: Bytes,
    /// Peer the datagram came from. `None` on a connected socket read that
    /// could not resolve the peer address.
    pub sender: Option<SocketAddr>,
    /// Local address the datagram arrived on.
    pub recipient: Option<SocketAddr>,
    /// Kernel-reported gso_size when UDP_GRO fired.
    pub segment_size: Option<u16>,
}

impl Datagram {
    /// True when this datagram is a GRO-coalesced container.
    pub fn is_segmented(&self) -> bool {
        self.segment_size.is_some()
    }

    /// Splits a GRO container into ordinary datagrams, one per wire segment,
    /// preserving order and addressing. Non-segmented datagrams are pushed
    /// through unchanged. Slices are retained views into the original
    /// allocation; no payload bytes are copied.
    pub fn fan_out(mut self, out: &mut Vec<Datagram>) {
        let segment = match self.segment_size.take() {
            Some(size) => usize::from(size).max(1),
            None => {
                out.push(self);
                return;
            }
        };

        while !self.payload.is_empty() {
            let take = self.payload.len().min(segment);
            let chunk = self.payload.split_to(take);
            out.push(Datagram {
                payload: chunk,
                sender: self.sender,
                recipient: self.recipient,
                segment_size: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn segmented(total: usize, gso: u16) -> Datagram {
        Datagram {
            payload: Bytes::from(vec![0xabu8; total]),
            sender: Some(addr(9000)),
            recipient: Some(addr(9001)),
            segment_size: Some(gso),
        }
    }

    #[test]
    fn fan_out_splits_exact_multiples() {
        let mut out = Vec::new();
        segmented(1500, 500).fan_out(&mut out);

        assert_eq!(out.len(), 3);
        for pkt in &out {
            assert_eq!(pkt.payload.len(), 500);
            assert_eq!(pkt.sender, Some(addr(9000)));
            assert_eq!(pkt.recipient, Some(addr(9001)));
            assert!(pkt.segment_size.is_none());
        }
    }

    #[test]
    fn fan_out_keeps_short_tail() {
        let mut out = Vec::new();
        segmented(1200, 500).fan_out(&mut out);

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].payload.len(), 500);
        assert_eq!(out[1].payload.len(), 500);
        assert_eq!(out[2].payload.len(), 200);
    }

    #[test]
    fn fan_out_is_zero_copy() {
        let payload = Bytes::from(vec![7u8; 1000]);
        let base = payload.as_ptr() as usize;
        let mut out = Vec::new();
        Datagram {
            payload,
            sender: None,
            recipient: None,
            segment_size: Some(250),
        }
        .fan_out(&mut out);

        assert_eq!(out.len(), 4);
        for (i, pkt) in out.iter().enumerate() {
            assert_eq!(pkt.payload.as_ptr() as usize, base + i * 250);
        }
    }

    #[test]
    fn fan_out_passes_plain_datagrams_through() {
        let mut out = Vec::new();
        Datagram {
            payload: Bytes::from_static(b"plain"),
            sender: Some(addr(1)),
            recipient: None,
            segment_size: None,
        }
        .fan_out(&mut out);

        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].payload[..], b"plain");
    }

    #[test]
    fn fan_out_preserves_order() {
        let mut bytes = Vec::new();
        for seg in 0u8..4 {
            bytes.extend(std::iter::repeat(seg).take(100));
        }
        let mut out = Vec::new();
        Datagram {
            payload: Bytes::from(bytes),
            sender: None,
            recipient: None,
            segment_size: Some(100),
        }
        .fan_out(&mut out);

        assert_eq!(out.len(), 4);
        for (i, pkt) in out.iter().enumerate() {
            assert!(pkt.payload.iter().all(|b| *b == i as u8));
        }
    }
}

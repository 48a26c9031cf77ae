use bytes::Bytes;

/// Largest datagram the loop reads or writes in one go.
///
/// The receive buffer is sized to this, and RTP payload assembly refuses
/// slices that would not fit a single datagram.
pub const MTU: usize = 1500;

/// An owned, immutable outbound datagram.
///
/// Construction fixes the contents; afterwards the packet is only moved
/// (producer thread → send queue → loop thread → `sendto`). Backed by
/// [`Bytes`], so cloning for multi-destination fan-out is O(1).
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
}

impl Packet {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Bytes> for Packet {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self::new(Bytes::from(data))
    }
}

impl From<&'static [u8]> for Packet {
    fn from(data: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_from_vec() {
        let p = Packet::from(vec![1u8, 2, 3]);
        assert_eq!(p.len(), 3);
        assert_eq!(p.data(), &[1, 2, 3]);
        assert!(!p.is_empty());
    }

    #[test]
    fn test_packet_clone_is_cheap() {
        let p = Packet::from(vec![0u8; 1024]);
        let q = p.clone();
        // Bytes-backed clones share the same allocation
        assert_eq!(p.data().as_ptr(), q.data().as_ptr());
    }
}

//! The per-session protocol layer stack.
//!
//! Layers live in a plain vector, index 0 at the socket end; neighbour
//! lookup is index arithmetic, so there are no cyclic back-pointers.
//! Outbound traffic is assembled in an [`IOBuffer`] whose prefix reserves
//! exactly the header bytes of every layer below the owner; `seal` fills
//! those regions in place, top-down. Inbound bytes are posted upward, each
//! layer consuming its own framing until the receive-terminal layer keeps
//! the result.

use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ByteOrder};

/// Upper bound on a single inbound frame. Command traffic is line-sized;
/// anything beyond this is a corrupt length field.
pub const MAX_INBOUND_FRAME: usize = 16 * 1024;

pub trait Layer {
    fn name(&self) -> &'static str;

    /// Fixed number of header bytes this layer contributes to every
    /// buffer passing through it on the way down.
    fn header_len(&self) -> usize {
        0
    }

    /// Fills this layer's reserved prefix region for a payload of
    /// `payload_len` bytes (everything above this layer's header).
    fn fill_header(&self, payload_len: usize, header: &mut [u8]) {
        let _ = payload_len;
        debug_assert!(header.is_empty());
    }

    /// Consumes inbound bytes, posting complete units into `up`. Returns
    /// the number of bytes consumed; the caller keeps the residue and
    /// re-presents it on the next receive.
    fn receive(&mut self, data: &[u8], up: &mut Vec<Vec<u8>>) -> NetworkResult<usize>;

    /// A receive-terminal layer is the last consumer of inbound units.
    fn recv_terminal(&self) -> bool {
        false
    }
}

/// Outbound byte assembly unit. Created by its owning layer with the
/// prefix already reserved; the owner appends payload behind it.
pub struct IOBuffer {
    data: Vec<u8>,
    prefix_len: usize,
    owner: usize,
}

impl IOBuffer {
    fn with_prefix(prefix_len: usize, owner: usize) -> IOBuffer {
        IOBuffer {
            data: vec![0u8; prefix_len],
            prefix_len,
            owner,
        }
    }

    #[inline]
    pub fn owner(&self) -> usize {
        self.owner
    }

    #[inline]
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    #[inline]
    pub fn append_u32(&mut self, value: u32) {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.append(&buf);
    }

    /// The owner's payload, behind the reserved prefix.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.prefix_len..]
    }

    /// The complete wire image. Meaningful after `LayerStack::seal`.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

pub struct LayerStack {
    layers: Vec<Box<dyn Layer>>,
}

impl LayerStack {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> LayerStack {
        LayerStack { layers }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Sum of the header lengths of all layers strictly below `owner`.
    pub fn prefix_len(&self, owner: usize) -> usize {
        self.layers[..owner].iter().map(|l| l.header_len()).sum()
    }

    /// Creates an outbound buffer owned by the layer at `owner`, with the
    /// prefix for all lower layers reserved.
    pub fn new_buffer(&self, owner: usize) -> IOBuffer {
        IOBuffer::with_prefix(self.prefix_len(owner), owner)
    }

    /// Fills every reserved header region in place, top-down, leaving the
    /// buffer ready for the socket queue.
    pub fn seal(&self, buf: &mut IOBuffer) {
        debug_assert_eq!(buf.prefix_len, self.prefix_len(buf.owner));

        let mut start = buf.prefix_len;

        for layer in self.layers[..buf.owner].iter().rev() {
            let header_len = layer.header_len();
            start -= header_len;

            let payload_len = buf.data.len() - start - header_len;
            layer.fill_header(payload_len, &mut buf.data[start..start + header_len]);
        }

        debug_assert_eq!(start, 0);
    }

    /// Posts inbound bytes up the stack starting above the socket layer.
    /// Complete terminal units land in `out`; the return value is the
    /// number of wire bytes consumed.
    pub fn receive(&mut self, data: &[u8], out: &mut Vec<Vec<u8>>) -> NetworkResult<usize> {
        let mut units: Vec<Vec<u8>> = Vec::new();
        let mut consumed = data.len();

        let mut first = true;

        for layer in self.layers.iter_mut().skip(1) {
            let mut up = Vec::new();

            if first {
                consumed = layer.receive(data, &mut up)?;
                first = false;
            } else {
                for unit in units.drain(..) {
                    let n = layer.receive(&unit, &mut up)?;
                    debug_assert_eq!(n, unit.len(), "upper layers consume whole units");
                }
            }

            if layer.recv_terminal() {
                out.append(&mut up);
                return Ok(consumed);
            }

            units = up;
        }

        // No terminal layer above the socket: the remaining units are the
        // result (degenerate stacks in tests).
        out.append(&mut units);
        Ok(consumed)
    }
}

/// Bottom of every stack. Contributes no header; inbound bytes pass
/// straight up. The actual socket I/O is driven by the owning task.
pub struct SocketLayer;

impl Layer for SocketLayer {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn receive(&mut self, data: &[u8], up: &mut Vec<Vec<u8>>) -> NetworkResult<usize> {
        up.push(data.to_vec());
        Ok(data.len())
    }
}

/// Length-prefixed packet framing: 4-byte big-endian length, then payload.
pub struct PacketLayer;

impl Layer for PacketLayer {
    fn name(&self) -> &'static str {
        "packet"
    }

    fn header_len(&self) -> usize {
        4
    }

    fn fill_header(&self, payload_len: usize, header: &mut [u8]) {
        BigEndian::write_u32(header, payload_len as u32);
    }

    /// Consumes whole `4 + N` frames only; a frame still missing bytes is
    /// left untouched so it is re-presented once more data arrived.
    fn receive(&mut self, data: &[u8], up: &mut Vec<Vec<u8>>) -> NetworkResult<usize> {
        let mut processed = 0;

        while data.len() - processed >= 4 {
            let frame_len = BigEndian::read_u32(&data[processed..processed + 4]) as usize;

            if frame_len > MAX_INBOUND_FRAME {
                return Err(NetworkError::Fatal(ErrorType::BadFrame));
            }

            if data.len() - processed - 4 < frame_len {
                break;
            }

            up.push(data[processed + 4..processed + 4 + frame_len].to_vec());
            processed += 4 + frame_len;
        }

        Ok(processed)
    }
}

/// Receive-terminal command processing layer. Frames surface here whole;
/// interpreting the channel identifier and verbs is the session's command
/// machinery, which also owns the error replies for malformed ones.
pub struct ProcessLayer;

impl Layer for ProcessLayer {
    fn name(&self) -> &'static str {
        "process"
    }

    fn recv_terminal(&self) -> bool {
        true
    }

    fn receive(&mut self, data: &[u8], up: &mut Vec<Vec<u8>>) -> NetworkResult<usize> {
        up.push(data.to_vec());
        Ok(data.len())
    }
}

/// The stack every session runs: socket, packet framing, command
/// processing.
pub fn session_stack() -> LayerStack {
    LayerStack::new(vec![
        Box::new(SocketLayer),
        Box::new(PacketLayer),
        Box::new(ProcessLayer),
    ])
}

/// Stack index of the command processing layer, the owner of every reply
/// and data frame a session emits.
pub const PROCESS_LAYER: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;

    /// Header is the layer's tag byte repeated, for checking fill order.
    struct TagLayer {
        tag: u8,
        len: usize,
    }

    impl Layer for TagLayer {
        fn name(&self) -> &'static str {
            "tag"
        }

        fn header_len(&self) -> usize {
            self.len
        }

        fn fill_header(&self, payload_len: usize, header: &mut [u8]) {
            for byte in header.iter_mut() {
                *byte = self.tag;
            }
            // Encode the payload length in the first byte so tests can
            // check each layer saw the right span.
            if !header.is_empty() {
                header[0] = payload_len as u8;
            }
        }

        fn receive(&mut self, data: &[u8], up: &mut Vec<Vec<u8>>) -> NetworkResult<usize> {
            up.push(data.to_vec());
            Ok(data.len())
        }
    }

    #[test]
    fn test_prefix_reservation_equals_lower_header_sum() {
        let stack = LayerStack::new(vec![
            Box::new(TagLayer { tag: 0xa0, len: 3 }),
            Box::new(TagLayer { tag: 0xb0, len: 4 }),
            Box::new(TagLayer { tag: 0xc0, len: 0 }),
        ]);

        assert_eq!(stack.prefix_len(0), 0);
        assert_eq!(stack.prefix_len(1), 3);
        assert_eq!(stack.prefix_len(2), 7);

        let buf = stack.new_buffer(2);
        assert_eq!(buf.prefix_len(), 7);
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn test_seal_fills_headers_in_stack_order() {
        let stack = LayerStack::new(vec![
            Box::new(TagLayer { tag: 0xa0, len: 3 }),
            Box::new(TagLayer { tag: 0xb0, len: 4 }),
            Box::new(TagLayer { tag: 0xc0, len: 0 }),
        ]);

        let mut buf = stack.new_buffer(2);
        buf.append(b"payload");
        stack.seal(&mut buf);

        let bytes = buf.as_bytes();

        // Bottom layer header first on the wire: 3 bytes of 0xa0 (first
        // byte the length of everything above it: 4 + 7), then 4 bytes of
        // 0xb0 (first byte 7), then the payload.
        assert_eq!(bytes[0], 11);
        assert_eq!(&bytes[1..3], &[0xa0, 0xa0]);
        assert_eq!(bytes[3], 7);
        assert_eq!(&bytes[4..7], &[0xb0, 0xb0, 0xb0]);
        assert_eq!(&bytes[7..], b"payload");
    }

    #[test]
    fn test_packet_layer_frames_payload() {
        let stack = session_stack();

        let mut buf = stack.new_buffer(PROCESS_LAYER);
        buf.append_u32(0);
        buf.append(b"+OK hello\n");
        stack.seal(&mut buf);

        let bytes = buf.as_bytes();
        assert_eq!(&bytes[..4], &[0, 0, 0, 14]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..], b"+OK hello\n");
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut wire = vec![0u8; 4];
        BigEndian::write_u32(&mut wire, payload.len() as u32);
        wire.extend_from_slice(payload);
        wire
    }

    #[test]
    fn test_packet_receive_whole_frames_only() {
        let mut layer = PacketLayer;

        let mut wire = frame(b"\x00\x00\x00\x00QUIT\n");
        wire.extend_from_slice(&frame(b"\x00\x00\x00\x00PING\n"));

        // Hold back the last byte: the second frame must not be consumed.
        let mut up = Vec::new();
        let consumed = layer.receive(&wire[..wire.len() - 1], &mut up).unwrap();

        assert_eq!(consumed, 13);
        assert_eq!(up.len(), 1);
        assert_eq!(up[0], b"\x00\x00\x00\x00QUIT\n".to_vec());

        // Residue (including the final byte) completes the second frame.
        let mut up = Vec::new();
        let consumed = layer.receive(&wire[13..], &mut up).unwrap();

        assert_eq!(consumed, 13);
        assert_eq!(up[0], b"\x00\x00\x00\x00PING\n".to_vec());
    }

    #[test]
    fn test_packet_receive_residue_below_header() {
        let mut layer = PacketLayer;
        let mut up = Vec::new();

        assert_eq!(layer.receive(&[0, 0], &mut up).unwrap(), 0);
        assert!(up.is_empty());
    }

    #[test]
    fn test_packet_receive_rejects_corrupt_length() {
        let mut layer = PacketLayer;
        let mut up = Vec::new();

        let result = layer.receive(&[0xff, 0xff, 0xff, 0xff], &mut up);
        assert_eq!(result, Err(NetworkError::Fatal(ErrorType::BadFrame)));
    }

    #[test]
    fn test_full_stack_receive() {
        let mut stack = session_stack();

        let mut wire = frame(b"\x00\x00\x00\x00CAPABILITIES\n");
        wire.extend_from_slice(&frame(b"\x00\x00\x00\x01x"));
        wire.extend_from_slice(&[0, 0]); // partial next header

        let mut out = Vec::new();
        let consumed = stack.receive(&wire, &mut out).unwrap();

        assert_eq!(consumed, wire.len() - 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], b"\x00\x00\x00\x00CAPABILITIES\n".to_vec());
        assert_eq!(out[1], b"\x00\x00\x00\x01x".to_vec());
    }

    #[test]
    fn test_process_layer_passes_short_frames_to_the_session() {
        let mut stack = session_stack();
        let wire = frame(b"ab");

        let mut out = Vec::new();
        let consumed = stack.receive(&wire, &mut out).unwrap();

        assert_eq!(consumed, wire.len());
        assert_eq!(out, vec![b"ab".to_vec()]);
    }
}

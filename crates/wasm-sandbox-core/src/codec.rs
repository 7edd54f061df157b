//! Wire formats exchanged across the host/guest memory boundary.
//!
//! Two layouts are used:
//!
//! - **String array**: `u32le count`, then per field `u32le byte length`
//!   followed by the raw UTF-8 bytes. No padding, no terminator. Event
//!   records are encoded as the array `[connection_id, room_id, timestamp,
//!   payload...]` and decoded by position on the guest side.
//! - **Guest string**: a managed object whose header holds
//!   `[type_id u32][length in UTF-16 code units u32]`, followed by the
//!   UTF-16LE code units.
//!
//! The codec never touches Wasmtime directly; it works against the
//! [`GuestMemory`] and [`GuestHeap`] traits. `InstanceHeap` is the Wasmtime
//! implementation.

use std::fmt;

use async_trait::async_trait;

use wasm_sandbox_common::{CodecError, EventRecord};

/// Runtime type id of managed strings.
pub const STRING_TYPE_ID: u32 = 2;

/// Runtime type id of raw buffers.
pub const BUFFER_TYPE_ID: u32 = 0;

/// Size of the managed object header preceding an allocation.
pub const HEADER_SIZE: u32 = 8;

/// Returned by [`decode_guest_string_lossy`] when the string cannot be read.
pub const READ_FAILED: &str = "<failed to read string>";

/// Byte-addressed view of a guest's linear memory.
pub trait GuestMemory {
    /// Copy `len` bytes starting at `offset` out of guest memory.
    fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>, CodecError>;

    /// Copy `bytes` into guest memory at `offset`.
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), CodecError>;
}

/// Guest memory with access to the guest's exported allocator.
#[async_trait]
pub trait GuestHeap: GuestMemory + Send {
    /// Allocate `size` bytes tagged with `type_id`, returning the payload pointer.
    async fn alloc(&mut self, size: u32, type_id: u32) -> Result<u32, CodecError>;
}

/// A region written into guest memory, as passed to guest exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSlice {
    /// Payload pointer returned by the allocator.
    pub ptr: u32,
    /// Payload length in bytes.
    pub len: u32,
}

impl GuestSlice {
    /// Address of the managed object header.
    pub fn header(self) -> u32 {
        self.ptr.saturating_sub(HEADER_SIZE)
    }
}

/// Outcome marker for strings handed back to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Error,
}

impl Status {
    /// Leading UTF-16 code unit used when status prefixes are enabled.
    pub const fn marker(self) -> [u8; 2] {
        match self {
            Self::Success => [b'+', 0],
            Self::Error => [b'-', 0],
        }
    }
}

/// Encode fields as a length-prefixed string array.
pub fn encode_string_array<S: AsRef<str>>(fields: &[S]) -> Result<Vec<u8>, CodecError> {
    let body: usize = fields.iter().map(|f| 4 + f.as_ref().len()).sum();
    let mut buf = Vec::with_capacity(4 + body);

    buf.extend_from_slice(&to_u32(fields.len())?.to_le_bytes());
    for field in fields {
        let bytes = field.as_ref().as_bytes();
        buf.extend_from_slice(&to_u32(bytes.len())?.to_le_bytes());
        buf.extend_from_slice(bytes);
    }

    Ok(buf)
}

/// Decode a length-prefixed string array.
pub fn decode_string_array(bytes: &[u8]) -> Result<Vec<String>, CodecError> {
    let mut cursor = 0_usize;
    let count = read_u32(bytes, &mut cursor)?;

    // Every field needs at least its 4-byte length
    let mut fields = Vec::with_capacity((count as usize).min(bytes.len() / 4));
    for _ in 0..count {
        let len = read_u32(bytes, &mut cursor)? as usize;
        let end = cursor.checked_add(len).ok_or(CodecError::TooLarge { len })?;
        let raw = bytes.get(cursor..end).ok_or(CodecError::Truncated {
            needed: end,
            available: bytes.len(),
        })?;
        fields.push(String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)?);
        cursor = end;
    }

    Ok(fields)
}

/// Encode an event record in guest field order.
pub fn encode_event<K>(record: &EventRecord<K>) -> Result<Vec<u8>, CodecError> {
    encode_string_array(&record.wire_fields())
}

/// Encode text as UTF-16LE.
pub fn encode_utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decode UTF-16LE bytes.
pub fn decode_utf16(bytes: &[u8]) -> Result<String, CodecError> {
    let chunks = bytes.chunks_exact(2);
    if !chunks.remainder().is_empty() {
        return Err(CodecError::InvalidUtf16);
    }
    let units: Vec<u16> = chunks.map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16(&units).map_err(|_| CodecError::InvalidUtf16)
}

/// Read a managed guest string whose header starts at `ptr`.
///
/// The UTF-16 code unit count is stored at `ptr + 4` and the code units
/// start at `ptr + 8`.
pub fn decode_guest_string<M>(memory: &M, ptr: u32) -> Result<String, CodecError>
where
    M: GuestMemory + ?Sized,
{
    let count_at = ptr.checked_add(4).ok_or(CodecError::out_of_bounds(ptr, 4))?;
    let raw = memory.read(count_at, 4)?;
    let count = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);

    let byte_len = count.checked_mul(2).ok_or(CodecError::TooLarge {
        len: count as usize,
    })?;
    let data_at = ptr
        .checked_add(HEADER_SIZE)
        .ok_or(CodecError::out_of_bounds(ptr, HEADER_SIZE))?;

    decode_utf16(&memory.read(data_at, byte_len)?)
}

/// Read a managed guest string, substituting [`READ_FAILED`] on any error.
///
/// Only for diagnostic paths that cannot report errors, such as `abort`.
pub fn decode_guest_string_lossy<M>(memory: &M, ptr: u32) -> String
where
    M: GuestMemory + ?Sized,
{
    decode_guest_string(memory, ptr).unwrap_or_else(|_| READ_FAILED.to_string())
}

/// Read a raw guest byte range as UTF-8 text.
pub fn read_utf8<M>(memory: &M, ptr: u32, len: u32) -> Result<String, CodecError>
where
    M: GuestMemory + ?Sized,
{
    String::from_utf8(memory.read(ptr, len)?).map_err(|_| CodecError::InvalidUtf8)
}

/// Allocate a guest object and copy `bytes` into it.
pub async fn write_bytes<H>(heap: &mut H, bytes: &[u8], type_id: u32) -> Result<GuestSlice, CodecError>
where
    H: GuestHeap + ?Sized,
{
    let len = to_u32(bytes.len())?;
    let ptr = heap.alloc(len, type_id).await?;
    heap.write(ptr, bytes)?;
    Ok(GuestSlice { ptr, len })
}

/// Write `text` into guest memory as a managed string.
///
/// With `status_prefix` set, the string starts with a `+` or `-` code unit
/// matching `status`.
pub async fn write_guest_string<H>(
    heap: &mut H,
    text: &str,
    status: Status,
    status_prefix: bool,
) -> Result<GuestSlice, CodecError>
where
    H: GuestHeap + ?Sized,
{
    let mut data = Vec::with_capacity(2 + text.len() * 2);
    if status_prefix {
        data.extend_from_slice(&status.marker());
    }
    data.extend(encode_utf16(text));

    write_bytes(heap, &data, STRING_TYPE_ID).await
}

/// Write an error's message into guest memory as a managed string.
pub async fn write_guest_error<H>(
    heap: &mut H,
    error: &(dyn fmt::Display + Sync),
    status_prefix: bool,
) -> Result<GuestSlice, CodecError>
where
    H: GuestHeap + ?Sized,
{
    let message = error.to_string();
    write_guest_string(heap, &message, Status::Error, status_prefix).await
}

/// Write a string array into guest memory as a raw buffer.
pub async fn write_string_array<H, S>(
    heap: &mut H,
    fields: &[S],
    status_prefix: bool,
) -> Result<GuestSlice, CodecError>
where
    H: GuestHeap + ?Sized,
    S: AsRef<str> + Sync,
{
    let encoded = encode_string_array(fields)?;
    let data = if status_prefix {
        let mut data = Vec::with_capacity(2 + encoded.len());
        data.extend_from_slice(&Status::Success.marker());
        data.extend(encoded);
        data
    } else {
        encoded
    };

    write_bytes(heap, &data, BUFFER_TYPE_ID).await
}

fn to_u32(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge { len })
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, CodecError> {
    let end = *cursor + 4;
    let raw = bytes.get(*cursor..end).ok_or(CodecError::Truncated {
        needed: end,
        available: bytes.len(),
    })?;
    *cursor = end;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_sandbox_common::GuestEvent;

    /// Bump allocator over a plain byte vector that writes guest-style headers.
    struct VecHeap {
        memory: Vec<u8>,
        next: u32,
    }

    impl VecHeap {
        fn new(size: usize) -> Self {
            Self {
                memory: vec![0; size],
                next: 16,
            }
        }
    }

    impl GuestMemory for VecHeap {
        fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>, CodecError> {
            let start = offset as usize;
            self.memory
                .get(start..start + len as usize)
                .map(<[u8]>::to_vec)
                .ok_or(CodecError::out_of_bounds(offset, len))
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), CodecError> {
            let start = offset as usize;
            let len = bytes.len();
            self.memory
                .get_mut(start..start + len)
                .ok_or(CodecError::out_of_bounds(offset, len as u32))?
                .copy_from_slice(bytes);
            Ok(())
        }
    }

    #[async_trait]
    impl GuestHeap for VecHeap {
        async fn alloc(&mut self, size: u32, type_id: u32) -> Result<u32, CodecError> {
            let header = self.next;
            let ptr = header + HEADER_SIZE;
            if (ptr + size) as usize > self.memory.len() {
                return Err(CodecError::AllocationFailed {
                    reason: "heap exhausted".into(),
                });
            }
            self.write(header, &type_id.to_le_bytes())?;
            self.write(header + 4, &(size / 2).to_le_bytes())?;
            self.next = (ptr + size + 3) & !3;
            Ok(ptr)
        }
    }

    #[test]
    fn test_string_array_layout() {
        let encoded = encode_string_array(&["a", "bb"]).unwrap();
        assert_eq!(
            encoded,
            vec![2, 0, 0, 0, 1, 0, 0, 0, b'a', 2, 0, 0, 0, b'b', b'b']
        );
    }

    #[test]
    fn test_string_array_round_trip() {
        let cases: [&[&str]; 3] = [&[], &["a"], &["a", "bb", "ccc"]];
        for case in cases {
            let encoded = encode_string_array(case).unwrap();
            assert_eq!(decode_string_array(&encoded).unwrap(), case);
        }
    }

    #[test]
    fn test_decode_truncated_array() {
        let mut encoded = encode_string_array(&["hello"]).unwrap();
        encoded.truncate(encoded.len() - 2);

        assert!(matches!(
            decode_string_array(&encoded),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(
            decode_string_array(&[1, 0]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_encode_event_field_order() {
        let record = EventRecord::new(
            "conn-1",
            "room-1",
            "mod-a",
            GuestEvent::OnMessage,
            vec!["hello, world!".into()],
        )
        .with_timestamp(1_234);

        let decoded = decode_string_array(&encode_event(&record).unwrap()).unwrap();
        assert_eq!(decoded, vec!["conn-1", "room-1", "1234", "hello, world!"]);
    }

    #[test]
    fn test_utf16_multibyte() {
        let text = "héllo 🌍";
        let encoded = encode_utf16(text);
        // 'é' is one code unit, the emoji is a surrogate pair
        assert_eq!(encoded.len(), 2 * 8);
        assert_eq!(decode_utf16(&encoded).unwrap(), text);

        assert_eq!(decode_utf16(&[0x00]), Err(CodecError::InvalidUtf16));
        // Lone high surrogate
        assert_eq!(decode_utf16(&[0x3d, 0xd8]), Err(CodecError::InvalidUtf16));
    }

    #[test]
    fn test_guest_string_round_trip() {
        for text in ["", "hello", "héllo wörld", "日本語 🌍🚀"] {
            let mut heap = VecHeap::new(1024);
            let slice = tokio_test::block_on(write_guest_string(
                &mut heap,
                text,
                Status::Success,
                false,
            ))
            .unwrap();

            assert_eq!(slice.len as usize, encode_utf16(text).len());
            assert_eq!(decode_guest_string(&heap, slice.header()).unwrap(), text);
        }
    }

    #[test]
    fn test_guest_string_header() {
        let mut heap = VecHeap::new(256);
        let slice =
            tokio_test::block_on(write_guest_string(&mut heap, "abc", Status::Success, false))
                .unwrap();

        let header = heap.read(slice.header(), 8).unwrap();
        assert_eq!(&header[0..4], &STRING_TYPE_ID.to_le_bytes());
        assert_eq!(&header[4..8], &3_u32.to_le_bytes());
    }

    #[test]
    fn test_status_prefix() {
        let mut heap = VecHeap::new(256);
        let slice = tokio_test::block_on(write_guest_error(&mut heap, &"boom", true)).unwrap();

        let data = heap.read(slice.ptr, slice.len).unwrap();
        assert_eq!(&data[0..2], &[b'-', 0]);
        assert_eq!(decode_utf16(&data[2..]).unwrap(), "boom");

        let slice =
            tokio_test::block_on(write_guest_string(&mut heap, "ok", Status::Success, true))
                .unwrap();
        let data = heap.read(slice.ptr, slice.len).unwrap();
        assert_eq!(&data[0..2], &[b'+', 0]);
    }

    #[test]
    fn test_decode_guest_string_out_of_bounds() {
        let heap = VecHeap::new(64);

        assert!(matches!(
            decode_guest_string(&heap, 1_000),
            Err(CodecError::OutOfBounds { .. })
        ));
        assert_eq!(decode_guest_string_lossy(&heap, 1_000), READ_FAILED);
    }

    #[test]
    fn test_decode_guest_string_declared_length_too_long() {
        let mut heap = VecHeap::new(64);
        // Header claims 100 code units at the start of a 64 byte memory
        heap.write(4, &100_u32.to_le_bytes()).unwrap();

        assert!(matches!(
            decode_guest_string(&heap, 0),
            Err(CodecError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_write_string_array() {
        let mut heap = VecHeap::new(256);
        let users = vec!["billy".to_string(), "bob".to_string()];
        let slice = tokio_test::block_on(write_string_array(&mut heap, &users, false)).unwrap();

        let data = heap.read(slice.ptr, slice.len).unwrap();
        assert_eq!(decode_string_array(&data).unwrap(), users);

        let header = heap.read(slice.header(), 4).unwrap();
        assert_eq!(header, BUFFER_TYPE_ID.to_le_bytes());
    }

    #[test]
    fn test_allocation_failure() {
        let mut heap = VecHeap::new(32);
        let result = tokio_test::block_on(write_bytes(&mut heap, &[0; 64], BUFFER_TYPE_ID));

        assert!(matches!(result, Err(CodecError::AllocationFailed { .. })));
    }

    #[test]
    fn test_read_utf8() {
        let mut heap = VecHeap::new(64);
        heap.write(10, b"hello").unwrap();
        heap.write(20, &[0xff, 0xfe]).unwrap();

        assert_eq!(read_utf8(&heap, 10, 5).unwrap(), "hello");
        assert_eq!(read_utf8(&heap, 20, 2), Err(CodecError::InvalidUtf8));
        assert!(read_utf8(&heap, 60, 10).is_err());
    }
}

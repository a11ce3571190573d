//! Cursor-based binary (de)serialization over a segment payload.
//!
//! All values are little-endian. Strings are a u16 byte length followed by
//! UTF-8 bytes. Vectors and quaternions are consecutive f32 components.
//!
//! Writing past the segment capacity is a programmer error and panics,
//! unless the encoder was made with [`BinaryEncoder::checked`]. Reading
//! works on remote input, so it returns [`CodecError`] instead.

use glam::{Quat, Vec2, Vec3, Vec4};

use super::segment::Segment;
use crate::core::CodecError;

macro_rules! write_le {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Write a `", stringify!($ty), "`.")]
            pub fn $name(&mut self, value: $ty) -> &mut Self {
                self.put(&value.to_le_bytes());
                self
            }
        )*
    };
}

macro_rules! read_le {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Read a `", stringify!($ty), "`.")]
            pub fn $name(&mut self) -> Result<$ty, CodecError> {
                let bytes = self.take(std::mem::size_of::<$ty>())?;
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }
        )*
    };
}

/// Appends values at the end of a segment's payload.
///
/// # Example
///
/// ```
/// use tether_net::segment::{BinaryDecoder, BinaryEncoder, SegmentPool};
///
/// let pool = SegmentPool::new(1);
/// let mut segment = pool.request_free_segment().unwrap();
/// BinaryEncoder::new(&mut segment).write_u16(7).write_string("lobby");
///
/// let mut decoder = BinaryDecoder::new(&segment);
/// assert_eq!(decoder.read_u16().unwrap(), 7);
/// assert_eq!(decoder.read_string().unwrap(), "lobby");
/// ```
pub struct BinaryEncoder<'a> {
    segment: &'a mut Segment,
    checked: bool,
    overflowed: bool,
}

impl<'a> BinaryEncoder<'a> {
    /// Start writing at the segment's current length.
    pub fn new(segment: &'a mut Segment) -> Self {
        Self {
            segment,
            checked: false,
            overflowed: false,
        }
    }

    /// Like [`new`](Self::new), but a write that does not fit is skipped
    /// and marks the encoder [`overflowed`](Self::overflowed). Every write
    /// after that is skipped too.
    pub fn checked(segment: &'a mut Segment) -> Self {
        Self {
            segment,
            checked: true,
            overflowed: false,
        }
    }

    /// Whether a checked write did not fit.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Bytes still writable.
    pub fn remaining(&self) -> usize {
        self.segment.remaining()
    }

    fn fits(&mut self, count: usize) -> bool {
        if self.checked && (self.overflowed || count > self.segment.remaining()) {
            self.overflowed = true;
            return false;
        }
        true
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.fits(bytes.len()) {
            self.segment.write(bytes);
        }
    }

    write_le! {
        write_u8: u8,
        write_i8: i8,
        write_u16: u16,
        write_i16: i16,
        write_u32: u32,
        write_i32: i32,
        write_u64: u64,
        write_i64: i64,
        write_f32: f32,
        write_f64: f64,
    }

    /// Write a bool as one byte.
    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(u8::from(value))
    }

    /// Write a length-prefixed string.
    ///
    /// # Panics
    ///
    /// Panics if the string is longer than `u16::MAX` bytes or does not fit.
    /// A checked encoder skips it instead.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        if !self.fits(2 + value.len()) {
            return self;
        }
        let len = u16::try_from(value.len()).unwrap_or_else(|_| {
            panic!("string of {} bytes exceeds u16 length prefix", value.len())
        });
        self.segment.write(&len.to_le_bytes());
        self.segment.write(value.as_bytes());
        self
    }

    /// Write raw bytes without a length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.put(bytes);
        self
    }

    /// Write a 2-component vector.
    pub fn write_vec2(&mut self, value: Vec2) -> &mut Self {
        self.write_f32(value.x).write_f32(value.y)
    }

    /// Write a 3-component vector.
    pub fn write_vec3(&mut self, value: Vec3) -> &mut Self {
        self.write_f32(value.x).write_f32(value.y).write_f32(value.z)
    }

    /// Write a 4-component vector.
    pub fn write_vec4(&mut self, value: Vec4) -> &mut Self {
        self.write_f32(value.x)
            .write_f32(value.y)
            .write_f32(value.z)
            .write_f32(value.w)
    }

    /// Write a quaternion as x, y, z, w.
    pub fn write_quat(&mut self, value: Quat) -> &mut Self {
        self.write_vec4(Vec4::from(value))
    }

    /// Bytes written to the segment so far.
    pub fn len(&self) -> usize {
        self.segment.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.segment.is_empty()
    }
}

/// Reads values from a segment's payload with its own cursor.
pub struct BinaryDecoder<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl<'a> BinaryDecoder<'a> {
    /// Start reading at the beginning of the payload.
    pub fn new(segment: &'a Segment) -> Self {
        Self::from_bytes(segment.buffer())
    }

    /// Read from a slice of a payload, such as trailing hook fields.
    pub fn from_bytes(payload: &'a [u8]) -> Self {
        Self { payload, cursor: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        let payload = self.payload;
        let remaining = payload.len() - self.cursor;
        if count > remaining {
            return Err(CodecError::EndOfSegment {
                needed: count,
                remaining,
            });
        }
        let bytes = &payload[self.cursor..self.cursor + count];
        self.cursor += count;
        Ok(bytes)
    }

    read_le! {
        read_u8: u8,
        read_i8: i8,
        read_u16: u16,
        read_i16: i16,
        read_u32: u32,
        read_i32: i32,
        read_u64: u64,
        read_i64: i64,
        read_f32: f32,
        read_f64: f64,
    }

    /// Read a bool. Any nonzero byte is `true`.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a length-prefixed string without copying.
    pub fn read_str(&mut self) -> Result<&'a str, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a length-prefixed string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        self.read_str().map(str::to_owned)
    }

    /// Read `count` raw bytes.
    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], CodecError> {
        self.take(count)
    }

    /// Read a 2-component vector.
    pub fn read_vec2(&mut self) -> Result<Vec2, CodecError> {
        Ok(Vec2::new(self.read_f32()?, self.read_f32()?))
    }

    /// Read a 3-component vector.
    pub fn read_vec3(&mut self) -> Result<Vec3, CodecError> {
        Ok(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    /// Read a 4-component vector.
    pub fn read_vec4(&mut self) -> Result<Vec4, CodecError> {
        Ok(Vec4::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }

    /// Read a quaternion written as x, y, z, w.
    pub fn read_quat(&mut self) -> Result<Quat, CodecError> {
        Ok(Quat::from_vec4(self.read_vec4()?))
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }

    /// Current read position within the payload.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::MAX_SEGMENT_SIZE;
    use crate::segment::SegmentPool;

    #[test]
    fn test_primitives_roundtrip() {
        let pool = SegmentPool::new(1);
        let mut segment = pool.request_free_segment().unwrap();
        BinaryEncoder::new(&mut segment)
            .write_u8(0xAB)
            .write_i8(-5)
            .write_u16(0xBEEF)
            .write_i16(-30000)
            .write_u32(0xDEAD_BEEF)
            .write_i32(i32::MIN)
            .write_u64(u64::MAX - 1)
            .write_i64(-1)
            .write_f32(1.5)
            .write_f64(-0.25)
            .write_bool(true)
            .write_bool(false);

        let mut decoder = BinaryDecoder::new(&segment);
        assert_eq!(decoder.read_u8().unwrap(), 0xAB);
        assert_eq!(decoder.read_i8().unwrap(), -5);
        assert_eq!(decoder.read_u16().unwrap(), 0xBEEF);
        assert_eq!(decoder.read_i16().unwrap(), -30000);
        assert_eq!(decoder.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(decoder.read_i32().unwrap(), i32::MIN);
        assert_eq!(decoder.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(decoder.read_i64().unwrap(), -1);
        assert_eq!(decoder.read_f32().unwrap(), 1.5);
        assert_eq!(decoder.read_f64().unwrap(), -0.25);
        assert!(decoder.read_bool().unwrap());
        assert!(!decoder.read_bool().unwrap());
        assert_eq!(decoder.remaining(), 0);
    }

    #[test]
    fn test_strings_vectors_quaternions() {
        let pool = SegmentPool::new(1);
        let mut segment = pool.request_free_segment().unwrap();
        let rotation = Quat::from_rotation_y(0.75);
        BinaryEncoder::new(&mut segment)
            .write_string("")
            .write_string("crazy canvas")
            .write_vec2(Vec2::new(1.0, -2.0))
            .write_vec3(Vec3::new(0.5, 0.25, 8.0))
            .write_vec4(Vec4::new(1.0, 2.0, 3.0, 4.0))
            .write_quat(rotation);

        let mut decoder = BinaryDecoder::new(&segment);
        assert_eq!(decoder.read_string().unwrap(), "");
        assert_eq!(decoder.read_str().unwrap(), "crazy canvas");
        assert_eq!(decoder.read_vec2().unwrap(), Vec2::new(1.0, -2.0));
        assert_eq!(decoder.read_vec3().unwrap(), Vec3::new(0.5, 0.25, 8.0));
        assert_eq!(decoder.read_vec4().unwrap(), Vec4::new(1.0, 2.0, 3.0, 4.0));
        assert_eq!(decoder.read_quat().unwrap(), rotation);
    }

    #[test]
    fn test_string_layout_is_length_prefixed() {
        let pool = SegmentPool::new(1);
        let mut segment = pool.request_free_segment().unwrap();
        BinaryEncoder::new(&mut segment).write_string("ab");
        assert_eq!(segment.buffer(), &[2, 0, b'a', b'b']);
    }

    #[test]
    fn test_read_past_end_is_an_error() {
        let pool = SegmentPool::new(1);
        let mut segment = pool.request_free_segment().unwrap();
        BinaryEncoder::new(&mut segment).write_u16(1);

        let mut decoder = BinaryDecoder::new(&segment);
        assert_eq!(
            decoder.read_u32(),
            Err(CodecError::EndOfSegment {
                needed: 4,
                remaining: 2
            })
        );
        // A failed read does not move the cursor.
        assert_eq!(decoder.read_u16().unwrap(), 1);
    }

    #[test]
    fn test_truncated_string_is_an_error() {
        let pool = SegmentPool::new(2);
        let mut segment = pool.request_free_segment().unwrap();
        BinaryEncoder::new(&mut segment).write_u16(10).write_bytes(b"abc");
        let mut decoder = BinaryDecoder::new(&segment);
        assert!(matches!(
            decoder.read_string(),
            Err(CodecError::EndOfSegment { needed: 10, .. })
        ));

        let mut segment = pool.request_free_segment().unwrap();
        BinaryEncoder::new(&mut segment)
            .write_u16(2)
            .write_bytes(&[0xFF, 0xFE]);
        let mut decoder = BinaryDecoder::new(&segment);
        assert_eq!(decoder.read_string(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    #[should_panic(expected = "segment overflow")]
    fn test_encoder_overflow_panics() {
        let pool = SegmentPool::new(1);
        let mut segment = pool.request_free_segment().unwrap();
        let filler = vec![0u8; MAX_SEGMENT_SIZE - 1];
        BinaryEncoder::new(&mut segment)
            .write_bytes(&filler)
            .write_u16(1);
    }

    #[test]
    fn test_checked_encoder_skips_what_does_not_fit() {
        let pool = SegmentPool::new(1);
        let mut segment = pool.request_free_segment().unwrap();
        let filler = vec![0u8; MAX_SEGMENT_SIZE - 3];
        let mut encoder = BinaryEncoder::checked(&mut segment);
        encoder.write_bytes(&filler).write_u16(7);
        assert!(!encoder.overflowed());
        assert_eq!(encoder.remaining(), 1);

        encoder.write_string("x").write_u8(1);
        assert!(encoder.overflowed());
        assert_eq!(encoder.remaining(), 1);
        assert_eq!(segment.len(), MAX_SEGMENT_SIZE - 1);
    }
}

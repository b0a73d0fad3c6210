//! Tagged binary serialization for [`Value`] graphs.
//!
//! Every value is a 4-byte little-endian tag followed by a tag-specific
//! payload. Decoding never fails and never panics: malformed input (truncated
//! payload, unknown tag, length overflow) yields `Value::Error` together with
//! a consumed byte count of -1, which tells the caller the stream is
//! desynchronized and must be flushed.

use bytes::{BufMut, BytesMut};

use super::value::{
    Complex64, ComplexPointVector, Dtype, Image, IntervalSampleVector, NdArray, PointVector, Value,
};

/// Wire tags, one per [`Value`] variant that exists on the wire.
pub mod tag {
    pub const NONE: u32 = 0;
    pub const INT: u32 = 1;
    pub const FLOAT: u32 = 2;
    pub const COMPLEX: u32 = 3;
    pub const STR: u32 = 4;
    pub const BYTES: u32 = 5;
    pub const LIST: u32 = 6;
    pub const DICT: u32 = 7;
    pub const NDARRAY: u32 = 8;
    pub const POINTS: u32 = 9;
    pub const COMPLEX_POINTS: u32 = 10;
    pub const INTERVAL_SAMPLES: u32 = 11;
    pub const ERROR: u32 = 12;
}

/// Arrays deeper than this are treated as malformed.
const MAX_RANK: usize = 32;

/// Values nested deeper than this are treated as malformed. Keeps a run of
/// container headers from exhausting the decoder's stack.
const MAX_DEPTH: usize = 128;

/// Upper bound on speculative `Vec` pre-allocation while decoding. Counts
/// come off the wire; the vec grows past this on its own.
const PREALLOC_LIMIT: usize = 4096;

/// Encode one value into `dst`.
pub fn encode(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::None => dst.put_u32_le(tag::NONE),
        Value::Int(v) => {
            dst.put_u32_le(tag::INT);
            dst.put_i64_le(*v);
        }
        Value::Float(v) => {
            dst.put_u32_le(tag::FLOAT);
            dst.put_f64_le(*v);
        }
        Value::Complex(v) => {
            dst.put_u32_le(tag::COMPLEX);
            dst.put_f64_le(v.re);
            dst.put_f64_le(v.im);
        }
        Value::Str(s) => {
            dst.put_u32_le(tag::STR);
            encode_str(s, dst);
        }
        Value::Bytes(b) => {
            dst.put_u32_le(tag::BYTES);
            dst.put_u32_le(b.len() as u32);
            dst.put_slice(b);
        }
        Value::List(items) => {
            dst.put_u32_le(tag::LIST);
            dst.put_u32_le(items.len() as u32);
            for item in items {
                encode(item, dst);
            }
        }
        Value::Dict(pairs) => {
            dst.put_u32_le(tag::DICT);
            dst.put_u32_le(pairs.len() as u32);
            for (key, val) in pairs {
                encode(key, dst);
                encode(val, dst);
            }
        }
        Value::Array(arr) => encode_array(arr, dst),
        Value::Image(img) => encode_array(&img.clone().into_array(), dst),
        Value::Points(p) => {
            dst.put_u32_le(tag::POINTS);
            encode_array(&p.clone().into_array(), dst);
        }
        Value::ComplexPoints(p) => {
            dst.put_u32_le(tag::COMPLEX_POINTS);
            encode_array(&p.clone().into_array(), dst);
        }
        Value::IntervalSamples(s) => {
            dst.put_u32_le(tag::INTERVAL_SAMPLES);
            let (values, bounds) = s.clone().into_arrays();
            encode_array(&values, dst);
            encode_array(&bounds, dst);
        }
        Value::Error(message) => {
            dst.put_u32_le(tag::ERROR);
            dst.put_u32_le(tag::STR);
            encode_str(message, dst);
        }
    }
}

/// Encode one value into a fresh buffer.
pub fn encode_value(value: &Value) -> BytesMut {
    let mut dst = BytesMut::new();
    encode(value, &mut dst);
    dst
}

fn encode_str(s: &str, dst: &mut BytesMut) {
    let units: Vec<u16> = s.encode_utf16().collect();
    dst.put_u32_le((units.len() * 2) as u32);
    for unit in units {
        dst.put_u16_le(unit);
    }
}

fn encode_array(arr: &NdArray, dst: &mut BytesMut) {
    dst.put_u32_le(tag::NDARRAY);
    dst.put_u8(arr.dtype().code());
    dst.put_u32_le(arr.shape().len() as u32);
    for &dim in arr.shape() {
        dst.put_u32_le(dim as u32);
    }
    dst.put_slice(arr.data());
}

/// Decode one value starting at `offset`.
///
/// Returns the value and the number of bytes consumed. On malformation the
/// value is `Value::Error` and the count is -1; the buffer is never read out
/// of bounds.
pub fn decode(buf: &[u8], offset: usize) -> (Value, isize) {
    let mut cursor = Cursor {
        buf,
        pos: offset,
        depth: 0,
    };
    match cursor.read_value() {
        Some(value) => (value, (cursor.pos - offset) as isize),
        None => (Value::Error("malformed wire data".to_string()), -1),
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Cursor<'_> {
    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Option<&[u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    fn i64(&mut self) -> Option<i64> {
        Some(i64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn f64(&mut self) -> Option<f64> {
        Some(f64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    fn read_value(&mut self) -> Option<Value> {
        if self.depth == MAX_DEPTH {
            return None;
        }
        self.depth += 1;
        let value = self.read_value_inner();
        self.depth -= 1;
        value
    }

    fn read_value_inner(&mut self) -> Option<Value> {
        match self.u32()? {
            tag::NONE => Some(Value::None),
            tag::INT => Some(Value::Int(self.i64()?)),
            tag::FLOAT => Some(Value::Float(self.f64()?)),
            tag::COMPLEX => Some(Value::Complex(Complex64::new(self.f64()?, self.f64()?))),
            tag::STR => Some(Value::Str(self.read_str()?)),
            tag::BYTES => {
                let len = self.u32()? as usize;
                Some(Value::Bytes(self.take(len)?.to_vec()))
            }
            tag::LIST => {
                let count = self.u32()? as usize;
                // Every element is at least a 4-byte tag.
                if count > self.remaining() / 4 {
                    return None;
                }
                let mut items = Vec::with_capacity(count.min(PREALLOC_LIMIT));
                for _ in 0..count {
                    items.push(self.read_value()?);
                }
                Some(Value::List(items))
            }
            tag::DICT => {
                let count = self.u32()? as usize;
                if count > self.remaining() / 8 {
                    return None;
                }
                let mut pairs = Vec::with_capacity(count.min(PREALLOC_LIMIT));
                for _ in 0..count {
                    let key = self.read_value()?;
                    let val = self.read_value()?;
                    pairs.push((key, val));
                }
                Some(Value::Dict(pairs))
            }
            tag::NDARRAY => Some(promote_image(self.read_array_body()?)),
            tag::POINTS => match self.read_value()? {
                Value::Array(arr) => Some(match PointVector::from_array(arr) {
                    Ok(points) => Value::Points(points),
                    Err(arr) => Value::Array(arr),
                }),
                Value::Image(img) => Some(Value::Image(img)),
                _ => None,
            },
            tag::COMPLEX_POINTS => match self.read_value()? {
                Value::Array(arr) => Some(match ComplexPointVector::from_array(arr) {
                    Ok(points) => Value::ComplexPoints(points),
                    Err(arr) => Value::Array(arr),
                }),
                Value::Image(img) => Some(Value::Image(img)),
                _ => None,
            },
            tag::INTERVAL_SAMPLES => {
                let values = self.read_value()?;
                let bounds = self.read_value()?;
                match (values, bounds) {
                    (Value::Array(values), Value::Array(bounds)) => {
                        Some(match IntervalSampleVector::from_arrays(values, bounds) {
                            Ok(samples) => Value::IntervalSamples(samples),
                            Err((values, bounds)) => Value::List(vec![
                                Value::Array(values),
                                Value::Array(bounds),
                            ]),
                        })
                    }
                    _ => None,
                }
            }
            tag::ERROR => match self.read_value()? {
                Value::Str(message) => Some(Value::Error(message)),
                _ => None,
            },
            _ => None,
        }
    }

    fn read_str(&mut self) -> Option<String> {
        let len = self.u32()? as usize;
        if len % 2 != 0 {
            return None;
        }
        let raw = self.take(len)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes(c.try_into().expect("chunk is 2 bytes")))
            .collect();
        Some(String::from_utf16_lossy(&units))
    }

    fn read_array_body(&mut self) -> Option<NdArray> {
        let dtype = Dtype::from_code(self.u8()?)?;
        let rank = self.u32()? as usize;
        if rank > MAX_RANK {
            return None;
        }
        let mut shape = Vec::with_capacity(rank);
        let mut count = 1usize;
        for _ in 0..rank {
            let dim = self.u32()? as usize;
            count = count.checked_mul(dim)?;
            shape.push(dim);
        }
        let nbytes = count.checked_mul(dtype.size())?;
        let data = self.take(nbytes)?.to_vec();
        NdArray::new(dtype, shape, data)
    }
}

fn promote_image(arr: NdArray) -> Value {
    match Image::from_array(arr) {
        Ok(image) => Value::Image(image),
        Err(arr) => Value::Array(arr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = encode_value(&value);
        let (decoded, consumed) = decode(&encoded, 0);
        assert_eq!(decoded, value);
        assert_eq!(consumed, encoded.len() as isize);
    }

    #[test]
    fn scalars_roundtrip() {
        roundtrip(Value::None);
        roundtrip(Value::Int(-42));
        roundtrip(Value::Int(i64::MAX));
        roundtrip(Value::Float(3.5));
        roundtrip(Value::Float(f64::NEG_INFINITY));
        roundtrip(Value::Complex(Complex64::new(1.5, -2.5)));
    }

    #[test]
    fn strings_roundtrip() {
        roundtrip(Value::Str(String::new()));
        roundtrip(Value::Str("hello".to_string()));
        roundtrip(Value::Str("grüße, 世界 🌍".to_string()));
        roundtrip(Value::Bytes(vec![0, 255, 1, 254]));
    }

    #[test]
    fn containers_roundtrip() {
        roundtrip(Value::List(vec![]));
        roundtrip(Value::List(vec![
            Value::Int(1),
            Value::Str("two".to_string()),
            Value::List(vec![Value::None]),
        ]));
        roundtrip(Value::Dict(vec![
            (Value::Str("a".to_string()), Value::Int(1)),
            (
                Value::Int(2),
                Value::Dict(vec![(Value::Str("nested".to_string()), Value::Float(0.5))]),
            ),
        ]));
    }

    #[test]
    fn arrays_roundtrip_every_dtype() {
        for dtype in [
            Dtype::Bool,
            Dtype::I8,
            Dtype::U8,
            Dtype::I16,
            Dtype::U16,
            Dtype::I32,
            Dtype::U32,
            Dtype::I64,
            Dtype::U64,
            Dtype::F32,
            Dtype::F64,
            Dtype::Complex64,
            Dtype::Complex128,
            Dtype::FixedStr,
            Dtype::UnicodeStr,
        ] {
            let data: Vec<u8> = (0..dtype.size() * 6).map(|i| i as u8).collect();
            let arr = NdArray::new(dtype, vec![3, 2], data).unwrap();
            roundtrip(Value::Array(arr));
        }
    }

    #[test]
    fn empty_array_roundtrips() {
        roundtrip(Value::Array(
            NdArray::new(Dtype::F64, vec![0], Vec::new()).unwrap(),
        ));
    }

    #[test]
    fn composites_roundtrip() {
        roundtrip(Value::Points(
            PointVector::new(vec![1.0, 2.0], vec![3.0, 4.0]).unwrap(),
        ));
        roundtrip(Value::ComplexPoints(
            ComplexPointVector::new(
                vec![Complex64::new(1.0, 2.0)],
                vec![Complex64::new(3.0, 4.0)],
            )
            .unwrap(),
        ));
        roundtrip(Value::IntervalSamples(
            IntervalSampleVector::new(vec![1.0, 2.0], vec![0.5, 1.5], vec![1.5, 2.5]).unwrap(),
        ));
        roundtrip(Value::Error("worker exploded".to_string()));
    }

    #[test]
    fn image_roundtrips_pixel_exact() {
        let pixels: Vec<u8> = (0..2 * 3 * 3).map(|i| i as u8).collect();
        let image = Image::new(2, 3, 3, pixels.clone()).unwrap();
        let encoded = encode_value(&Value::Image(image));
        let (decoded, consumed) = decode(&encoded, 0);
        assert_eq!(consumed, encoded.len() as isize);
        match decoded {
            Value::Image(img) => {
                assert_eq!((img.height(), img.width(), img.channels()), (2, 3, 3));
                assert_eq!(img.data(), &pixels[..]);
            }
            other => panic!("expected image, got {}", other.type_name()),
        }
    }

    #[test]
    fn rgba_arrays_decode_as_images() {
        let arr = NdArray::from_u8s(vec![1, 2, 4], &[9u8; 8]).unwrap();
        let encoded = encode_value(&Value::Array(arr));
        let (decoded, _) = decode(&encoded, 0);
        assert!(matches!(decoded, Value::Image(_)));
    }

    #[test]
    fn unpromotable_points_pass_through_as_array() {
        // Three rows: not a valid point vector, must stay generic.
        let arr = NdArray::from_f64s(vec![3, 2], &[0.0; 6]).unwrap();
        let mut dst = BytesMut::new();
        dst.put_u32_le(tag::POINTS);
        encode(&Value::Array(arr.clone()), &mut dst);
        let (decoded, consumed) = decode(&dst, 0);
        assert_eq!(decoded, Value::Array(arr));
        assert_eq!(consumed, dst.len() as isize);
    }

    #[test]
    fn unpromotable_interval_samples_pass_through_as_list() {
        let values = NdArray::from_f64s(vec![3], &[0.0; 3]).unwrap();
        let bounds = NdArray::from_f64s(vec![2, 2], &[0.0; 4]).unwrap();
        let mut dst = BytesMut::new();
        dst.put_u32_le(tag::INTERVAL_SAMPLES);
        encode(&Value::Array(values.clone()), &mut dst);
        encode(&Value::Array(bounds.clone()), &mut dst);
        let (decoded, _) = decode(&dst, 0);
        assert_eq!(
            decoded,
            Value::List(vec![Value::Array(values), Value::Array(bounds)])
        );
    }

    #[test]
    fn decode_at_offset() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"junk");
        encode(&Value::Int(7), &mut buf);
        let (decoded, consumed) = decode(&buf, 4);
        assert_eq!(decoded, Value::Int(7));
        assert_eq!(consumed, 12);
    }

    #[test]
    fn truncation_yields_error_and_minus_one() {
        let encoded = encode_value(&Value::List(vec![
            Value::Str("abcdef".to_string()),
            Value::Int(1),
        ]));
        // Every strict prefix must fail cleanly, never panic.
        for cut in 0..encoded.len() {
            let (value, consumed) = decode(&encoded[..cut], 0);
            assert!(value.is_error(), "prefix of {cut} bytes decoded");
            assert_eq!(consumed, -1);
        }
    }

    #[test]
    fn deep_nesting_yields_error_and_minus_one() {
        // Well-formed nesting within the limit decodes.
        let mut nested = Value::Int(1);
        for _ in 0..64 {
            nested = Value::List(vec![nested]);
        }
        roundtrip(nested);

        // A long run of single-element list headers must fail cleanly
        // instead of exhausting the stack.
        let mut buf = BytesMut::new();
        for _ in 0..500_000 {
            buf.put_u32_le(tag::LIST);
            buf.put_u32_le(1);
        }
        let (value, consumed) = decode(&buf, 0);
        assert!(value.is_error());
        assert_eq!(consumed, -1);
    }

    #[test]
    fn large_list_roundtrips() {
        // Element count above the pre-allocation cap.
        roundtrip(Value::List((0..10_000i64).map(Value::Int).collect()));
    }

    #[test]
    fn unknown_tag_yields_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(999);
        let (value, consumed) = decode(&buf, 0);
        assert!(value.is_error());
        assert_eq!(consumed, -1);
    }

    #[test]
    fn unknown_dtype_yields_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(tag::NDARRAY);
        buf.put_u8(200);
        buf.put_u32_le(0);
        let (value, consumed) = decode(&buf, 0);
        assert!(value.is_error());
        assert_eq!(consumed, -1);
    }

    #[test]
    fn absurd_list_count_yields_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(tag::LIST);
        buf.put_u32_le(u32::MAX);
        let (value, consumed) = decode(&buf, 0);
        assert!(value.is_error());
        assert_eq!(consumed, -1);
    }

    #[test]
    fn array_dim_overflow_yields_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(tag::NDARRAY);
        buf.put_u8(Dtype::F64.code());
        buf.put_u32_le(2);
        buf.put_u32_le(u32::MAX);
        buf.put_u32_le(u32::MAX);
        let (value, consumed) = decode(&buf, 0);
        assert!(value.is_error());
        assert_eq!(consumed, -1);
    }
}

//! Dynamic value graph exchanged with the worker.
//!
//! Everything the wire codec can carry is a [`Value`]. Domain composites
//! (point vectors, interval samples) travel as plain arrays plus an outer
//! discriminator and are promoted after decoding; promotion is fallible and
//! falls back to the generic array form when shape constraints do not hold.

/// Complex scalar, two f64 components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complex64 {
    pub re: f64,
    pub im: f64,
}

impl Complex64 {
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

/// Element type of an [`NdArray`].
///
/// String dtypes have no per-item width on the wire (the dtype code is a
/// single byte), so string-typed arrays carry their character count as the
/// trailing shape dimension: `FixedStr` elements are single bytes,
/// `UnicodeStr` elements are 4-byte UCS-4 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Complex64,
    Complex128,
    FixedStr,
    UnicodeStr,
}

impl Dtype {
    /// Wire code for this dtype.
    pub fn code(self) -> u8 {
        match self {
            Dtype::Bool => 0,
            Dtype::I8 => 1,
            Dtype::U8 => 2,
            Dtype::I16 => 3,
            Dtype::U16 => 4,
            Dtype::I32 => 5,
            Dtype::U32 => 6,
            Dtype::I64 => 7,
            Dtype::U64 => 8,
            Dtype::F32 => 9,
            Dtype::F64 => 10,
            Dtype::Complex64 => 11,
            Dtype::Complex128 => 12,
            Dtype::FixedStr => 13,
            Dtype::UnicodeStr => 14,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Dtype::Bool,
            1 => Dtype::I8,
            2 => Dtype::U8,
            3 => Dtype::I16,
            4 => Dtype::U16,
            5 => Dtype::I32,
            6 => Dtype::U32,
            7 => Dtype::I64,
            8 => Dtype::U64,
            9 => Dtype::F32,
            10 => Dtype::F64,
            11 => Dtype::Complex64,
            12 => Dtype::Complex128,
            13 => Dtype::FixedStr,
            14 => Dtype::UnicodeStr,
            _ => return None,
        })
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::Bool | Dtype::I8 | Dtype::U8 | Dtype::FixedStr => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I32 | Dtype::U32 | Dtype::F32 | Dtype::UnicodeStr => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 | Dtype::Complex64 => 8,
            Dtype::Complex128 => 16,
        }
    }
}

/// Typed, shaped, contiguous row-major array.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NdArray {
    /// Build an array, validating `data.len() == product(shape) * dtype.size()`.
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Option<Self> {
        let count = shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))?;
        let expected = count.checked_mul(dtype.size())?;
        if data.len() != expected {
            return None;
        }
        Some(Self { dtype, shape, data })
    }

    pub fn from_f64s(shape: Vec<usize>, values: &[f64]) -> Option<Self> {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(Dtype::F64, shape, data)
    }

    pub fn from_i64s(shape: Vec<usize>, values: &[i64]) -> Option<Self> {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(Dtype::I64, shape, data)
    }

    pub fn from_complexes(shape: Vec<usize>, values: &[Complex64]) -> Option<Self> {
        let mut data = Vec::with_capacity(values.len() * 16);
        for v in values {
            data.extend_from_slice(&v.re.to_le_bytes());
            data.extend_from_slice(&v.im.to_le_bytes());
        }
        Self::new(Dtype::Complex128, shape, data)
    }

    pub fn from_u8s(shape: Vec<usize>, values: &[u8]) -> Option<Self> {
        Self::new(Dtype::U8, shape, values.to_vec())
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Elements as f64, only for F64 arrays.
    pub fn as_f64s(&self) -> Option<Vec<f64>> {
        if self.dtype != Dtype::F64 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().expect("chunk is 8 bytes")))
                .collect(),
        )
    }

    /// Elements as complex, only for Complex128 arrays.
    pub fn as_complexes(&self) -> Option<Vec<Complex64>> {
        if self.dtype != Dtype::Complex128 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(16)
                .map(|c| {
                    Complex64::new(
                        f64::from_le_bytes(c[..8].try_into().expect("chunk is 16 bytes")),
                        f64::from_le_bytes(c[8..].try_into().expect("chunk is 16 bytes")),
                    )
                })
                .collect(),
        )
    }
}

/// Packed RGB/RGBA pixel buffer.
///
/// An alternate view of a `u8` rank-3 array whose trailing dimension is 3
/// or 4 - not a separate wire tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<u8>,
}

impl Image {
    pub fn new(height: usize, width: usize, channels: usize, data: Vec<u8>) -> Option<Self> {
        if channels != 3 && channels != 4 {
            return None;
        }
        let expected = height.checked_mul(width)?.checked_mul(channels)?;
        if data.len() != expected {
            return None;
        }
        Some(Self {
            height,
            width,
            channels,
            data,
        })
    }

    /// Promote a `u8` `[H, W, 3|4]` array; hands the array back otherwise.
    pub fn from_array(array: NdArray) -> Result<Self, NdArray> {
        if array.dtype() == Dtype::U8
            && array.shape().len() == 3
            && matches!(array.shape()[2], 3 | 4)
        {
            let (height, width, channels) = (array.shape[0], array.shape[1], array.shape[2]);
            Ok(Self {
                height,
                width,
                channels,
                data: array.data,
            })
        } else {
            Err(array)
        }
    }

    pub fn into_array(self) -> NdArray {
        NdArray {
            dtype: Dtype::U8,
            shape: vec![self.height, self.width, self.channels],
            data: self.data,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// X/Y point series, carried on the wire as an f64 `[2, N]` array.
#[derive(Debug, Clone, PartialEq)]
pub struct PointVector {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
}

impl PointVector {
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Option<Self> {
        if xs.len() != ys.len() {
            return None;
        }
        Some(Self { xs, ys })
    }

    /// Promote an f64 `[2, N]` array; hands the array back otherwise.
    pub fn from_array(array: NdArray) -> Result<Self, NdArray> {
        if array.dtype() == Dtype::F64 && array.shape().len() == 2 && array.shape()[0] == 2 {
            let values = array.as_f64s().expect("dtype checked");
            let n = array.shape()[1];
            Ok(Self {
                xs: values[..n].to_vec(),
                ys: values[n..].to_vec(),
            })
        } else {
            Err(array)
        }
    }

    pub fn into_array(self) -> NdArray {
        let n = self.xs.len();
        let mut values = self.xs;
        values.extend_from_slice(&self.ys);
        NdArray::from_f64s(vec![2, n], &values).expect("rows have equal length")
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }
}

/// Complex-valued point series, a complex128 `[2, N]` array on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexPointVector {
    pub xs: Vec<Complex64>,
    pub ys: Vec<Complex64>,
}

impl ComplexPointVector {
    pub fn new(xs: Vec<Complex64>, ys: Vec<Complex64>) -> Option<Self> {
        if xs.len() != ys.len() {
            return None;
        }
        Some(Self { xs, ys })
    }

    pub fn from_array(array: NdArray) -> Result<Self, NdArray> {
        if array.dtype() == Dtype::Complex128 && array.shape().len() == 2 && array.shape()[0] == 2 {
            let values = array.as_complexes().expect("dtype checked");
            let n = array.shape()[1];
            Ok(Self {
                xs: values[..n].to_vec(),
                ys: values[n..].to_vec(),
            })
        } else {
            Err(array)
        }
    }

    pub fn into_array(self) -> NdArray {
        let n = self.xs.len();
        let mut values = self.xs;
        values.extend_from_slice(&self.ys);
        NdArray::from_complexes(vec![2, n], &values).expect("rows have equal length")
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }
}

/// Sample series with per-sample bounds: a value array plus an f64 `[2, N]`
/// bounds array (lower row, then upper row).
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalSampleVector {
    pub values: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl IntervalSampleVector {
    pub fn new(values: Vec<f64>, lower: Vec<f64>, upper: Vec<f64>) -> Option<Self> {
        if values.len() != lower.len() || values.len() != upper.len() {
            return None;
        }
        Some(Self {
            values,
            lower,
            upper,
        })
    }

    /// Promote a value/bounds array pair; hands both back otherwise.
    pub fn from_arrays(values: NdArray, bounds: NdArray) -> Result<Self, (NdArray, NdArray)> {
        let ok = values.dtype() == Dtype::F64
            && values.shape().len() == 1
            && bounds.dtype() == Dtype::F64
            && bounds.shape().len() == 2
            && bounds.shape()[0] == 2
            && bounds.shape()[1] == values.shape()[0];
        if !ok {
            return Err((values, bounds));
        }
        let n = values.shape()[0];
        let bound_values = bounds.as_f64s().expect("dtype checked");
        Ok(Self {
            values: values.as_f64s().expect("dtype checked"),
            lower: bound_values[..n].to_vec(),
            upper: bound_values[n..].to_vec(),
        })
    }

    pub fn into_arrays(self) -> (NdArray, NdArray) {
        let n = self.values.len();
        let values = NdArray::from_f64s(vec![n], &self.values).expect("length matches shape");
        let mut bound_values = self.lower;
        bound_values.extend_from_slice(&self.upper);
        let bounds = NdArray::from_f64s(vec![2, n], &bound_values).expect("rows have equal length");
        (values, bounds)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Anything transmissible over the worker channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Int(i64),
    Float(f64),
    Complex(Complex64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    /// Insertion-ordered key/value pairs; keys are themselves values.
    Dict(Vec<(Value, Value)>),
    Array(NdArray),
    Image(Image),
    Points(PointVector),
    ComplexPoints(ComplexPointVector),
    IntervalSamples(IntervalSampleVector),
    Error(String),
}

impl Value {
    /// Worker-side failures surface as `Error` values, never as `Err`.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Complex(_) => "complex",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Array(_) => "array",
            Value::Image(_) => "image",
            Value::Points(_) => "points",
            Value::ComplexPoints(_) => "complex_points",
            Value::IntervalSamples(_) => "interval_samples",
            Value::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndarray_rejects_length_mismatch() {
        assert!(NdArray::new(Dtype::F64, vec![2, 2], vec![0u8; 31]).is_none());
        assert!(NdArray::new(Dtype::F64, vec![2, 2], vec![0u8; 32]).is_some());
    }

    #[test]
    fn ndarray_zero_dim_is_empty() {
        let arr = NdArray::new(Dtype::I64, vec![0, 4], Vec::new()).unwrap();
        assert_eq!(arr.element_count(), 0);
    }

    #[test]
    fn dtype_codes_roundtrip() {
        for code in 0..=14u8 {
            let dtype = Dtype::from_code(code).unwrap();
            assert_eq!(dtype.code(), code);
        }
        assert!(Dtype::from_code(15).is_none());
    }

    #[test]
    fn point_vector_promotes_two_row_array() {
        let arr = NdArray::from_f64s(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let points = PointVector::from_array(arr).unwrap();
        assert_eq!(points.xs, vec![1.0, 2.0, 3.0]);
        assert_eq!(points.ys, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn point_vector_rejects_three_row_array() {
        let arr = NdArray::from_f64s(vec![3, 2], &[1.0; 6]).unwrap();
        let back = PointVector::from_array(arr).unwrap_err();
        assert_eq!(back.shape(), &[3, 2]);
    }

    #[test]
    fn point_vector_array_roundtrip() {
        let points = PointVector::new(vec![1.0, 2.0], vec![3.0, 4.0]).unwrap();
        let again = PointVector::from_array(points.clone().into_array()).unwrap();
        assert_eq!(points, again);
    }

    #[test]
    fn interval_samples_require_matching_bounds() {
        let values = NdArray::from_f64s(vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let bounds = NdArray::from_f64s(vec![2, 2], &[0.0; 4]).unwrap();
        assert!(IntervalSampleVector::from_arrays(values, bounds).is_err());

        let values = NdArray::from_f64s(vec![2], &[1.0, 2.0]).unwrap();
        let bounds = NdArray::from_f64s(vec![2, 2], &[0.5, 1.5, 1.5, 2.5]).unwrap();
        let samples = IntervalSampleVector::from_arrays(values, bounds).unwrap();
        assert_eq!(samples.lower, vec![0.5, 1.5]);
        assert_eq!(samples.upper, vec![1.5, 2.5]);
    }

    #[test]
    fn image_promotes_rgb_and_rgba_only() {
        let rgb = NdArray::from_u8s(vec![2, 2, 3], &[7u8; 12]).unwrap();
        let image = Image::from_array(rgb).unwrap();
        assert_eq!((image.height(), image.width(), image.channels()), (2, 2, 3));

        let planes = NdArray::from_u8s(vec![2, 2, 5], &[7u8; 20]).unwrap();
        assert!(Image::from_array(planes).is_err());
    }
}

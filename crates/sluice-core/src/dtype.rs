//! Element data types and the byte-level [`Element`] mapping.
//!
//! Variables travel as raw little-endian bytes. [`DataType`] names the
//! element layout on the wire; [`Element`] connects a Rust scalar to its
//! [`DataType`] so typed puts and gets can be checked and converted.
//!
//! [`DataType::String`] is the one variable-length type: a string value
//! travels as its UTF-8 bytes and its length is carried by the block
//! that holds it, not by the type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::UnknownDataType;

/// Wire element type of a variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// Signed 32-bit integer.
    Int32,
    /// Signed 64-bit integer.
    Int64,
    /// Unsigned 8-bit integer.
    UInt8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// IEEE-754 single precision.
    Float32,
    /// IEEE-754 double precision.
    Float64,
    /// UTF-8 text of any length. Byte-addressed; single values only.
    String,
}

macro_rules! dispatch {
    ($dt:expr, $t:ident => $body:expr) => {
        match $dt {
            DataType::Int8 => { type $t = i8; $body }
            DataType::Int16 => { type $t = i16; $body }
            DataType::Int32 => { type $t = i32; $body }
            DataType::Int64 => { type $t = i64; $body }
            DataType::UInt8 => { type $t = u8; $body }
            DataType::UInt16 => { type $t = u16; $body }
            DataType::UInt32 => { type $t = u32; $body }
            DataType::UInt64 => { type $t = u64; $body }
            DataType::Float32 => { type $t = f32; $body }
            DataType::Float64 => { type $t = f64; $body }
            DataType::String => { type $t = u8; $body }
        }
    };
}

impl DataType {
    /// Size of one element in bytes. One for [`DataType::String`], whose
    /// elements are bytes.
    pub fn size(self) -> usize {
        dispatch!(self, T => std::mem::size_of::<T>())
    }

    /// Canonical lowercase name, as used on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::String => "string",
        }
    }

    /// Whether values have a fixed size known from the type alone.
    pub fn is_fixed_size(self) -> bool {
        self != Self::String
    }

    /// Read the element at `index` of a little-endian buffer as `f64`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer does not hold element `index`.
    pub fn load_f64(self, bytes: &[u8], index: usize) -> f64 {
        dispatch!(self, T => {
            let n = std::mem::size_of::<T>();
            T::read_le(&bytes[index * n..(index + 1) * n]).to_f64()
        })
    }

    /// Store `value` into element `index` of a little-endian buffer,
    /// converting with [`Element::from_f64`].
    ///
    /// # Panics
    ///
    /// Panics if the buffer does not hold element `index`.
    pub fn store_f64(self, bytes: &mut [u8], index: usize, value: f64) {
        dispatch!(self, T => {
            let n = std::mem::size_of::<T>();
            T::from_f64(value).write_le(&mut bytes[index * n..(index + 1) * n]);
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = match s.to_ascii_lowercase().as_str() {
            "int8" | "char" | "signed char" => Self::Int8,
            "int16" | "short" => Self::Int16,
            "int32" | "int" => Self::Int32,
            "int64" | "long long int" => Self::Int64,
            "uint8" | "unsigned char" => Self::UInt8,
            "uint16" | "unsigned short" => Self::UInt16,
            "uint32" | "unsigned int" => Self::UInt32,
            "uint64" | "unsigned long long int" => Self::UInt64,
            "float32" | "float" => Self::Float32,
            "float64" | "double" => Self::Float64,
            "string" | "str" => Self::String,
            _ => return Err(UnknownDataType(s.to_string())),
        };
        Ok(dt)
    }
}

/// A Rust scalar that can travel as a variable element.
pub trait Element: Copy + Send + Sync + 'static {
    /// The wire type this scalar maps to.
    const DATA_TYPE: DataType;

    /// Write the little-endian bytes of `self` into `out`
    /// (`out.len() == DATA_TYPE.size()`).
    fn write_le(self, out: &mut [u8]);

    /// Read a value from exactly `DATA_TYPE.size()` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Widen to `f64` for weighted arithmetic.
    fn to_f64(self) -> f64;

    /// Narrow from `f64`. Integer types round to nearest and saturate.
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_element {
    ($t:ty, $dt:ident, int) => {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        impl Element for $t {
            const DATA_TYPE: DataType = DataType::$dt;
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v.round() as $t
            }
        }
    };
    ($t:ty, $dt:ident, float) => {
        impl Element for $t {
            const DATA_TYPE: DataType = DataType::$dt;
            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
        }
    };
}

impl_element!(i8, Int8, int);
impl_element!(i16, Int16, int);
impl_element!(i32, Int32, int);
impl_element!(i64, Int64, int);
impl_element!(u8, UInt8, int);
impl_element!(u16, UInt16, int);
impl_element!(u32, UInt32, int);
impl_element!(u64, UInt64, int);
impl_element!(f32, Float32, float);
impl_element!(f64, Float64, float);

/// Serialize a typed slice to little-endian bytes.
pub fn encode_slice<T: Element>(data: &[T]) -> Vec<u8> {
    let n = T::DATA_TYPE.size();
    let mut out = vec![0u8; data.len() * n];
    for (chunk, v) in out.chunks_exact_mut(n).zip(data) {
        v.write_le(chunk);
    }
    out
}

/// Deserialize little-endian bytes into a typed vector.
///
/// Trailing bytes that do not form a whole element are ignored.
pub fn decode_slice<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes
        .chunks_exact(T::DATA_TYPE.size())
        .map(T::read_le)
        .collect()
}

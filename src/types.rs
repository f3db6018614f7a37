//! Element type descriptors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element types a dataset or attribute can hold
///
/// Serialized as its tag and element size, so stored indexes do not depend
/// on variant order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "StoredType", try_from = "StoredType")]
pub enum DataType {
    /// Boolean stored as one byte
    Bool,
    /// Signed 8-bit integer
    I8,
    /// Signed 16-bit integer
    I16,
    /// Signed 32-bit integer
    I32,
    /// Signed 64-bit integer
    I64,
    /// Unsigned 8-bit integer
    U8,
    /// Unsigned 16-bit integer
    U16,
    /// Unsigned 32-bit integer
    U32,
    /// Unsigned 64-bit integer
    U64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    F64,
    /// Fixed-length byte string of the given length
    FixedString(u32),
    /// Opaque composite record of the given byte size
    Compound(u32),
}

impl DataType {
    /// Size in bytes of one element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Bool | DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
            DataType::FixedString(len) | DataType::Compound(len) => *len as usize,
        }
    }

    /// Stable on-disk type tag
    pub fn tag(&self) -> u8 {
        match self {
            DataType::Bool => 0,
            DataType::I8 => 1,
            DataType::I16 => 2,
            DataType::I32 => 3,
            DataType::I64 => 4,
            DataType::U8 => 5,
            DataType::U16 => 6,
            DataType::U32 => 7,
            DataType::U64 => 8,
            DataType::F32 => 9,
            DataType::F64 => 10,
            DataType::FixedString(_) => 11,
            DataType::Compound(_) => 12,
        }
    }

    /// Rebuild a type from its tag and element size
    pub fn from_tag(tag: u8, size: u32) -> Option<Self> {
        let data_type = match tag {
            0 => DataType::Bool,
            1 => DataType::I8,
            2 => DataType::I16,
            3 => DataType::I32,
            4 => DataType::I64,
            5 => DataType::U8,
            6 => DataType::U16,
            7 => DataType::U32,
            8 => DataType::U64,
            9 => DataType::F32,
            10 => DataType::F64,
            11 => DataType::FixedString(size),
            12 => DataType::Compound(size),
            _ => return None,
        };
        (data_type.size_in_bytes() == size as usize).then_some(data_type)
    }
}

/// Serialized form of a [`DataType`]
#[derive(Serialize, Deserialize)]
struct StoredType {
    tag: u8,
    size: u32,
}

impl From<DataType> for StoredType {
    fn from(data_type: DataType) -> Self {
        Self {
            tag: data_type.tag(),
            size: data_type.size_in_bytes() as u32,
        }
    }
}

impl TryFrom<StoredType> for DataType {
    type Error = String;

    fn try_from(stored: StoredType) -> Result<Self, Self::Error> {
        DataType::from_tag(stored.tag, stored.size)
            .ok_or_else(|| format!("unknown element type tag {} of size {}", stored.tag, stored.size))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::FixedString(len) => write!(f, "String[{}]", len),
            DataType::Compound(len) => write!(f, "Compound[{}]", len),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Plain numeric types that map onto a [`DataType`]
///
/// Every bit pattern of an implementor must be a valid value.
pub trait Element: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl Element for $ty {
            const DATA_TYPE: DataType = DataType::$variant;
        })*
    };
}

impl_element!(
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::Bool.size_in_bytes(), 1);
        assert_eq!(DataType::U16.size_in_bytes(), 2);
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::F64.size_in_bytes(), 8);
        assert_eq!(DataType::FixedString(12).size_in_bytes(), 12);
        assert_eq!(DataType::Compound(24).size_in_bytes(), 24);
    }

    #[test]
    fn test_tag_roundtrip() {
        for data_type in [
            DataType::Bool,
            DataType::I32,
            DataType::U64,
            DataType::F64,
            DataType::FixedString(7),
            DataType::Compound(16),
        ] {
            let size = data_type.size_in_bytes() as u32;
            assert_eq!(DataType::from_tag(data_type.tag(), size), Some(data_type));
        }
        assert_eq!(DataType::from_tag(9, 8), None);
        assert_eq!(DataType::from_tag(200, 1), None);
    }

    #[test]
    fn test_serialized_as_tag() {
        let bytes = bincode::serialize(&DataType::F32).unwrap();
        assert_eq!(bytes, vec![9, 4, 0, 0, 0]);
        let bytes = bincode::serialize(&DataType::FixedString(7)).unwrap();
        assert_eq!(bincode::deserialize::<DataType>(&bytes).unwrap(), DataType::FixedString(7));

        let unknown = bincode::serialize(&(200u8, 1u32)).unwrap();
        assert!(bincode::deserialize::<DataType>(&unknown).is_err());
        let wrong_size = bincode::serialize(&(9u8, 8u32)).unwrap();
        assert!(bincode::deserialize::<DataType>(&wrong_size).is_err());
    }

    #[test]
    fn test_element_types() {
        assert_eq!(<f32 as Element>::DATA_TYPE, DataType::F32);
        assert_eq!(<u64 as Element>::DATA_TYPE, DataType::U64);
    }
}

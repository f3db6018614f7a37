//! Typed attributes attached to groups and datasets

use crate::dims::Dimensions;
use crate::error::{DcError, Result};
use crate::types::{DataType, Element};
use crate::utils::{bytes_to_typed_data, typed_data_to_bytes};
use serde::{Deserialize, Serialize};

/// An attribute value: `count` elements of `data_type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    data_type: DataType,
    count: u64,
    data: Vec<u8>,
}

impl Attribute {
    /// Build an attribute from raw bytes, checking the length
    pub fn new(data_type: DataType, count: u64, data: Vec<u8>) -> Result<Self> {
        let expected = count as usize * data_type.size_in_bytes();
        if data.len() != expected {
            return Err(DcError::ShapeMismatch(format!(
                "Attribute of {} x {} needs {} bytes, got {}",
                count,
                data_type,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data_type,
            count,
            data,
        })
    }

    pub fn from_slice<T: Element>(values: &[T]) -> Self {
        Self {
            data_type: T::DATA_TYPE,
            count: values.len() as u64,
            data: typed_data_to_bytes(values),
        }
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        Self::from_slice(&[value])
    }

    /// A single fixed-length string
    pub fn string(value: &str) -> Self {
        Self {
            data_type: DataType::FixedString(value.len() as u32),
            count: 1,
            data: value.as_bytes().to_vec(),
        }
    }

    /// Three u64 components
    pub fn dims(value: Dimensions) -> Self {
        Self::from_slice(&value.0)
    }

    /// Three u32 components
    pub fn dims_u32(value: Dimensions) -> Self {
        let components: Vec<u32> = value.0.iter().map(|&d| d as u32).collect();
        Self::from_slice(&components)
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.data_type != T::DATA_TYPE {
            return Err(DcError::TypeMismatch(format!(
                "Attribute holds {}, requested {}",
                self.data_type,
                T::DATA_TYPE
            )));
        }
        bytes_to_typed_data(&self.data)
    }

    pub fn as_scalar<T: Element>(&self) -> Result<T> {
        let values = self.to_vec::<T>()?;
        match values.as_slice() {
            [value] => Ok(*value),
            _ => Err(DcError::ShapeMismatch(format!(
                "Attribute holds {} elements, expected 1",
                values.len()
            ))),
        }
    }

    pub fn as_string(&self) -> Result<String> {
        match self.data_type {
            DataType::FixedString(_) => Ok(String::from_utf8_lossy(&self.data)
                .trim_end_matches('\0')
                .to_string()),
            other => Err(DcError::TypeMismatch(format!(
                "Attribute holds {}, requested a string",
                other
            ))),
        }
    }

    /// Read three components stored as u32 or u64
    pub fn as_dims(&self) -> Result<Dimensions> {
        let components: Vec<u64> = match self.data_type {
            DataType::U64 => self.to_vec::<u64>()?,
            DataType::U32 => self.to_vec::<u32>()?.into_iter().map(u64::from).collect(),
            other => {
                return Err(DcError::TypeMismatch(format!(
                    "Attribute holds {}, requested dimensions",
                    other
                )))
            }
        };
        match components.as_slice() {
            [x, y, z] => Ok(Dimensions::new(*x, *y, *z)),
            _ => Err(DcError::ShapeMismatch(format!(
                "Dimension attribute holds {} components",
                components.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let attr = Attribute::from_slice(&[1.5f64, 2.5]);
        assert_eq!(attr.count(), 2);
        assert_eq!(attr.to_vec::<f64>().unwrap(), vec![1.5, 2.5]);
        assert!(attr.to_vec::<f32>().is_err());
        assert!(attr.as_scalar::<f64>().is_err());
        assert_eq!(Attribute::scalar(7u32).as_scalar::<u32>().unwrap(), 7);
    }

    #[test]
    fn test_string_and_dims() {
        assert_eq!(Attribute::string("1.2.0").as_string().unwrap(), "1.2.0");
        let dims = Dimensions::new(2, 3, 4);
        assert_eq!(Attribute::dims(dims).as_dims().unwrap(), dims);
        assert_eq!(Attribute::dims_u32(dims).as_dims().unwrap(), dims);
        assert!(Attribute::scalar(1u8).as_dims().is_err());
    }

    #[test]
    fn test_length_checked() {
        assert!(Attribute::new(DataType::U32, 2, vec![0; 8]).is_ok());
        assert!(Attribute::new(DataType::U32, 2, vec![0; 7]).is_err());
    }
}

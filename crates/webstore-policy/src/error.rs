//! Policy error types

use thiserror::Error;

use crate::{Attribute, AttributeValue, StorageClass};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("Attribute {attribute} is not configurable for {class}")]
    NotConfigurable {
        attribute: Attribute,
        class: StorageClass,
    },

    #[error("Value {value:?} does not fit attribute {attribute}")]
    TypeMismatch {
        attribute: Attribute,
        value: AttributeValue,
    },

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

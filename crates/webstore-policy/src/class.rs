//! Storage classes and contexts

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::PolicyError;

/// Identifies an isolated set of storage objects, e.g. a browser profile or
/// an application sandbox with its own root folder.
pub type ContextId = u32;

pub const DEFAULT_CONTEXT: ContextId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StorageClass {
    #[serde(rename = "webdatabase")]
    WebDatabase,
    #[serde(rename = "localstorage")]
    LocalStorage,
    #[serde(rename = "sessionstorage")]
    SessionStorage,
    #[serde(rename = "widgetpreferences")]
    WidgetPreferences,
    #[serde(rename = "userscript")]
    UserScript,
}

impl StorageClass {
    pub const ALL: [StorageClass; 5] = [
        StorageClass::WebDatabase,
        StorageClass::LocalStorage,
        StorageClass::SessionStorage,
        StorageClass::WidgetPreferences,
        StorageClass::UserScript,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            StorageClass::WebDatabase => "webdatabase",
            StorageClass::LocalStorage => "localstorage",
            StorageClass::SessionStorage => "sessionstorage",
            StorageClass::WidgetPreferences => "widgetpreferences",
            StorageClass::UserScript => "userscript",
        }
    }

    /// Stable number used in data file paths.
    pub fn type_number(&self) -> u8 {
        match self {
            StorageClass::WebDatabase => 1,
            StorageClass::LocalStorage => 2,
            StorageClass::SessionStorage => 3,
            StorageClass::WidgetPreferences => 4,
            StorageClass::UserScript => 5,
        }
    }

    pub fn from_type_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.type_number() == number)
    }

    /// Session storage lives only as long as the browsing session.
    pub fn can_persist(&self) -> bool {
        !matches!(self, StorageClass::SessionStorage)
    }

    pub fn index(&self) -> usize {
        self.type_number() as usize - 1
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl FromStr for StorageClass {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.description().eq_ignore_ascii_case(s))
            .ok_or_else(|| PolicyError::InvalidValue(format!("unknown storage class: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_numbers_roundtrip() {
        for class in StorageClass::ALL {
            assert_eq!(StorageClass::from_type_number(class.type_number()), Some(class));
            assert_eq!(class.description().parse::<StorageClass>().unwrap(), class);
        }
        assert_eq!(StorageClass::from_type_number(0), None);
    }

    #[test]
    fn test_session_storage_never_persists() {
        assert!(!StorageClass::SessionStorage.can_persist());
        assert!(StorageClass::LocalStorage.can_persist());
    }
}

use std::fmt;
use std::hash::{Hash, Hasher};

/// CRC32 of a name, the compact wire representation of identifiers.
pub fn name_crc(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}

/// An identifier attached to objects, fields, user types and enum values.
///
/// A label is either interned text or the CRC32 of text whose spelling has
/// been lost (compact containers store only the hash). Two labels compare
/// equal when their CRCs agree, so a text label written compactly still
/// matches its spelled-out counterpart after a round trip.
#[derive(Clone, Eq)]
pub enum Label {
    /// A spelled-out name.
    Text(String),
    /// The CRC32 of a name whose spelling is unavailable.
    Crc(u32),
}

impl Label {
    /// Builds a text label.
    pub fn text(name: impl Into<String>) -> Self {
        Self::Text(name.into())
    }

    /// The CRC32 this label compares under.
    pub fn crc(&self) -> u32 {
        match self {
            Self::Text(name) => name_crc(name),
            Self::Crc(crc) => *crc,
        }
    }

    /// The spelled-out name, if this label still carries one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(name) => Some(name.as_str()),
            Self::Crc(_) => None,
        }
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.crc() == other.crc()
    }
}

impl Hash for Label {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.crc());
    }
}

impl From<&str> for Label {
    fn from(name: &str) -> Self {
        Self::Text(name.to_owned())
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(name) => write!(f, "{:?}", name),
            Self::Crc(crc) => write!(f, "crc32:{:08x}", crc),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(name) => f.write_str(name),
            Self::Crc(crc) => write!(f, "crc32:{:08x}", crc),
        }
    }
}

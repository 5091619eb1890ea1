use crate::error::DbError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Object reference: an immutable `(type, number)` pair.
///
/// The only form of pointer between records. Resolving one always goes
/// through a session so permission filtering applies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Invid {
    type_id: u16,
    num: u32,
}

impl Invid {
    pub const fn new(type_id: u16, num: u32) -> Self {
        Self { type_id, num }
    }

    pub const fn type_id(self) -> u16 {
        self.type_id
    }

    pub const fn num(self) -> u32 {
        self.num
    }
}

impl fmt::Display for Invid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.type_id, self.num)
    }
}

impl FromStr for Invid {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (type_part, num_part) = s
            .split_once(':')
            .ok_or_else(|| DbError::Decode(format!("invid '{s}' is missing ':'")))?;
        let type_id = type_part
            .parse::<u16>()
            .map_err(|e| DbError::Decode(format!("invid type '{type_part}': {e}")))?;
        let num = num_part
            .parse::<u32>()
            .map_err(|e| DbError::Decode(format!("invid number '{num_part}': {e}")))?;
        Ok(Self::new(type_id, num))
    }
}

//! Numeric identifiers of organizations and projects.
//!
//! Both identifiers are thin wrappers over `u64`. They serialize as plain integers, so they can be
//! carried in job arguments and datastore rows without conversion.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised if an identifier cannot be parsed from a string.
#[derive(Debug, Error, Eq, Ord, PartialEq, PartialOrd)]
pub enum ParseIdError {
    /// Raised if the value is not an integer in the supported range.
    #[error("invalid value for id")]
    InvalidValue,
    /// Raised if an empty value is parsed.
    #[error("empty or missing id")]
    EmptyValue,
}

macro_rules! numeric_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Deserialize, Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new identifier from its numeric value.
            #[inline]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the numeric value of this identifier.
            #[inline]
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.value())
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, ParseIdError> {
                if s.is_empty() {
                    return Err(ParseIdError::EmptyValue);
                }

                match s.parse::<u64>() {
                    Ok(val) => Ok(Self::new(val)),
                    Err(_) => Err(ParseIdError::InvalidValue),
                }
            }
        }
    };
}

numeric_id!(
    /// The unique identifier of an organization.
    OrganizationId
);

numeric_id!(
    /// The unique identifier of a project.
    ///
    /// Project identifiers are globally unique, not only within their organization.
    ProjectId
);

//! Registered crop identifiers

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Subject crop a frame is analysed for.
///
/// The wire form is the lowercase identifier the backend registers
/// (`rice`, `wheat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Crop {
    Rice,
    Wheat,
}

impl Crop {
    /// Every crop the client accepts
    pub const ALL: [Crop; 2] = [Crop::Rice, Crop::Wheat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Crop::Rice => "rice",
            Crop::Wheat => "wheat",
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            Crop::Rice => "Rice",
            Crop::Wheat => "Wheat",
        }
    }
}

impl fmt::Display for Crop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Crop {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("crop selection is empty".to_string()));
        }
        Crop::ALL
            .into_iter()
            .find(|crop| crop.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| {
                Error::Validation(format!(
                    "unsupported crop '{}' (expected one of: {})",
                    trimmed,
                    Crop::ALL.map(|c| c.as_str()).join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("rice".parse::<Crop>().unwrap(), Crop::Rice);
        assert_eq!(" Wheat ".parse::<Crop>().unwrap(), Crop::Wheat);
        assert_eq!("RICE".parse::<Crop>().unwrap(), Crop::Rice);
    }

    #[test]
    fn test_parse_rejects_empty_and_unknown() {
        assert!(matches!("".parse::<Crop>(), Err(Error::Validation(_))));
        assert!(matches!("   ".parse::<Crop>(), Err(Error::Validation(_))));
        let err = "maize".parse::<Crop>().unwrap_err();
        assert!(err.to_string().contains("maize"));
    }

    #[test]
    fn test_wire_form() {
        assert_eq!(serde_json::to_string(&Crop::Wheat).unwrap(), "\"wheat\"");
        assert_eq!(Crop::Rice.to_string(), "rice");
        assert_eq!(Crop::Rice.label(), "Rice");
    }
}

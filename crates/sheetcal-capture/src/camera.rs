use serde::{Deserialize, Serialize};
use std::fmt;

/// Which end of the sheet a camera looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Odd,
    Even,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Odd => "odd",
            Side::Even => "even",
        })
    }
}

/// Identity of one overhead camera, rendered as `sheet{n}_{side}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CameraId {
    pub sheet: u32,
    pub side: Side,
}

impl CameraId {
    pub fn new(sheet: u32, side: Side) -> Self {
        Self { sheet, side }
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sheet{}_{}", self.sheet, self.side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_file_prefix() {
        assert_eq!(CameraId::new(4, Side::Even).to_string(), "sheet4_even");
        let json = serde_json::to_string(&CameraId::new(1, Side::Odd)).expect("json");
        assert_eq!(json, r#"{"sheet":1,"side":"odd"}"#);
    }
}

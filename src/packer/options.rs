use std::fmt;
use std::str::FromStr;

use crate::codec::CodecId;

/// How the packer picks an executable filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterChoice {
    /// Let `filter::choose` decide per codec.
    Auto,
    Bcj,
    None,
}

/// When the stub goes behind a stage-0 wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage0Mode {
    /// Wrap large stubs when wrapping makes them smaller.
    Auto,
    Always,
    Never,
}

/// An option value that isn't one of the accepted names.
#[derive(Debug, PartialEq, Eq)]
pub struct BadChoice {
    pub what: &'static str,
    pub value: String,
}

impl std::error::Error for BadChoice {}

impl fmt::Display for BadChoice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown {} {:?}", self.what, self.value)
    }
}

impl FromStr for FilterChoice {
    type Err = BadChoice;

    fn from_str(s: &str) -> Result<Self, BadChoice> {
        match s {
            "auto" => Ok(FilterChoice::Auto),
            "bcj" => Ok(FilterChoice::Bcj),
            "none" => Ok(FilterChoice::None),
            _ => Err(BadChoice { what: "filter", value: s.to_owned() }),
        }
    }
}

impl FromStr for Stage0Mode {
    type Err = BadChoice;

    fn from_str(s: &str) -> Result<Self, BadChoice> {
        match s {
            "auto" => Ok(Stage0Mode::Auto),
            "always" => Ok(Stage0Mode::Always),
            "never" => Ok(Stage0Mode::Never),
            _ => Err(BadChoice { what: "stage-0 mode", value: s.to_owned() }),
        }
    }
}

/// Everything that controls one packing run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackOptions {
    pub codec: CodecId,
    pub filter: FilterChoice,
    /// Drop section headers and trailing padding before compressing.
    pub strip: bool,
    pub password: Option<Vec<u8>>,
    pub stage0: Stage0Mode,
    /// Relocate interpreter-less position-independent images in the stub.
    pub manual_reloc: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        PackOptions {
            codec: CodecId::Lz4,
            filter: FilterChoice::Auto,
            strip: true,
            password: None,
            stage0: Stage0Mode::Auto,
            manual_reloc: false,
        }
    }
}

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ChannelError;

/// Identifies a card either by PCI address ("42:00.0") or serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardId {
    PciAddress(String),
    Serial(i32),
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardId::PciAddress(addr) => f.write_str(addr),
            CardId::Serial(serial) => write!(f, "serial-{serial}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    Crorc,
    Cru,
}

/// Where the channel's data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
    /// Card-internal data generator, looped back before the optical links.
    Internal,
    /// Loopback at the DIU.
    Diu,
    /// Loopback at the SIU.
    Siu,
    /// Real front-end electronics upstream of the SIU.
    Fee,
    /// CRU on-board data generator (DDG).
    Ddg,
}

impl DataSource {
    /// Sources that involve the optical links and therefore need DIU/SIU
    /// arming during reset.
    pub fn is_external(self) -> bool {
        matches!(self, DataSource::Diu | DataSource::Siu | DataSource::Fee)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorPattern {
    Incremental,
    Alternating,
    Constant,
    Random,
}

/// How deep a channel reset reaches. Levels are ordered: each level includes
/// everything the previous one resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResetLevel {
    None,
    /// Card logic and descriptor FIFOs.
    Internal,
    /// Internal plus the optical DIU.
    InternalDiu,
    /// Internal, DIU and SIU, with settling pauses and a link-up check.
    InternalDiuSiu,
}

impl ResetLevel {
    pub fn includes_diu(self) -> bool {
        self >= ResetLevel::InternalDiu
    }

    pub fn includes_siu(self) -> bool {
        self >= ResetLevel::InternalDiuSiu
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadoutMode {
    Continuous,
}

impl FromStr for DataSource {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INTERNAL" => Ok(DataSource::Internal),
            "DIU" => Ok(DataSource::Diu),
            "SIU" => Ok(DataSource::Siu),
            "FEE" => Ok(DataSource::Fee),
            "DDG" => Ok(DataSource::Ddg),
            _ => Err(ChannelError::InvalidParameter("unknown data source")),
        }
    }
}

impl FromStr for GeneratorPattern {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INCREMENTAL" => Ok(GeneratorPattern::Incremental),
            "ALTERNATING" => Ok(GeneratorPattern::Alternating),
            "CONSTANT" => Ok(GeneratorPattern::Constant),
            "RANDOM" => Ok(GeneratorPattern::Random),
            _ => Err(ChannelError::InvalidParameter("unknown generator pattern")),
        }
    }
}

impl FromStr for ResetLevel {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(ResetLevel::None),
            "INTERNAL" => Ok(ResetLevel::Internal),
            "INTERNAL_DIU" => Ok(ResetLevel::InternalDiu),
            "INTERNAL_DIU_SIU" => Ok(ResetLevel::InternalDiuSiu),
            _ => Err(ChannelError::InvalidParameter("unknown reset level")),
        }
    }
}

impl FromStr for ReadoutMode {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONTINUOUS" => Ok(ReadoutMode::Continuous),
            _ => Err(ChannelError::InvalidParameter("unknown readout mode")),
        }
    }
}

/// Immutable per-session channel configuration.
///
/// Built once when the client's options are parsed; the card family is known
/// here, so engine dispatch happens exactly once at construction.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub card_id: CardId,
    pub card_type: CardType,
    pub channel_number: u32,
    pub dma_page_size: u64,
    pub data_source: DataSource,
    pub generator_pattern: GeneratorPattern,
    pub readout_mode: Option<ReadoutMode>,
    /// CRORC only: use the STBRD handshake instead of RDYRX when the
    /// generator is disabled.
    pub stbrd_enabled: bool,
    /// CRU only: which links participate in DMA.
    pub link_mask: Vec<u32>,
    /// Directory for the per-channel lock and descriptor-ring files.
    pub state_dir: PathBuf,
}

impl Parameters {
    pub fn new(card_id: CardId, card_type: CardType, channel_number: u32) -> Self {
        Parameters {
            card_id,
            card_type,
            channel_number,
            dma_page_size: 8 * 1024,
            data_source: DataSource::Internal,
            generator_pattern: GeneratorPattern::Incremental,
            readout_mode: None,
            stbrd_enabled: false,
            link_mask: vec![0],
            state_dir: std::env::temp_dir().join("rocard"),
        }
    }

    pub fn dma_page_size(mut self, size: u64) -> Self {
        self.dma_page_size = size;
        self
    }

    pub fn data_source(mut self, source: DataSource) -> Self {
        self.data_source = source;
        self
    }

    pub fn generator_pattern(mut self, pattern: GeneratorPattern) -> Self {
        self.generator_pattern = pattern;
        self
    }

    pub fn readout_mode(mut self, mode: ReadoutMode) -> Self {
        self.readout_mode = Some(mode);
        self
    }

    pub fn stbrd_enabled(mut self, enabled: bool) -> Self {
        self.stbrd_enabled = enabled;
        self
    }

    pub fn link_mask(mut self, links: Vec<u32>) -> Self {
        self.link_mask = links;
        self
    }

    pub fn state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = dir;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_levels_are_ordered() {
        assert!(ResetLevel::None < ResetLevel::Internal);
        assert!(ResetLevel::Internal < ResetLevel::InternalDiu);
        assert!(ResetLevel::InternalDiu < ResetLevel::InternalDiuSiu);
        assert!(ResetLevel::InternalDiuSiu.includes_diu());
        assert!(!ResetLevel::Internal.includes_diu());
    }

    #[test]
    fn enums_parse_from_cli_spelling() {
        assert_eq!(
            "incremental".parse::<GeneratorPattern>().unwrap(),
            GeneratorPattern::Incremental
        );
        assert_eq!("FEE".parse::<DataSource>().unwrap(), DataSource::Fee);
        assert!("bogus".parse::<DataSource>().is_err());
    }
}

use std::path::{Path, PathBuf};

use crate::params::CardId;

/// Per-(card, channel) file locations under the state directory: the
/// descriptor-ring backing, the optional DMA buffer file and the channel
/// lock.
#[derive(Debug, Clone)]
pub struct ChannelPaths {
    stem: PathBuf,
}

impl ChannelPaths {
    pub fn new(state_dir: &Path, card_id: &CardId, channel: u32) -> Self {
        // PCI addresses contain ':' and '.', which make poor file names.
        let id: String = card_id
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        ChannelPaths {
            stem: state_dir.join(format!("rocard_{id}_ch{channel}")),
        }
    }

    pub fn fifo(&self) -> PathBuf {
        self.with_extension("fifo")
    }

    pub fn buffer(&self) -> PathBuf {
        self.with_extension("buffer")
    }

    pub fn lock(&self) -> PathBuf {
        self.with_extension("lock")
    }

    fn with_extension(&self, ext: &str) -> PathBuf {
        let mut path = self.stem.clone();
        path.set_extension(ext);
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_distinct_per_channel_and_sanitized() {
        let id = CardId::PciAddress("42:00.0".into());
        let a = ChannelPaths::new(Path::new("/tmp/state"), &id, 0);
        let b = ChannelPaths::new(Path::new("/tmp/state"), &id, 1);
        assert_ne!(a.lock(), b.lock());
        let lock = a.lock();
        let name = lock.file_name().unwrap().to_str().unwrap();
        assert!(!name.contains(':'));
        assert!(name.starts_with("rocard_42_00_0_ch0"));
    }
}

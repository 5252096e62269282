//! Speaker positions and channel layouts

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Named speaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Front left
    FL,
    /// Front right
    FR,
    /// Front center
    FC,
    /// Low frequency effects
    LFE,
    /// Back left
    BL,
    /// Back right
    BR,
    /// Front left of center
    FLOC,
    /// Front right of center
    FROC,
    /// Back center
    BC,
    /// Side left
    SL,
    /// Side right
    SR,
    /// Top center
    TC,
}

impl Channel {
    pub fn name(self) -> &'static str {
        match self {
            Channel::FL => "FL",
            Channel::FR => "FR",
            Channel::FC => "FC",
            Channel::LFE => "LFE",
            Channel::BL => "BL",
            Channel::BR => "BR",
            Channel::FLOC => "FLOC",
            Channel::FROC => "FROC",
            Channel::BC => "BC",
            Channel::SL => "SL",
            Channel::SR => "SR",
            Channel::TC => "TC",
        }
    }
}

use Channel::*;

const LAYOUT_2_0: &[Channel] = &[FL, FR];
const LAYOUT_2_1: &[Channel] = &[FL, FR, LFE];
const LAYOUT_3_0: &[Channel] = &[FL, FR, FC];
const LAYOUT_3_1: &[Channel] = &[FL, FR, FC, LFE];
const LAYOUT_4_0: &[Channel] = &[FL, FR, BL, BR];
const LAYOUT_4_1: &[Channel] = &[FL, FR, BL, BR, LFE];
const LAYOUT_5_0: &[Channel] = &[FL, FR, FC, BL, BR];
const LAYOUT_5_1: &[Channel] = &[FL, FR, FC, LFE, BL, BR];
const LAYOUT_7_0: &[Channel] = &[FL, FR, FC, BL, BR, SL, SR];
const LAYOUT_7_1: &[Channel] = &[FL, FR, FC, LFE, BL, BR, SL, SR];

/// Forced-channel setting index to layout. Index 0 and 1 both mean stereo.
const SETTING_LAYOUTS: [&[Channel]; 11] = [
    LAYOUT_2_0, LAYOUT_2_0, LAYOUT_2_1, LAYOUT_3_0, LAYOUT_3_1, LAYOUT_4_0, LAYOUT_4_1,
    LAYOUT_5_0, LAYOUT_5_1, LAYOUT_7_0, LAYOUT_7_1,
];

/// Ordered list of speaker positions. Index `i` is the `i`th channel of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelLayout(SmallVec<[Channel; 8]>);

impl ChannelLayout {
    pub fn new(channels: &[Channel]) -> Self {
        Self(SmallVec::from_slice(channels))
    }

    pub fn mono() -> Self {
        Self::new(&[FC])
    }

    pub fn stereo() -> Self {
        Self::new(LAYOUT_2_0)
    }

    pub fn surround_5_1() -> Self {
        Self::new(LAYOUT_5_1)
    }

    pub fn surround_7_1() -> Self {
        Self::new(LAYOUT_7_1)
    }

    /// Layout selected by the forced-channel setting (0..=10). Out-of-range
    /// values clamp to 7.1.
    pub fn from_setting(setting: u8) -> Self {
        let index = (setting as usize).min(SETTING_LAYOUTS.len() - 1);
        Self::new(SETTING_LAYOUTS[index])
    }

    /// Default WAV/WAVEFORMATEXTENSIBLE ordering for a plain channel count.
    pub fn for_count(count: usize) -> Option<Self> {
        let channels: &[Channel] = match count {
            1 => &[FC],
            2 => LAYOUT_2_0,
            3 => LAYOUT_2_1,
            4 => LAYOUT_4_0,
            5 => LAYOUT_4_1,
            6 => LAYOUT_5_1,
            7 => LAYOUT_7_0,
            8 => LAYOUT_7_1,
            _ => return None,
        };
        Some(Self::new(channels))
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0.contains(&channel)
    }

    pub fn position(&self, channel: Channel) -> Option<usize> {
        self.0.iter().position(|&c| c == channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[Channel] {
        &self.0
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, channel) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(channel.name())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_setting_table() {
        assert_eq!(ChannelLayout::from_setting(0), ChannelLayout::stereo());
        assert_eq!(ChannelLayout::from_setting(1), ChannelLayout::stereo());
        assert_eq!(ChannelLayout::from_setting(2).count(), 3);
        assert_eq!(ChannelLayout::from_setting(8), ChannelLayout::surround_5_1());
        assert_eq!(ChannelLayout::from_setting(10), ChannelLayout::surround_7_1());
        // Out of range clamps
        assert_eq!(ChannelLayout::from_setting(42), ChannelLayout::surround_7_1());
    }

    #[test]
    fn test_for_count() {
        assert_eq!(ChannelLayout::for_count(1), Some(ChannelLayout::mono()));
        assert_eq!(ChannelLayout::for_count(6), Some(ChannelLayout::surround_5_1()));
        assert_eq!(ChannelLayout::for_count(0), None);
        assert_eq!(ChannelLayout::for_count(9), None);
    }

    #[test]
    fn test_position_and_contains() {
        let layout = ChannelLayout::surround_5_1();
        assert_eq!(layout.position(Channel::LFE), Some(3));
        assert!(layout.contains(Channel::BR));
        assert!(!layout.contains(Channel::SL));
    }
}

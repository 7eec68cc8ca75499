//! Flash progress reporting.

use std::fmt;

/// Phase of a flash run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum FlashState {
    /// Nothing has happened yet.
    Started = 0,
    /// Syncing with the boot ROM.
    Connecting = 1,
    /// The ROM answered.
    Connected = 2,
    /// Erasing flash.
    Erasing = 3,
    /// Flash erased.
    Erased = 4,
    /// Writing partitions.
    Writing = 5,
    /// The run failed.
    Failed = 6,
    /// All partitions written.
    Success = 7,
}

impl FlashState {
    /// Whether the run is over.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Success)
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "Warming up"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Erasing => write!(f, "Erasing flash"),
            Self::Erased => write!(f, "Flash erased"),
            Self::Writing => write!(f, "Writing"),
            Self::Failed => write!(f, "Failed"),
            Self::Success => write!(f, "Done"),
        }
    }
}

/// Position within the partition being written.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashDetails {
    /// Partition name.
    pub partition: String,
    /// Index of the block just written.
    pub idx: usize,
    /// Number of blocks in the partition.
    pub total: usize,
}

/// Payload of the structured progress callback.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashProgress {
    /// Current phase.
    pub state: FlashState,
    /// Set only while writing.
    pub details: Option<FlashDetails>,
}

impl FlashProgress {
    /// Progress without details.
    pub fn state(state: FlashState) -> Self {
        Self {
            state,
            details: None,
        }
    }

    /// Progress of a block write.
    pub fn writing(partition: &str, idx: usize, total: usize) -> Self {
        Self {
            state: FlashState::Writing,
            details: Some(FlashDetails {
                partition: partition.to_string(),
                idx,
                total,
            }),
        }
    }

    /// Overall percentage for a progress bar. `None` once failed.
    ///
    /// Writing progress is per partition: it restarts at 35 for every
    /// partition.
    pub fn percentage(&self) -> Option<f64> {
        let value = match self.state {
            FlashState::Started | FlashState::Connecting => 0.0,
            FlashState::Connected | FlashState::Erasing => 10.0,
            FlashState::Erased => 35.0,
            FlashState::Writing => match &self.details {
                Some(d) if d.total > 0 => {
                    #[allow(clippy::cast_precision_loss)]
                    let fraction = (d.idx as f64 / d.total as f64).min(1.0);
                    35.0 + fraction * 65.0
                },
                _ => 35.0,
            },
            FlashState::Success => 100.0,
            FlashState::Failed => return None,
        };
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(FlashState::Started as u8, 0);
        assert_eq!(FlashState::Writing as u8, 5);
        assert_eq!(FlashState::Success as u8, 7);
    }

    #[test]
    fn test_terminal_states() {
        assert!(FlashState::Failed.is_terminal());
        assert!(FlashState::Success.is_terminal());
        assert!(!FlashState::Writing.is_terminal());
    }

    #[test]
    fn test_percentage_phases() {
        assert_eq!(FlashProgress::state(FlashState::Connecting).percentage(), Some(0.0));
        assert_eq!(FlashProgress::state(FlashState::Connected).percentage(), Some(10.0));
        assert_eq!(FlashProgress::state(FlashState::Erased).percentage(), Some(35.0));
        assert_eq!(FlashProgress::writing("jaguar", 0, 4).percentage(), Some(35.0));
        assert_eq!(FlashProgress::writing("jaguar", 2, 4).percentage(), Some(67.5));
        assert_eq!(FlashProgress::writing("jaguar", 4, 4).percentage(), Some(100.0));
        assert_eq!(FlashProgress::writing("jaguar", 1, 0).percentage(), Some(35.0));
        assert_eq!(FlashProgress::state(FlashState::Success).percentage(), Some(100.0));
        assert_eq!(FlashProgress::state(FlashState::Failed).percentage(), None);
    }
}

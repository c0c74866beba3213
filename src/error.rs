// src/error.rs

use crate::voice::VoiceId;

/// Error raised by pool or routing entry points.
///
/// Nothing here is fatal: every variant describes a rejected request,
/// and the engine state is left untouched when one is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    /// Voice index outside the pool.
    InvalidVoice(VoiceId),

    /// MIDI channel outside 0..16.
    InvalidChannel(usize),

    /// Modulation destination id outside 0x00..=0x8F, or a field
    /// reserved within its block.
    InvalidDestination(u8),

    /// Modulation source id outside 0..=11.
    InvalidSource(u8),

    /// A source or destination that only exists on 4-operator voices
    /// was routed on a 2-operator voice. Carries the offending id.
    FourOpOnly(u8),

    /// DUPL/LINK requested between voices of differing operator counts.
    OperatorCountMismatch { master: VoiceId, follower: VoiceId },

    /// 4-operator toggle conflicts with an existing DUPL/LINK
    /// relationship or with the chip topology.
    FourOpConflict(VoiceId),

    /// The voice's modulation connection table has no free slot.
    ConnectionTableFull(VoiceId),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidVoice(v) => write!(f, "Voice {} does not exist", v),
            EngineError::InvalidChannel(c) => write!(f, "Channel {} does not exist", c),
            EngineError::InvalidDestination(d) => {
                write!(f, "Modulation destination {:#04x} is not valid", d)
            }
            EngineError::InvalidSource(s) => write!(f, "Modulation source {} is not valid", s),
            EngineError::FourOpOnly(id) => {
                write!(f, "Modulation id {:#04x} requires a 4-operator voice", id)
            }
            EngineError::OperatorCountMismatch { master, follower } => write!(
                f,
                "Voices {} and {} have different operator counts",
                master, follower
            ),
            EngineError::FourOpConflict(v) => {
                write!(f, "Voice {} cannot change 4-operator mode", v)
            }
            EngineError::ConnectionTableFull(v) => {
                write!(f, "Voice {} has no free modulation slot", v)
            }
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

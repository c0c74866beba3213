// src/chip.rs
//
// Boundary traits for the external collaborators: the sound chip
// driver and the UI/host feedback path.

use crate::voice::VoiceId;

/// Per-operator register classes the engine writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpRegister {
    Waveform,
    Multiplier,
    Attack,
    Decay,
    Sustain,
    Release,
    Volume,
    Vibrato,
    Tremolo,
    KeyScaleLevel,
    KeyScaleRate,
    SustainEnable,
}

/// Register-level chip driver.
///
/// Writes are fire-and-forget: the driver never reports errors back
/// and the engine never waits on it. Register layout is the driver's
/// problem; the engine only speaks in final values.
pub trait ChipDriver {
    fn set_operator(&mut self, voice: VoiceId, op: usize, reg: OpRegister, value: u8);

    fn set_algorithm(&mut self, voice: VoiceId, algorithm: u8, feedback: u8);

    /// Output bus enables as a bitmask (bit 0 left, bit 1 right).
    fn set_output_bus(&mut self, voice: VoiceId, mask: u8);

    fn set_four_op(&mut self, voice: VoiceId, enabled: bool);

    fn set_frequency(&mut self, voice: VoiceId, block: u8, fnum: u16);

    fn gate(&mut self, voice: VoiceId, on: bool);
}

/// Feedback path to the UI collaborator.
///
/// Default impls do nothing so headless hosts can ignore it.
pub trait Host {
    /// A voice started or stopped sounding.
    fn voice_activity(&mut self, _voice: VoiceId, _active: bool) {}

    /// A channel wants a patch loaded (auto-load or program change).
    fn request_patch(&mut self, _channel: usize, _bank: u16, _program: u8) {}
}

/// Driver that discards every write.
#[derive(Debug, Default)]
pub struct NullChip;

impl ChipDriver for NullChip {
    fn set_operator(&mut self, _: VoiceId, _: usize, _: OpRegister, _: u8) {}
    fn set_algorithm(&mut self, _: VoiceId, _: u8, _: u8) {}
    fn set_output_bus(&mut self, _: VoiceId, _: u8) {}
    fn set_four_op(&mut self, _: VoiceId, _: bool) {}
    fn set_frequency(&mut self, _: VoiceId, _: u8, _: u16) {}
    fn gate(&mut self, _: VoiceId, _: bool) {}
}

/// Host that ignores all feedback.
#[derive(Debug, Default)]
pub struct NullHost;

impl Host for NullHost {}

/// One recorded chip write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipWrite {
    Operator {
        voice: VoiceId,
        op: usize,
        reg: OpRegister,
        value: u8,
    },
    Algorithm {
        voice: VoiceId,
        algorithm: u8,
        feedback: u8,
    },
    OutputBus {
        voice: VoiceId,
        mask: u8,
    },
    FourOp {
        voice: VoiceId,
        enabled: bool,
    },
    Frequency {
        voice: VoiceId,
        block: u8,
        fnum: u16,
    },
    Gate {
        voice: VoiceId,
        on: bool,
    },
}

/// Driver that records every write, for tests and the demo binary.
#[derive(Debug, Default)]
pub struct CaptureChip {
    pub writes: Vec<ChipWrite>,
}

impl CaptureChip {
    pub fn new() -> Self {
        Self { writes: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.writes.clear();
    }

    /// Last frequency write for a voice, if any.
    pub fn last_frequency(&self, voice: VoiceId) -> Option<(u8, u16)> {
        self.writes.iter().rev().find_map(|w| match w {
            ChipWrite::Frequency {
                voice: v,
                block,
                fnum,
            } if *v == voice => Some((*block, *fnum)),
            _ => None,
        })
    }

    /// Last value written to an operator register, if any.
    pub fn last_operator(&self, voice: VoiceId, op: usize, reg: OpRegister) -> Option<u8> {
        self.writes.iter().rev().find_map(|w| match w {
            ChipWrite::Operator {
                voice: v,
                op: o,
                reg: r,
                value,
            } if *v == voice && *o == op && *r == reg => Some(*value),
            _ => None,
        })
    }

    /// Last gate state written for a voice, if any.
    pub fn last_gate(&self, voice: VoiceId) -> Option<bool> {
        self.writes.iter().rev().find_map(|w| match w {
            ChipWrite::Gate { voice: v, on } if *v == voice => Some(*on),
            _ => None,
        })
    }
}

impl ChipDriver for CaptureChip {
    fn set_operator(&mut self, voice: VoiceId, op: usize, reg: OpRegister, value: u8) {
        self.writes.push(ChipWrite::Operator {
            voice,
            op,
            reg,
            value,
        });
    }

    fn set_algorithm(&mut self, voice: VoiceId, algorithm: u8, feedback: u8) {
        self.writes.push(ChipWrite::Algorithm {
            voice,
            algorithm,
            feedback,
        });
    }

    fn set_output_bus(&mut self, voice: VoiceId, mask: u8) {
        self.writes.push(ChipWrite::OutputBus { voice, mask });
    }

    fn set_four_op(&mut self, voice: VoiceId, enabled: bool) {
        self.writes.push(ChipWrite::FourOp { voice, enabled });
    }

    fn set_frequency(&mut self, voice: VoiceId, block: u8, fnum: u16) {
        self.writes.push(ChipWrite::Frequency { voice, block, fnum });
    }

    fn gate(&mut self, voice: VoiceId, on: bool) {
        self.writes.push(ChipWrite::Gate { voice, on });
    }
}

/// Host that records activity transitions and patch requests.
#[derive(Debug, Default)]
pub struct CaptureHost {
    pub activity: Vec<(VoiceId, bool)>,
    pub patch_requests: Vec<(usize, u16, u8)>,
}

impl Host for CaptureHost {
    fn voice_activity(&mut self, voice: VoiceId, active: bool) {
        self.activity.push((voice, active));
    }

    fn request_patch(&mut self, channel: usize, bank: u16, program: u8) {
        self.patch_requests.push((channel, bank, program));
    }
}

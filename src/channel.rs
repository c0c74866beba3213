// src/channel.rs

use crate::config::ChannelDefaults;
use crate::notestack::NoteStack;
use crate::voice::VoiceId;

pub const CHANNEL_COUNT: usize = 16;

/// Per-channel options, settable at runtime.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    /// Copy the first voice's parameters onto voices joining the
    /// channel (DUPL).
    pub auto_duplicate: bool,

    /// Request a patch load when a voice joins an empty channel.
    pub auto_load: bool,

    /// Per-CC forwarding enables.
    pub forward_volume: bool,
    pub forward_expression: bool,
    pub forward_pan: bool,
}

impl From<ChannelDefaults> for ChannelOptions {
    fn from(d: ChannelDefaults) -> Self {
        Self {
            auto_duplicate: d.auto_duplicate,
            auto_load: d.auto_load,
            forward_volume: d.forward_volume,
            forward_expression: d.forward_expression,
            forward_pan: d.forward_pan,
        }
    }
}

/// State of one MIDI channel.
#[derive(Debug)]
pub struct Channel {
    /// First voice assigned to the channel; parameter source for DUPL.
    pub first_voice: Option<VoiceId>,

    /// Round-robin pointer into the channel's voice set: the next
    /// steal victim.
    pub round_robin: Option<VoiceId>,

    pub options: ChannelOptions,

    /// CC 7 / CC 11 levels.
    pub volume: u8,
    pub expression: u8,

    /// CC 10, 64 = center.
    pub pan: u8,

    /// Sustain pedal down.
    pub sustain: bool,

    /// -8192..=8191.
    pub pitch_bend: i16,

    /// Soft modulation sources.
    pub mod_wheel: u8,
    pub variation: u8,

    /// Latched bank-select (MSB << 7 | LSB).
    pub pending_bank: u16,

    /// Notes parked while their voice was stolen.
    pub notestack: NoteStack,
}

impl Channel {
    pub fn new(options: ChannelOptions, notestack_depth: usize) -> Self {
        Self {
            first_voice: None,
            round_robin: None,
            options,
            volume: 127,
            expression: 127,
            pan: 64,
            sustain: false,
            pitch_bend: 0,
            mod_wheel: 0,
            variation: 0,
            pending_bank: 0,
            notestack: NoteStack::new(notestack_depth),
        }
    }

    /// Combined volume/expression scale in 0..=16384 (14-bit-ish),
    /// honoring the forwarding enables.
    pub fn level_scale(&self) -> u32 {
        let vol = if self.options.forward_volume {
            self.volume as u32
        } else {
            127
        };
        let expr = if self.options.forward_expression {
            self.expression as u32
        } else {
            127
        };
        vol * expr
    }

    /// Scale an operator volume (0..=63) by the channel levels.
    pub fn scale_volume(&self, volume: u8) -> u8 {
        (volume as u32 * self.level_scale() / (127 * 127)) as u8
    }

    /// Output bus mask derived from pan: hard left/right mutes one
    /// side, anything else enables both.
    pub fn pan_bus_mask(&self) -> u8 {
        if self.pan < 32 {
            0b01
        } else if self.pan > 96 {
            0b10
        } else {
            0b11
        }
    }
}

// src/voice.rs
//
// Per-voice state. A voice is one independently pitched/gated
// synthesis unit: 2 operators, or 4 when it leads a 4-operator pair.
//
// Voices do not talk to the chip themselves; the engine reads their
// state each tick and pushes final values to the driver.

use crate::modulator::{ModConfigs, ModulatorBank};
use crate::routing::ConnectionTable;

pub type VoiceId = usize;

/// A note/velocity pair with its update and retrigger flags.
///
/// `velocity == 0` means silent; the note number is retained so the
/// allocator can prefer a voice whose last note matches a new one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoteSlot {
    pub note: u8,
    pub velocity: u8,
    pub updated: bool,
    pub retrig: bool,
}

impl NoteSlot {
    #[inline]
    pub fn sounding(&self) -> bool {
        self.velocity > 0
    }
}

/// DUPL/LINK relationship of a voice toward its master.
///
/// A voice has at most one of the two at a time; that invariant is
/// structural here (a single field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Relation {
    #[default]
    None,

    /// Parameter copy of `master`. With `follow`, parameter edits on
    /// the master are re-copied live.
    Dupl { master: VoiceId, follow: bool },

    /// Note/pitch mirror of `master`; never independently allocated.
    Link { master: VoiceId },
}

impl Relation {
    pub fn is_none(&self) -> bool {
        matches!(self, Relation::None)
    }

    pub fn is_link(&self) -> bool {
        matches!(self, Relation::Link { .. })
    }

    pub fn is_dupl(&self) -> bool {
        matches!(self, Relation::Dupl { .. })
    }

    pub fn master(&self) -> Option<VoiceId> {
        match self {
            Relation::None => None,
            Relation::Dupl { master, .. } | Relation::Link { master } => Some(*master),
        }
    }
}

/// Per-operator parameters (base values; the modulation pass combines
/// these with routed deltas before anything reaches the chip).
#[derive(Debug, Clone, Copy)]
pub struct OperatorParams {
    pub waveform: u8,
    pub multiplier: u8,
    pub attack: u8,
    pub decay: u8,
    pub sustain: u8,
    pub release: u8,
    pub volume: u8,
    pub vibrato: bool,
    pub tremolo: bool,
    pub key_scale_level: u8,
    pub key_scale_rate: bool,
    pub sustain_enable: bool,
    pub mute: bool,
    /// Velocity sensitivity of the operator volume, 0..=7.
    pub key_velocity: u8,
}

impl Default for OperatorParams {
    fn default() -> Self {
        Self {
            waveform: 0,
            multiplier: 1,
            attack: 12,
            decay: 8,
            sustain: 8,
            release: 6,
            volume: 48,
            vibrato: false,
            tremolo: false,
            key_scale_level: 0,
            key_scale_rate: false,
            sustain_enable: true,
            mute: false,
            key_velocity: 0,
        }
    }
}

/// Voice-level parameters (base values).
#[derive(Debug, Clone)]
pub struct VoiceParams {
    /// Half-step transpose, centered at 64.
    pub transpose: u8,
    /// Fine tune over +-1 half-step, centered at 64.
    pub tune: u8,
    /// Portamento time code.
    pub portamento: u8,
    /// Note delay in delay-line steps.
    pub delay: u8,
    /// Coarse delay range switch: delay counts x4.
    pub delay_scale: bool,
    pub feedback: u8,
    pub algorithm: u8,
    /// Restart the envelope clocks when the delayed note changes.
    pub retrigger_on_change: bool,
    /// Output bus enables (bit 0 left, bit 1 right).
    pub out_bus: u8,
    /// Percussion-class voices skip explicit gate calls and rely on
    /// trigger pulses.
    pub percussion: bool,
    /// Pitch-bend range in half-steps.
    pub bend_range: u8,
    /// Base configs of the per-voice modulators.
    pub mods: ModConfigs,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            transpose: 64,
            tune: 64,
            portamento: 0,
            delay: 0,
            delay_scale: false,
            feedback: 0,
            algorithm: 0,
            retrigger_on_change: true,
            out_bus: 0b11,
            percussion: false,
            bend_range: 2,
            mods: ModConfigs::default(),
        }
    }
}

/// Per-operator live state for the fields with no chip register of
/// their own; they only influence the computed volume write.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveOp {
    pub mute: bool,
    pub key_velocity: u8,
}

/// Post-modulation parameter values consumed by the tick.
///
/// Refreshed from the base `VoiceParams` and then overwritten by the
/// apply pass wherever a routing touches them.
#[derive(Debug, Clone)]
pub struct LiveParams {
    pub transpose: u8,
    pub tune: u8,
    pub portamento: u8,
    pub delay: u8,
    pub mods: ModConfigs,
}

impl LiveParams {
    pub fn from_params(params: &VoiceParams) -> Self {
        Self {
            transpose: params.transpose,
            tune: params.tune,
            portamento: params.portamento,
            delay: params.delay,
            mods: params.mods,
        }
    }

    pub fn refresh(&mut self, params: &VoiceParams) {
        *self = Self::from_params(params);
    }
}

/// One delay-line entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelayCell {
    pub note: u8,
    pub velocity: u8,
    pub retrig: bool,
}

/// Fixed-length ring buffer of note events feeding the pitch pipeline.
///
/// The head slot always holds "now"; reading at offset `d` yields the
/// state as of `d` delay-steps ago.
#[derive(Debug, Clone)]
pub struct DelayLine {
    cells: Vec<DelayCell>,
    head: usize,
}

impl DelayLine {
    pub fn new(len: usize) -> Self {
        Self {
            cells: vec![DelayCell::default(); len.max(1)],
            head: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Advance the head by `steps`, writing `cell` at each advanced
    /// slot, then refresh the head slot with `cell`.
    pub fn advance(&mut self, steps: u64, cell: DelayCell) {
        let len = self.cells.len();
        for _ in 0..steps.min(len as u64) {
            self.head = (self.head + 1) % len;
            self.cells[self.head] = cell;
        }
        self.cells[self.head] = cell;
    }

    /// Read `offset` steps back from now.
    pub fn read(&self, offset: usize) -> DelayCell {
        let len = self.cells.len();
        let off = offset.min(len - 1);
        self.cells[(self.head + len - off) % len]
    }

    /// Whether a retrigger flag entered the read window this tick:
    /// the `steps` cells that just moved past the read offset.
    pub fn retrig_seen(&self, offset: usize, steps: u64) -> bool {
        let len = self.cells.len();
        let span = (steps as usize).min(len);
        (0..span).any(|i| self.read(offset.saturating_add(i)).retrig)
    }

    pub fn clear(&mut self) {
        self.cells.fill(DelayCell::default());
    }
}

/// One synthesis voice and everything the tick needs to drive it.
#[derive(Debug, Clone)]
pub struct Voice {
    pub id: VoiceId,

    /// Assigned MIDI channel, if any.
    pub channel: Option<usize>,

    /// Raw note state written by the MIDI side.
    pub raw: NoteSlot,

    /// Post-delay "actual" note state driving pitch and gating.
    pub actual: NoteSlot,

    /// Held by the sustain pedal: note-off was deferred.
    pub sustain_held: bool,

    /// Activity indicator for the UI.
    pub active_indicator: bool,

    /// Channel volume/expression changed; operator volumes need a
    /// refresh on the next tick.
    pub volume_refresh: bool,

    /// All destination base values need a refresh (note-on, retrigger,
    /// parameter edit).
    pub refresh_all: bool,

    /// Pitch-affecting state changed outside the delay line (bend,
    /// transpose routing, tuning switch).
    pub pitch_dirty: bool,

    pub relation: Relation,

    /// Leading half of a 4-operator pair.
    pub four_op: bool,

    /// Trailing half of a 4-operator pair; skipped by allocation and
    /// by the tick.
    pub trailing_half: bool,

    pub params: VoiceParams,
    pub ops: [OperatorParams; 4],
    pub connections: ConnectionTable,
    pub bank: ModulatorBank,
    pub live: LiveParams,
    pub live_ops: [LiveOp; 4],
    pub delay_line: DelayLine,

    /// Portamento interpolation state.
    pub porta_from: u8,
    pub porta_start: u64,

    /// Last gate state written to the chip.
    pub gated: bool,

    /// Mid-retrigger: gated off this tick, re-gate next tick.
    pub retrig_wait: bool,
}

impl Voice {
    pub fn new(id: VoiceId, delay_line_len: usize) -> Self {
        let params = VoiceParams::default();
        let live = LiveParams::from_params(&params);
        Self {
            id,
            channel: None,
            raw: NoteSlot::default(),
            actual: NoteSlot::default(),
            sustain_held: false,
            active_indicator: false,
            volume_refresh: false,
            refresh_all: false,
            pitch_dirty: false,
            relation: Relation::None,
            four_op: false,
            trailing_half: false,
            params,
            ops: [OperatorParams::default(); 4],
            connections: ConnectionTable::new(),
            bank: ModulatorBank::new(0x9E37_79B9u32.wrapping_mul(id as u32 + 1)),
            live,
            live_ops: [LiveOp::default(); 4],
            delay_line: DelayLine::new(delay_line_len),
            porta_from: 0,
            porta_start: 0,
            gated: false,
            retrig_wait: false,
        }
    }

    /// Operators in play: 4 for a pair leader, otherwise 2.
    pub fn operator_count(&self) -> usize {
        if self.four_op { 4 } else { 2 }
    }

    /// Effective note delay in delay-line steps.
    pub fn delay_steps(&self) -> usize {
        let base = self.live.delay as usize;
        if self.params.delay_scale { base * 4 } else { base }
    }

    /// Eligible for independent note allocation.
    pub fn selectable(&self) -> bool {
        !self.relation.is_link() && !self.trailing_half
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_line_zero_offset_sees_now() {
        let mut line = DelayLine::new(8);
        line.advance(
            0,
            DelayCell {
                note: 60,
                velocity: 100,
                retrig: true,
            },
        );
        assert_eq!(line.read(0).note, 60);
    }

    #[test]
    fn test_delay_line_offset_reads_past() {
        let mut line = DelayLine::new(8);
        line.advance(
            1,
            DelayCell {
                note: 60,
                velocity: 100,
                retrig: false,
            },
        );
        line.advance(
            3,
            DelayCell {
                note: 64,
                velocity: 90,
                retrig: false,
            },
        );
        assert_eq!(line.read(0).note, 64);
        assert_eq!(line.read(3).note, 60);
    }

    #[test]
    fn test_retrig_enters_read_window_once() {
        let mut line = DelayLine::new(16);
        line.advance(
            1,
            DelayCell {
                note: 60,
                velocity: 100,
                retrig: true,
            },
        );
        // Immediate read sees the retrig as it arrives.
        assert!(line.retrig_seen(0, 1));

        // After 4 clean steps the old retrig is behind the window.
        line.advance(
            4,
            DelayCell {
                note: 60,
                velocity: 100,
                retrig: false,
            },
        );
        assert!(!line.retrig_seen(0, 4));
    }

    #[test]
    fn test_retrig_seen_through_delayed_window() {
        let mut line = DelayLine::new(16);
        line.advance(
            1,
            DelayCell {
                note: 60,
                velocity: 100,
                retrig: true,
            },
        );
        line.advance(
            3,
            DelayCell {
                note: 60,
                velocity: 100,
                retrig: false,
            },
        );
        // Reading 2 steps back after advancing 3: the retrig cell
        // passed through the window.
        assert!(line.retrig_seen(2, 3));
        assert!(!line.retrig_seen(0, 1));
    }

    #[test]
    fn test_relation_is_exclusive_by_construction() {
        let mut voice = Voice::new(0, 8);
        voice.relation = Relation::Dupl {
            master: 1,
            follow: true,
        };
        assert!(voice.relation.is_dupl() && !voice.relation.is_link());
        voice.relation = Relation::Link { master: 2 };
        assert!(voice.relation.is_link() && !voice.relation.is_dupl());
    }
}

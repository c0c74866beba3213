// src/routing.rs
//
// The modulation routing tables: the closed source and destination
// id spaces, the per-voice connection list, and the per-tick delta
// accumulator consumed by the apply pass.

use crate::error::{EngineError, EngineResult};

/// Maximum modulation connections per voice.
pub const MAX_CONNECTIONS: usize = 8;

/// Size of the destination id space (0x00..=0x8F).
pub const DEST_SPACE: usize = 0x90;

// ═══════════════════════════════════════════════════════════════════
// Sources
// ═══════════════════════════════════════════════════════════════════

/// A modulation source. Ids 0..=11 on the wire.
///
/// The eight "hardware-style" sources (EG/LFO/WT) are evaluated once
/// per tick and cached so that connections sharing a source see
/// identical values. The three soft sources are read directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModSource {
    None,
    Eg(usize),
    Lfo(usize),
    Wt(usize),
    Velocity,
    ModWheel,
    Variation,
}

impl ModSource {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ModSource::None),
            1..=2 => Some(ModSource::Eg((id - 1) as usize)),
            3..=6 => Some(ModSource::Lfo((id - 3) as usize)),
            7..=8 => Some(ModSource::Wt((id - 7) as usize)),
            9 => Some(ModSource::Velocity),
            10 => Some(ModSource::ModWheel),
            11 => Some(ModSource::Variation),
            _ => None,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            ModSource::None => 0,
            ModSource::Eg(i) => 1 + *i as u8,
            ModSource::Lfo(i) => 3 + *i as u8,
            ModSource::Wt(i) => 7 + *i as u8,
            ModSource::Velocity => 9,
            ModSource::ModWheel => 10,
            ModSource::Variation => 11,
        }
    }

    /// Cache slot for hardware-style sources; `None` for soft ones.
    pub fn cache_slot(&self) -> Option<usize> {
        match self {
            ModSource::Eg(i) => Some(*i),
            ModSource::Lfo(i) => Some(2 + *i),
            ModSource::Wt(i) => Some(6 + *i),
            _ => None,
        }
    }

    /// Sources only present on 4-operator voices.
    pub fn requires_four_op(&self) -> bool {
        matches!(self, ModSource::Eg(1) | ModSource::Lfo(2) | ModSource::Lfo(3))
    }
}

// ═══════════════════════════════════════════════════════════════════
// Destinations
// ═══════════════════════════════════════════════════════════════════

/// Per-operator destination fields (offsets 0x0..=0xD within each
/// operator's 0x10 stride).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpField {
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
    Mute,
    KeyVelocity,
}

impl OpField {
    fn from_offset(off: u8) -> Option<Self> {
        Some(match off {
            0x0 => OpField::Waveform,
            0x1 => OpField::Multiplier,
            0x2 => OpField::Attack,
            0x3 => OpField::Decay,
            0x4 => OpField::Sustain,
            0x5 => OpField::Release,
            0x6 => OpField::Volume,
            0x7 => OpField::Vibrato,
            0x8 => OpField::Tremolo,
            0x9 => OpField::KeyScaleLevel,
            0xA => OpField::KeyScaleRate,
            0xB => OpField::SustainEnable,
            0xC => OpField::Mute,
            0xD => OpField::KeyVelocity,
            _ => return None,
        })
    }

    fn offset(&self) -> u8 {
        match self {
            OpField::Waveform => 0x0,
            OpField::Multiplier => 0x1,
            OpField::Attack => 0x2,
            OpField::Decay => 0x3,
            OpField::Sustain => 0x4,
            OpField::Release => 0x5,
            OpField::Volume => 0x6,
            OpField::Vibrato => 0x7,
            OpField::Tremolo => 0x8,
            OpField::KeyScaleLevel => 0x9,
            OpField::KeyScaleRate => 0xA,
            OpField::SustainEnable => 0xB,
            OpField::Mute => 0xC,
            OpField::KeyVelocity => 0xD,
        }
    }

    fn range(&self) -> (i16, i16) {
        match self {
            OpField::Waveform => (0, 7),
            OpField::Multiplier => (0, 15),
            OpField::Attack | OpField::Decay | OpField::Sustain | OpField::Release => (0, 15),
            OpField::Volume => (0, 63),
            OpField::Vibrato | OpField::Tremolo | OpField::KeyScaleRate => (0, 1),
            OpField::KeyScaleLevel => (0, 3),
            OpField::SustainEnable | OpField::Mute => (0, 1),
            OpField::KeyVelocity => (0, 7),
        }
    }
}

/// Voice-level destination fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceField {
    Transpose,
    Tune,
    Portamento,
    Delay,
    Feedback,
}

impl VoiceField {
    fn from_offset(off: u8) -> Option<Self> {
        Some(match off {
            0 => VoiceField::Transpose,
            1 => VoiceField::Tune,
            2 => VoiceField::Portamento,
            3 => VoiceField::Delay,
            4 => VoiceField::Feedback,
            _ => return None,
        })
    }

    fn offset(&self) -> u8 {
        match self {
            VoiceField::Transpose => 0,
            VoiceField::Tune => 1,
            VoiceField::Portamento => 2,
            VoiceField::Delay => 3,
            VoiceField::Feedback => 4,
        }
    }

    fn range(&self) -> (i16, i16) {
        match self {
            VoiceField::Transpose | VoiceField::Tune => (0, 127),
            VoiceField::Portamento | VoiceField::Delay => (0, 255),
            VoiceField::Feedback => (0, 7),
        }
    }
}

/// Envelope-generator config fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgField {
    Attack,
    Decay1,
    Level,
    Decay2,
    Sustain,
    Release,
}

impl EgField {
    fn from_offset(off: u8) -> Option<Self> {
        Some(match off {
            0 => EgField::Attack,
            1 => EgField::Decay1,
            2 => EgField::Level,
            3 => EgField::Decay2,
            4 => EgField::Sustain,
            5 => EgField::Release,
            _ => return None,
        })
    }

    fn offset(&self) -> u8 {
        match self {
            EgField::Attack => 0,
            EgField::Decay1 => 1,
            EgField::Level => 2,
            EgField::Decay2 => 3,
            EgField::Sustain => 4,
            EgField::Release => 5,
        }
    }

    fn range(&self) -> (i16, i16) {
        match self {
            EgField::Level | EgField::Sustain => (0, 127),
            _ => (0, 255),
        }
    }
}

/// LFO config fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoField {
    Period,
    Delay,
    Waveform,
    Mode,
}

impl LfoField {
    fn from_offset(off: u8) -> Option<Self> {
        Some(match off {
            0 => LfoField::Period,
            1 => LfoField::Delay,
            2 => LfoField::Waveform,
            3 => LfoField::Mode,
            _ => return None,
        })
    }

    fn offset(&self) -> u8 {
        match self {
            LfoField::Period => 0,
            LfoField::Delay => 1,
            LfoField::Waveform => 2,
            LfoField::Mode => 3,
        }
    }

    fn range(&self) -> (i16, i16) {
        match self {
            LfoField::Period | LfoField::Delay => (0, 255),
            LfoField::Waveform => (0, 5),
            LfoField::Mode => (0, 1),
        }
    }
}

/// Wavetable config fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WtField {
    Rate,
    Offset,
}

impl WtField {
    fn from_offset(off: u8) -> Option<Self> {
        Some(match off {
            0 => WtField::Rate,
            1 => WtField::Offset,
            _ => return None,
        })
    }

    fn offset(&self) -> u8 {
        match self {
            WtField::Rate => 0,
            WtField::Offset => 1,
        }
    }

    fn range(&self) -> (i16, i16) {
        match self {
            WtField::Rate => (0, 255),
            WtField::Offset => (0, 31),
        }
    }
}

/// A decoded modulation destination.
///
/// The id space 0x00..=0x8F statically encodes every modulatable
/// parameter of a voice:
/// - 0x00..=0x3F  operator fields, 0x10 stride per operator
/// - 0x40..=0x47  voice-level fields
/// - 0x48..=0x57  EG1/EG2 config, stride 8
/// - 0x58..=0x77  LFO1..4 config, stride 8
/// - 0x78..=0x87  WT1/WT2 config, stride 8
/// - 0x88..=0x8F  depth of connections 0..=7
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    Op { op: usize, field: OpField },
    Voice(VoiceField),
    Eg { index: usize, field: EgField },
    Lfo { index: usize, field: LfoField },
    Wt { index: usize, field: WtField },
    Depth(usize),
}

impl Dest {
    pub fn decode(id: u8) -> Option<Dest> {
        match id {
            0x00..=0x3F => {
                let op = (id >> 4) as usize;
                let field = OpField::from_offset(id & 0x0F)?;
                Some(Dest::Op { op, field })
            }
            0x40..=0x47 => VoiceField::from_offset(id - 0x40).map(Dest::Voice),
            0x48..=0x57 => {
                let index = ((id - 0x48) / 8) as usize;
                let field = EgField::from_offset((id - 0x48) % 8)?;
                Some(Dest::Eg { index, field })
            }
            0x58..=0x77 => {
                let index = ((id - 0x58) / 8) as usize;
                let field = LfoField::from_offset((id - 0x58) % 8)?;
                Some(Dest::Lfo { index, field })
            }
            0x78..=0x87 => {
                let index = ((id - 0x78) / 8) as usize;
                let field = WtField::from_offset((id - 0x78) % 8)?;
                Some(Dest::Wt { index, field })
            }
            0x88..=0x8F => Some(Dest::Depth((id - 0x88) as usize)),
            _ => None,
        }
    }

    pub fn encode(&self) -> u8 {
        match self {
            Dest::Op { op, field } => ((*op as u8) << 4) | field.offset(),
            Dest::Voice(field) => 0x40 + field.offset(),
            Dest::Eg { index, field } => 0x48 + (*index as u8) * 8 + field.offset(),
            Dest::Lfo { index, field } => 0x58 + (*index as u8) * 8 + field.offset(),
            Dest::Wt { index, field } => 0x78 + (*index as u8) * 8 + field.offset(),
            Dest::Depth(slot) => 0x88 + *slot as u8,
        }
    }

    /// Legal value range, used by the combine-and-clamp pass.
    pub fn range(&self) -> (i16, i16) {
        match self {
            Dest::Op { field, .. } => field.range(),
            Dest::Voice(field) => field.range(),
            Dest::Eg { field, .. } => field.range(),
            Dest::Lfo { field, .. } => field.range(),
            Dest::Wt { field, .. } => field.range(),
            Dest::Depth(_) => (-127, 127),
        }
    }

    /// Destinations only present on 4-operator voices: operators 3/4,
    /// the second EG and the second LFO pair.
    pub fn requires_four_op(&self) -> bool {
        match self {
            Dest::Op { op, .. } => *op >= 2,
            Dest::Eg { index, .. } => *index >= 1,
            Dest::Lfo { index, .. } => *index >= 2,
            _ => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Connections
// ═══════════════════════════════════════════════════════════════════

/// One (source, destination, depth) routing.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub source: ModSource,
    pub dest: Dest,
    /// Stored depth, -127..=127.
    pub depth: i8,
    /// Depth after self-modulation; what the routing pass actually
    /// uses this tick.
    pub effective_depth: i8,
}

/// The ordered, fixed-capacity connection list of one voice.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    slots: [Option<Connection>; MAX_CONNECTIONS],
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection in the first free slot. `None` when the table
    /// is full; the caller surfaces that to the user.
    pub fn add(&mut self, source: ModSource, dest: Dest, depth: i8) -> Option<usize> {
        let slot = self.slots.iter().position(|s| s.is_none())?;
        self.slots[slot] = Some(Connection {
            source,
            dest,
            depth,
            effective_depth: depth,
        });
        Some(slot)
    }

    pub fn remove(&mut self, slot: usize) -> EngineResult<()> {
        if slot >= MAX_CONNECTIONS {
            return Err(EngineError::InvalidDestination((0x88usize + slot) as u8));
        }
        self.slots[slot] = None;
        Ok(())
    }

    pub fn set_depth(&mut self, slot: usize, depth: i8) {
        if let Some(Some(conn)) = self.slots.get_mut(slot) {
            conn.depth = depth;
            conn.effective_depth = depth;
        }
    }

    pub fn get(&self, slot: usize) -> Option<&Connection> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|c| (i, c)))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

// ═══════════════════════════════════════════════════════════════════
// Delta accumulator
// ═══════════════════════════════════════════════════════════════════

/// Per-destination delta accumulator.
///
/// One instance is shared across the whole voice set for a tick; the
/// apply pass consumes and clears it after each voice.
#[derive(Debug)]
pub struct DeltaAccumulator {
    deltas: [i32; DEST_SPACE],
    dirty: [bool; DEST_SPACE],
    touched: Vec<u8>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self {
            deltas: [0; DEST_SPACE],
            dirty: [false; DEST_SPACE],
            touched: Vec::with_capacity(MAX_CONNECTIONS),
        }
    }

    pub fn add(&mut self, dest_id: u8, amount: i32) {
        let idx = dest_id as usize;
        if idx >= DEST_SPACE {
            return;
        }
        if !self.dirty[idx] {
            self.dirty[idx] = true;
            self.touched.push(dest_id);
        }
        self.deltas[idx] += amount;
    }

    #[inline]
    pub fn is_dirty(&self, dest_id: u8) -> bool {
        self.dirty[dest_id as usize]
    }

    #[inline]
    pub fn delta(&self, dest_id: u8) -> i32 {
        self.deltas[dest_id as usize]
    }

    /// Dirty destination ids, in first-touch order.
    pub fn touched(&self) -> &[u8] {
        &self.touched
    }

    /// Clear for the next voice. Only touched entries are reset.
    pub fn clear(&mut self) {
        for id in self.touched.drain(..) {
            self.deltas[id as usize] = 0;
            self.dirty[id as usize] = false;
        }
    }
}

impl Default for DeltaAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

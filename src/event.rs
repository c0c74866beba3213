// src/event.rs

/// An inbound MIDI event.
///
/// These events:
/// - arrive from interrupt/polling context
/// - are queued, never applied in place
/// - are dispatched by the engine exactly once, at tick start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOn {
        port: u8,
        channel: u8,
        note: u8,
        velocity: u8,
    },

    NoteOff {
        port: u8,
        channel: u8,
        note: u8,
    },

    ControlChange {
        channel: u8,
        cc: u8,
        value: u8,
    },

    ProgramChange {
        channel: u8,
        program: u8,
    },

    /// Bend value in -8192..=8191 (centered at 0).
    PitchBend {
        channel: u8,
        value: i16,
    },
}

/// Controller numbers the engine reacts to.
pub mod cc {
    pub const BANK_MSB: u8 = 0;
    pub const MOD_WHEEL: u8 = 1;
    pub const VOLUME: u8 = 7;
    pub const PAN: u8 = 10;
    pub const EXPRESSION: u8 = 11;
    pub const VARIATION: u8 = 16;
    pub const BANK_LSB: u8 = 32;
    pub const SUSTAIN: u8 = 64;
    pub const ALL_SOUND_OFF: u8 = 120;
    pub const ALL_NOTES_OFF: u8 = 123;
}

/// Queue of pending MIDI events.
///
/// Event producers push here; the engine drains the whole queue at the
/// start of each tick. This is the mutual-exclusion discipline: a note
/// event is never observed half-applied by the tick, because nothing is
/// applied while the tick body runs.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Vec<MidiEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            events: Vec::with_capacity(64),
        }
    }

    pub fn push(&mut self, event: MidiEvent) {
        self.events.push(event);
    }

    /// Drain all pending events in arrival order.
    pub fn drain(&mut self) -> std::vec::Drain<'_, MidiEvent> {
        self.events.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

// src/lib.rs
//
// fmvoice: voice allocation, modulation routing and the pitch
// pipeline for register-level FM synthesizer chips.
//
// The crate is chip-agnostic. The engine consumes queued MIDI events
// once per tick and speaks to the outside world in final parameter
// values only, through the `ChipDriver` trait; a host UI hooks in
// through `Host`.

pub mod channel;
pub mod chip;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod modulator;
pub mod notestack;
pub mod pitch;
pub mod pool;
pub mod routing;
pub mod temperament;
pub mod voice;

pub use chip::{ChipDriver, Host, NullChip, NullHost, OpRegister};
pub use config::{ChannelDefaults, EngineConfig, TemperamentRatios};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use event::{MidiEvent, cc};
pub use voice::{OperatorParams, VoiceId, VoiceParams};

// src/modulator.rs
//
// Per-voice modulation sources: envelope generators, LFOs and
// wavetable players. All of them are clocked in engine milliseconds
// through the shared nonlinear time map; none of them allocate.

use crate::config::TimeMap;

/// Envelope configuration. Times are 8-bit codes through the time
/// map; levels are 0..=127.
#[derive(Debug, Clone, Copy)]
pub struct EgConfig {
    pub attack: u8,
    pub decay1: u8,
    pub level: u8,
    pub decay2: u8,
    pub sustain: u8,
    pub release: u8,
}

impl Default for EgConfig {
    fn default() -> Self {
        Self {
            attack: 0,
            decay1: 0,
            level: 127,
            decay2: 0,
            sustain: 127,
            release: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EgPhase {
    Idle,
    Attack,
    Decay1,
    Decay2,
    Sustain,
    Release,
}

/// Two-phase envelope generator.
///
/// Forward phase: attack to full scale, decay1 down to `level`,
/// decay2 down to `sustain`, then hold. Release phase: linear decay
/// from whatever value was current at release-start.
#[derive(Debug, Clone)]
pub struct EnvelopeGen {
    phase: EgPhase,
    phase_start: u64,
    seg_from: i16,
    release_from: i16,
    last_output: i16,
}

impl EnvelopeGen {
    pub fn new() -> Self {
        Self {
            phase: EgPhase::Idle,
            phase_start: 0,
            seg_from: 0,
            release_from: 0,
            last_output: 0,
        }
    }

    /// Restart the forward phase from zero.
    pub fn trigger(&mut self, now: u64) {
        self.phase = EgPhase::Attack;
        self.phase_start = now;
        self.seg_from = 0;
    }

    /// Enter the release phase, capturing the current output.
    pub fn release(&mut self, now: u64) {
        if self.phase == EgPhase::Idle || self.phase == EgPhase::Release {
            return;
        }
        self.release_from = self.last_output;
        self.phase = EgPhase::Release;
        self.phase_start = now;
    }

    pub fn is_idle(&self) -> bool {
        self.phase == EgPhase::Idle
    }

    /// Current output in 0..=127. Advances the phase machine as far
    /// as `now` requires.
    pub fn value(&mut self, now: u64, cfg: &EgConfig, tmap: &TimeMap) -> i16 {
        loop {
            let out = match self.phase {
                EgPhase::Idle => 0,

                EgPhase::Attack => {
                    match self.segment(now, tmap.ms(cfg.attack), 127) {
                        Some(v) => v,
                        None => {
                            self.advance(EgPhase::Decay1, tmap.ms(cfg.attack), 127);
                            continue;
                        }
                    }
                }

                EgPhase::Decay1 => {
                    let target = cfg.level as i16;
                    match self.segment(now, tmap.ms(cfg.decay1), target) {
                        Some(v) => v,
                        None => {
                            self.advance(EgPhase::Decay2, tmap.ms(cfg.decay1), target);
                            continue;
                        }
                    }
                }

                EgPhase::Decay2 => {
                    let target = cfg.sustain as i16;
                    match self.segment(now, tmap.ms(cfg.decay2), target) {
                        Some(v) => v,
                        None => {
                            self.advance(EgPhase::Sustain, tmap.ms(cfg.decay2), target);
                            continue;
                        }
                    }
                }

                EgPhase::Sustain => cfg.sustain as i16,

                EgPhase::Release => {
                    self.seg_from = self.release_from;
                    match self.segment(now, tmap.ms(cfg.release), 0) {
                        Some(v) => v,
                        None => {
                            self.phase = EgPhase::Idle;
                            0
                        }
                    }
                }
            };

            self.last_output = out;
            return out;
        }
    }

    /// Linear segment from `seg_from` toward `target`. `None` once the
    /// segment duration has elapsed.
    fn segment(&self, now: u64, dur_ms: u32, target: i16) -> Option<i16> {
        let elapsed = now.saturating_sub(self.phase_start);
        if dur_ms == 0 || elapsed >= dur_ms as u64 {
            return None;
        }
        let from = self.seg_from as i64;
        let span = target as i64 - from;
        Some((from + span * elapsed as i64 / dur_ms as i64) as i16)
    }

    fn advance(&mut self, next: EgPhase, elapsed_ms: u32, reached: i16) {
        self.phase = next;
        self.phase_start += elapsed_ms as u64;
        self.seg_from = reached;
    }
}

impl Default for EnvelopeGen {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════
// LFO
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfoWave {
    Sine,
    Triangle,
    ExpSaw,
    Saw,
    Square,
    Random,
}

impl LfoWave {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => LfoWave::Sine,
            1 => LfoWave::Triangle,
            2 => LfoWave::ExpSaw,
            3 => LfoWave::Saw,
            4 => LfoWave::Square,
            _ => LfoWave::Random,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            LfoWave::Sine => 0,
            LfoWave::Triangle => 1,
            LfoWave::ExpSaw => 2,
            LfoWave::Saw => 3,
            LfoWave::Square => 4,
            LfoWave::Random => 5,
        }
    }
}

/// LFO configuration. `period` and `delay` are time codes.
#[derive(Debug, Clone, Copy)]
pub struct LfoConfig {
    pub period: u8,
    pub delay: u8,
    pub waveform: LfoWave,
    /// Free-running LFOs ignore voice-trigger resets and the initial
    /// delay gate.
    pub free_run: bool,
}

impl Default for LfoConfig {
    fn default() -> Self {
        Self {
            period: 96,
            delay: 0,
            waveform: LfoWave::Sine,
            free_run: false,
        }
    }
}

/// Low-frequency oscillator, output -127..=127.
#[derive(Debug, Clone)]
pub struct Lfo {
    start: u64,
    rng_state: u32,
    rand_value: i16,
    rand_cycle: u64,
}

impl Lfo {
    pub fn new(seed: u32) -> Self {
        Self {
            start: 0,
            rng_state: seed | 1,
            rand_value: 0,
            rand_cycle: u64::MAX,
        }
    }

    /// Voice trigger: restarts phase unless free-running.
    pub fn trigger(&mut self, now: u64, cfg: &LfoConfig) {
        if !cfg.free_run {
            self.start = now;
            self.rand_cycle = u64::MAX;
        }
    }

    pub fn value(&mut self, now: u64, cfg: &LfoConfig, tmap: &TimeMap) -> i16 {
        let t = if cfg.free_run {
            now
        } else {
            let since = now.saturating_sub(self.start);
            if since < tmap.ms(cfg.delay) as u64 {
                return 0;
            }
            since
        };

        let period = tmap.ms(cfg.period).max(1) as u64;
        let pos = (t % period) as f32 / period as f32;

        match cfg.waveform {
            LfoWave::Sine => ((pos * std::f32::consts::TAU).sin() * 127.0) as i16,

            LfoWave::Triangle => {
                let v = if pos < 0.5 {
                    4.0 * pos - 1.0
                } else {
                    3.0 - 4.0 * pos
                };
                (v * 127.0) as i16
            }

            // Decaying exponential ramp, retriggered every cycle.
            LfoWave::ExpSaw => ((-6.0 * pos).exp2() * 127.0) as i16,

            LfoWave::Saw => ((2.0 * pos - 1.0) * 127.0) as i16,

            LfoWave::Square => {
                if pos < 0.5 {
                    127
                } else {
                    -127
                }
            }

            LfoWave::Random => {
                let cycle = t / period;
                if cycle != self.rand_cycle {
                    self.rand_cycle = cycle;
                    self.rand_value = self.next_random();
                }
                self.rand_value
            }
        }
    }

    /// xorshift32, mapped to -127..=127.
    fn next_random(&mut self) -> i16 {
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng_state = x;
        ((x % 255) as i16) - 127
    }
}

// ═══════════════════════════════════════════════════════════════════
// Wavetable
// ═══════════════════════════════════════════════════════════════════

pub const WT_LEN: usize = 32;

/// Wavetable configuration. `rate` is the per-step time code,
/// `offset` a starting index into the table.
#[derive(Debug, Clone, Copy)]
pub struct WtConfig {
    pub rate: u8,
    pub offset: u8,
}

impl Default for WtConfig {
    fn default() -> Self {
        Self { rate: 64, offset: 0 }
    }
}

/// Looping player over a short table of signed samples.
#[derive(Debug, Clone)]
pub struct Wavetable {
    samples: [i8; WT_LEN],
    start: u64,
}

impl Wavetable {
    pub fn new() -> Self {
        // Default table: one full bipolar ramp.
        let mut samples = [0i8; WT_LEN];
        for (i, s) in samples.iter_mut().enumerate() {
            *s = (i as i32 * 254 / (WT_LEN as i32 - 1) - 127) as i8;
        }
        Self { samples, start: 0 }
    }

    pub fn set_samples(&mut self, samples: [i8; WT_LEN]) {
        self.samples = samples;
    }

    pub fn trigger(&mut self, now: u64) {
        self.start = now;
    }

    pub fn value(&self, now: u64, cfg: &WtConfig, tmap: &TimeMap) -> i16 {
        let step_ms = tmap.ms(cfg.rate).max(1) as u64;
        let step = now.saturating_sub(self.start) / step_ms;
        let idx = (step as usize + cfg.offset as usize) % WT_LEN;
        (self.samples[idx] as i16).max(-127)
    }
}

impl Default for Wavetable {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════
// Per-voice bank
// ═══════════════════════════════════════════════════════════════════

/// Modulatable configuration of all eight hardware-style sources.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModConfigs {
    pub eg: [EgConfig; 2],
    pub lfo: [LfoConfig; 4],
    pub wt: [WtConfig; 2],
}

/// The modulator state owned by one voice.
#[derive(Debug, Clone)]
pub struct ModulatorBank {
    pub eg: [EnvelopeGen; 2],
    pub lfo: [Lfo; 4],
    pub wt: [Wavetable; 2],
}

impl ModulatorBank {
    pub fn new(seed: u32) -> Self {
        Self {
            eg: [EnvelopeGen::new(), EnvelopeGen::new()],
            lfo: [
                Lfo::new(seed),
                Lfo::new(seed.rotate_left(7)),
                Lfo::new(seed.rotate_left(13)),
                Lfo::new(seed.rotate_left(23)),
            ],
            wt: [Wavetable::new(), Wavetable::new()],
        }
    }

    /// Restart all phase clocks. Called when the voice's actual note
    /// transitions from silent to sounding (and on clean retrigger).
    pub fn trigger_all(&mut self, now: u64, cfgs: &ModConfigs) {
        for eg in &mut self.eg {
            eg.trigger(now);
        }
        for (lfo, cfg) in self.lfo.iter_mut().zip(cfgs.lfo.iter()) {
            lfo.trigger(now, cfg);
        }
        for wt in &mut self.wt {
            wt.trigger(now);
        }
    }

    /// Enter release on both envelopes.
    pub fn release_all(&mut self, now: u64) {
        for eg in &mut self.eg {
            eg.release(now);
        }
    }
}

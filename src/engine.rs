// src/engine.rs
//
// The engine proper. Each tick it:
// 1. drains the MIDI event queue (events are never applied mid-tick)
// 2. clocks every voice's note delay line and derives the actual note
// 3. handles gate/envelope transitions
// 4. evaluates modulation sources and accumulates routed deltas
// 5. combines deltas with base parameters, clamps, and writes final
//    values to the chip driver
// 6. recomputes pitch where anything pitch-affecting moved
//
// The chip driver and host are generic seams; tests plug capture
// implementations in.

use log::{debug, warn};

use crate::channel::ChannelOptions;
use crate::chip::{ChipDriver, Host, OpRegister};
use crate::config::{EngineConfig, TimeMap};
use crate::error::{EngineError, EngineResult};
use crate::event::{EventQueue, MidiEvent, cc};
use crate::modulator::{LfoWave, WT_LEN};
use crate::pitch;
use crate::pool::VoicePool;
use crate::routing::{
    DEST_SPACE, Dest, DeltaAccumulator, EgField, LfoField, MAX_CONNECTIONS, ModSource, OpField,
    VoiceField, WtField,
};
use crate::temperament::Temperament;
use crate::voice::{DelayCell, OperatorParams, Relation, Voice, VoiceId, VoiceParams};

pub struct Engine<C: ChipDriver, H: Host> {
    pool: VoicePool,
    chip: C,
    host: H,

    time_map: TimeMap,
    equal: Temperament,
    custom: Option<Temperament>,
    use_custom: bool,

    queue: EventQueue,

    /// Shared per-tick delta scratch, cleared after each voice.
    deltas: DeltaAccumulator,

    now_ms: u64,
    delay_acc_ms: u32,
    ms_per_delay_step: u32,
}

impl<C: ChipDriver, H: Host> Engine<C, H> {
    pub fn new(config: EngineConfig, chip: C, host: H) -> Self {
        let pool = VoicePool::new(&config);
        let custom = config.custom_temperament.as_ref().map(Temperament::custom);
        let ms_per_delay_step = config.ms_per_delay_step.max(1);
        Self {
            pool,
            chip,
            host,
            time_map: TimeMap::new(config.time_map),
            equal: Temperament::equal(),
            custom,
            use_custom: false,
            queue: EventQueue::new(),
            deltas: DeltaAccumulator::new(),
            now_ms: 0,
            delay_acc_ms: 0,
            ms_per_delay_step,
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Accessors
    // ───────────────────────────────────────────────────────────────

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn pool(&self) -> &VoicePool {
        &self.pool
    }

    pub fn chip(&self) -> &C {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut C {
        &mut self.chip
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn channel_options_mut(&mut self, ch: usize) -> EngineResult<&mut ChannelOptions> {
        Ok(&mut self.pool.channel_mut(ch)?.options)
    }

    // ───────────────────────────────────────────────────────────────
    // The tick
    // ───────────────────────────────────────────────────────────────

    /// Queue a MIDI event for the next tick.
    pub fn push_event(&mut self, event: MidiEvent) {
        self.queue.push(event);
    }

    /// One engine tick of `elapsed_ms` wall-clock milliseconds.
    pub fn tick(&mut self, elapsed_ms: u32) {
        let events: Vec<MidiEvent> = self.queue.drain().collect();
        for event in events {
            self.dispatch(event);
        }

        self.now_ms += elapsed_ms as u64;
        let total = self.delay_acc_ms + elapsed_ms;
        let steps = (total / self.ms_per_delay_step) as u64;
        self.delay_acc_ms = total % self.ms_per_delay_step;

        for v in 0..self.pool.voice_count() {
            if self.pool.voices()[v].trailing_half {
                continue;
            }
            self.process_voice(v, steps);
        }
    }

    fn dispatch(&mut self, event: MidiEvent) {
        let result = match event {
            MidiEvent::NoteOn {
                channel,
                note,
                velocity,
                ..
            } => {
                let ch = channel as usize;
                if velocity == 0 {
                    self.pool.note_off(ch, note, &mut self.host)
                } else {
                    self.pool
                        .note_on(ch, note.min(127), velocity.min(127), &mut self.host)
                }
            }
            MidiEvent::NoteOff { channel, note, .. } => {
                self.pool.note_off(channel as usize, note, &mut self.host)
            }
            MidiEvent::ControlChange {
                channel,
                cc: ctrl,
                value,
            } => self.control_change(channel as usize, ctrl, value.min(127)),
            MidiEvent::ProgramChange { channel, program } => {
                self.program_change(channel as usize, program)
            }
            MidiEvent::PitchBend { channel, value } => {
                self.pitch_bend(channel as usize, value.clamp(-8192, 8191))
            }
        };
        if let Err(err) = result {
            warn!("dropping event {:?}: {}", event, err);
        }
    }

    fn control_change(&mut self, ch: usize, ctrl: u8, value: u8) -> EngineResult<()> {
        match ctrl {
            cc::VOLUME => {
                self.pool.channel_mut(ch)?.volume = value;
                self.mark_channel_volume(ch);
            }
            cc::EXPRESSION => {
                self.pool.channel_mut(ch)?.expression = value;
                self.mark_channel_volume(ch);
            }
            cc::PAN => {
                self.pool.channel_mut(ch)?.pan = value;
                let channel = self.pool.channel(ch)?;
                if channel.options.forward_pan {
                    let mask = channel.pan_bus_mask();
                    let buses: Vec<(VoiceId, u8)> = self
                        .pool
                        .channel_voices(ch)
                        .map(|v| (v, self.pool.voices()[v].params.out_bus))
                        .collect();
                    for (v, bus) in buses {
                        self.chip.set_output_bus(v, bus & mask);
                    }
                }
            }
            cc::SUSTAIN => {
                let down = value >= 64;
                let was = self.pool.channel(ch)?.sustain;
                self.pool.channel_mut(ch)?.sustain = down;
                if was && !down {
                    self.pool.sustain_release(ch, &mut self.host)?;
                }
            }
            cc::MOD_WHEEL => self.pool.channel_mut(ch)?.mod_wheel = value,
            cc::VARIATION => self.pool.channel_mut(ch)?.variation = value,
            cc::BANK_MSB => {
                let channel = self.pool.channel_mut(ch)?;
                channel.pending_bank = (channel.pending_bank & 0x7F) | ((value as u16) << 7);
            }
            cc::BANK_LSB => {
                let channel = self.pool.channel_mut(ch)?;
                channel.pending_bank = (channel.pending_bank & !0x7F) | value as u16;
            }
            cc::ALL_NOTES_OFF | cc::ALL_SOUND_OFF => {
                self.pool.channel(ch)?;
                self.pool.all_notes_off(ch, &mut self.host);
            }
            _ => {
                debug!("ignoring CC {} on channel {}", ctrl, ch);
            }
        }
        Ok(())
    }

    fn mark_channel_volume(&mut self, ch: usize) {
        for voice in self.pool.voices_mut() {
            if voice.channel == Some(ch) {
                voice.volume_refresh = true;
            }
        }
    }

    fn program_change(&mut self, ch: usize, program: u8) -> EngineResult<()> {
        let bank = self.pool.channel(ch)?.pending_bank;
        debug!(
            "channel {}: patch request bank {} program {}",
            ch, bank, program
        );
        self.host.request_patch(ch, bank, program);
        Ok(())
    }

    fn pitch_bend(&mut self, ch: usize, value: i16) -> EngineResult<()> {
        self.pool.channel_mut(ch)?.pitch_bend = value;
        for voice in self.pool.voices_mut() {
            if voice.channel == Some(ch) {
                voice.pitch_dirty = true;
            }
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    // Per-voice processing
    // ───────────────────────────────────────────────────────────────

    fn process_voice(&mut self, v: VoiceId, steps: u64) {
        let now = self.now_ms;
        self.pool.voices_mut()[v].retrig_wait = false;

        // ── Delay line: raw in, actual out ─────────────────────────
        let (was_sounding, sounding) = {
            let voice = &mut self.pool.voices_mut()[v];
            let cell = DelayCell {
                note: voice.raw.note,
                velocity: voice.raw.velocity,
                retrig: voice.raw.retrig,
            };
            voice.delay_line.advance(steps, cell);
            voice.raw.retrig = false;
            voice.raw.updated = false;

            let offset = voice.delay_steps().min(voice.delay_line.len() - 1);
            let read = voice.delay_line.read(offset);
            let retrig = (offset == 0 && steps == 0 && cell.retrig)
                || voice.delay_line.retrig_seen(offset, steps);

            let old = voice.actual;
            if read.note != old.note || read.velocity != old.velocity || retrig {
                voice.actual.note = read.note;
                voice.actual.velocity = read.velocity;
                voice.actual.updated = true;
                voice.actual.retrig = retrig;
                if read.velocity > 0 {
                    voice.porta_from = if old.sounding() { old.note } else { read.note };
                    voice.porta_start = now;
                }
            }
            (old.sounding(), voice.actual.sounding())
        };

        // ── Gate and modulator transitions ─────────────────────────
        let mut gate_off = false;
        {
            let voice = &mut self.pool.voices_mut()[v];
            if !was_sounding && sounding {
                let mods = voice.live.mods;
                voice.bank.trigger_all(now, &mods);
                voice.refresh_all = true;
                voice.pitch_dirty = true;
            } else if was_sounding && !sounding {
                voice.bank.release_all(now);
                if voice.gated {
                    voice.gated = false;
                    gate_off = !voice.params.percussion;
                }
            } else if sounding && voice.actual.updated && voice.actual.retrig {
                // Note replaced while sounding.
                if voice.params.retrigger_on_change {
                    let mods = voice.live.mods;
                    voice.bank.trigger_all(now, &mods);
                    voice.refresh_all = true;
                    voice.pitch_dirty = true;
                    if voice.gated && !voice.params.percussion {
                        // Gate off for one tick so the chip envelopes
                        // restart too.
                        voice.gated = false;
                        voice.retrig_wait = true;
                        gate_off = true;
                    }
                } else {
                    voice.pitch_dirty = true;
                }
            }
        }
        if gate_off {
            self.chip.gate(v, false);
        }

        // ── Modulation sources and routing ──────────────────────────
        let (mod_wheel, variation, bend) = match self.pool.voices()[v].channel {
            Some(ch) => self
                .pool
                .channel(ch)
                .map(|c| (c.mod_wheel, c.variation, c.pitch_bend))
                .unwrap_or((0, 0, 0)),
            None => (0, 0, 0),
        };
        let four_op = self.pool.voices()[v].four_op;

        let mut cache: [Option<i16>; 8] = [None; 8];
        for slot in 0..MAX_CONNECTIONS {
            let conn = match self.pool.voices()[v].connections.get(slot) {
                Some(c) => *c,
                None => continue,
            };
            if conn.effective_depth == 0 {
                continue;
            }
            if !four_op && (conn.source.requires_four_op() || conn.dest.requires_four_op()) {
                continue;
            }
            let value = Self::eval_source(
                &mut self.pool.voices_mut()[v],
                conn.source,
                &mut cache,
                now,
                &self.time_map,
                mod_wheel,
                variation,
            );
            self.deltas.add(
                conn.dest.encode(),
                value as i32 * conn.effective_depth as i32 / 127,
            );
        }

        // ── Apply: combine, clamp, write ────────────────────────────
        let refresh_all = self.pool.voices()[v].refresh_all;
        let volume_refresh = self.pool.voices()[v].volume_refresh;

        if refresh_all {
            {
                let voice = &mut self.pool.voices_mut()[v];
                voice.live.refresh(&voice.params);
                for op in 0..voice.live_ops.len() {
                    voice.live_ops[op].mute = voice.ops[op].mute;
                    voice.live_ops[op].key_velocity = voice.ops[op].key_velocity;
                }
            }
            // The output bus has no routing destination; it is written
            // here, masked by the channel pan when pan is forwarded.
            let bus = {
                let voice = &self.pool.voices()[v];
                let mut bus = voice.params.out_bus;
                if let Some(ch) = voice.channel {
                    if let Ok(channel) = self.pool.channel(ch) {
                        if channel.options.forward_pan {
                            bus &= channel.pan_bus_mask();
                        }
                    }
                }
                bus
            };
            self.chip.set_output_bus(v, bus);
            for id in 0..DEST_SPACE as u8 {
                let Some(dest) = Dest::decode(id) else { continue };
                if !four_op && dest.requires_four_op() {
                    continue;
                }
                self.apply_dest(v, id, dest);
            }
        } else {
            let touched: Vec<u8> = self.deltas.touched().to_vec();
            for id in touched {
                let Some(dest) = Dest::decode(id) else { continue };
                if !four_op && dest.requires_four_op() {
                    continue;
                }
                self.apply_dest(v, id, dest);
            }
            if volume_refresh {
                let ops = self.pool.voices()[v].operator_count();
                for op in 0..ops {
                    self.write_op_volume(v, op);
                }
            }
        }
        {
            let voice = &mut self.pool.voices_mut()[v];
            voice.refresh_all = false;
            voice.volume_refresh = false;
        }
        self.deltas.clear();

        // ── Pitch ───────────────────────────────────────────────────
        let waiting = self.pool.voices()[v].retrig_wait;
        if sounding && !waiting {
            let (recompute, percussion, gated) = {
                let voice = &self.pool.voices()[v];
                let porta = pitch::porta_active(voice, now, &self.time_map);
                (
                    voice.pitch_dirty || voice.actual.updated || porta,
                    voice.params.percussion,
                    voice.gated,
                )
            };
            if recompute {
                let bf = {
                    let voice = &self.pool.voices()[v];
                    let temperament = if self.use_custom {
                        self.custom.as_ref().unwrap_or(&self.equal)
                    } else {
                        &self.equal
                    };
                    pitch::compute(voice, bend, now, &self.time_map, temperament)
                };
                self.chip.set_frequency(v, bf.block, bf.fnum);
                if !gated && !percussion {
                    self.chip.gate(v, true);
                    self.pool.voices_mut()[v].gated = true;
                }
                self.pool.voices_mut()[v].pitch_dirty = false;
            }
        }

        let voice = &mut self.pool.voices_mut()[v];
        voice.actual.updated = false;
        voice.actual.retrig = false;
    }

    /// Evaluate one modulation source, caching the hardware-style ones
    /// so connections sharing a source see the same value this tick.
    fn eval_source(
        voice: &mut Voice,
        source: ModSource,
        cache: &mut [Option<i16>; 8],
        now: u64,
        tmap: &TimeMap,
        mod_wheel: u8,
        variation: u8,
    ) -> i16 {
        if let Some(slot) = source.cache_slot() {
            if let Some(value) = cache[slot] {
                return value;
            }
        }
        let value = match source {
            ModSource::None => 0,
            ModSource::Eg(i) => {
                let cfg = voice.live.mods.eg[i];
                voice.bank.eg[i].value(now, &cfg, tmap)
            }
            ModSource::Lfo(i) => {
                let cfg = voice.live.mods.lfo[i];
                voice.bank.lfo[i].value(now, &cfg, tmap)
            }
            ModSource::Wt(i) => {
                let cfg = voice.live.mods.wt[i];
                voice.bank.wt[i].value(now, &cfg, tmap)
            }
            ModSource::Velocity => voice.actual.velocity as i16,
            ModSource::ModWheel => mod_wheel as i16,
            ModSource::Variation => variation as i16,
        };
        if let Some(slot) = source.cache_slot() {
            cache[slot] = Some(value);
        }
        value
    }

    /// Combine a destination's base value with its accumulated delta,
    /// clamp to the field's range and dispatch the write.
    fn apply_dest(&mut self, v: VoiceId, id: u8, dest: Dest) {
        let (min, max) = dest.range();
        let base = self.dest_base(v, dest);
        let value = (base as i32 + self.deltas.delta(id)).clamp(min as i32, max as i32) as i16;

        match dest {
            Dest::Op { op, field } => self.apply_op_field(v, op, field, value),

            Dest::Voice(field) => match field {
                VoiceField::Transpose => {
                    let voice = &mut self.pool.voices_mut()[v];
                    if voice.live.transpose != value as u8 {
                        voice.live.transpose = value as u8;
                        voice.pitch_dirty = true;
                    }
                }
                VoiceField::Tune => {
                    let voice = &mut self.pool.voices_mut()[v];
                    if voice.live.tune != value as u8 {
                        voice.live.tune = value as u8;
                        voice.pitch_dirty = true;
                    }
                }
                VoiceField::Portamento => {
                    self.pool.voices_mut()[v].live.portamento = value as u8;
                }
                VoiceField::Delay => {
                    self.pool.voices_mut()[v].live.delay = value as u8;
                }
                VoiceField::Feedback => {
                    let algorithm = self.pool.voices()[v].params.algorithm;
                    self.chip.set_algorithm(v, algorithm, value as u8);
                }
            },

            Dest::Eg { index, field } => {
                let cfg = &mut self.pool.voices_mut()[v].live.mods.eg[index];
                match field {
                    EgField::Attack => cfg.attack = value as u8,
                    EgField::Decay1 => cfg.decay1 = value as u8,
                    EgField::Level => cfg.level = value as u8,
                    EgField::Decay2 => cfg.decay2 = value as u8,
                    EgField::Sustain => cfg.sustain = value as u8,
                    EgField::Release => cfg.release = value as u8,
                }
            }

            Dest::Lfo { index, field } => {
                let cfg = &mut self.pool.voices_mut()[v].live.mods.lfo[index];
                match field {
                    LfoField::Period => cfg.period = value as u8,
                    LfoField::Delay => cfg.delay = value as u8,
                    LfoField::Waveform => cfg.waveform = LfoWave::from_code(value as u8),
                    LfoField::Mode => cfg.free_run = value != 0,
                }
            }

            Dest::Wt { index, field } => {
                let cfg = &mut self.pool.voices_mut()[v].live.mods.wt[index];
                match field {
                    WtField::Rate => cfg.rate = value as u8,
                    WtField::Offset => cfg.offset = value as u8,
                }
            }

            // Self-modulated depth: takes effect on the next routing
            // pass, never rewrites the stored depth.
            Dest::Depth(slot) => {
                if let Some(conn) = self.pool.voices_mut()[v].connections.get_mut(slot) {
                    conn.effective_depth = value as i8;
                }
            }
        }
    }

    /// Base (pre-delta) value of a destination.
    fn dest_base(&self, v: VoiceId, dest: Dest) -> i16 {
        let voice = &self.pool.voices()[v];
        match dest {
            Dest::Op { op, field } => {
                let p = &voice.ops[op];
                match field {
                    OpField::Waveform => p.waveform as i16,
                    OpField::Multiplier => p.multiplier as i16,
                    OpField::Attack => p.attack as i16,
                    OpField::Decay => p.decay as i16,
                    OpField::Sustain => p.sustain as i16,
                    OpField::Release => p.release as i16,
                    OpField::Volume => p.volume as i16,
                    OpField::Vibrato => p.vibrato as i16,
                    OpField::Tremolo => p.tremolo as i16,
                    OpField::KeyScaleLevel => p.key_scale_level as i16,
                    OpField::KeyScaleRate => p.key_scale_rate as i16,
                    OpField::SustainEnable => p.sustain_enable as i16,
                    OpField::Mute => p.mute as i16,
                    OpField::KeyVelocity => p.key_velocity as i16,
                }
            }
            Dest::Voice(field) => match field {
                VoiceField::Transpose => voice.params.transpose as i16,
                VoiceField::Tune => voice.params.tune as i16,
                VoiceField::Portamento => voice.params.portamento as i16,
                VoiceField::Delay => voice.params.delay as i16,
                VoiceField::Feedback => voice.params.feedback as i16,
            },
            Dest::Eg { index, field } => {
                let cfg = &voice.params.mods.eg[index];
                match field {
                    EgField::Attack => cfg.attack as i16,
                    EgField::Decay1 => cfg.decay1 as i16,
                    EgField::Level => cfg.level as i16,
                    EgField::Decay2 => cfg.decay2 as i16,
                    EgField::Sustain => cfg.sustain as i16,
                    EgField::Release => cfg.release as i16,
                }
            }
            Dest::Lfo { index, field } => {
                let cfg = &voice.params.mods.lfo[index];
                match field {
                    LfoField::Period => cfg.period as i16,
                    LfoField::Delay => cfg.delay as i16,
                    LfoField::Waveform => cfg.waveform.code() as i16,
                    LfoField::Mode => cfg.free_run as i16,
                }
            }
            Dest::Wt { index, field } => {
                let cfg = &voice.params.mods.wt[index];
                match field {
                    WtField::Rate => cfg.rate as i16,
                    WtField::Offset => cfg.offset as i16,
                }
            }
            Dest::Depth(slot) => voice
                .connections
                .get(slot)
                .map(|c| c.depth as i16)
                .unwrap_or(0),
        }
    }

    fn apply_op_field(&mut self, v: VoiceId, op: usize, field: OpField, value: i16) {
        let value = value.max(0) as u8;
        match field {
            OpField::Waveform => self.chip.set_operator(v, op, OpRegister::Waveform, value),
            OpField::Multiplier => self.chip.set_operator(v, op, OpRegister::Multiplier, value),
            OpField::Attack => self.chip.set_operator(v, op, OpRegister::Attack, value),
            OpField::Decay => self.chip.set_operator(v, op, OpRegister::Decay, value),
            OpField::Sustain => self.chip.set_operator(v, op, OpRegister::Sustain, value),
            OpField::Release => self.chip.set_operator(v, op, OpRegister::Release, value),
            OpField::Vibrato => self.chip.set_operator(v, op, OpRegister::Vibrato, value),
            OpField::Tremolo => self.chip.set_operator(v, op, OpRegister::Tremolo, value),
            OpField::KeyScaleLevel => {
                self.chip
                    .set_operator(v, op, OpRegister::KeyScaleLevel, value)
            }
            OpField::KeyScaleRate => {
                self.chip
                    .set_operator(v, op, OpRegister::KeyScaleRate, value)
            }
            OpField::SustainEnable => {
                self.chip
                    .set_operator(v, op, OpRegister::SustainEnable, value)
            }
            OpField::Volume => self.write_op_volume(v, op),
            OpField::Mute => {
                self.pool.voices_mut()[v].live_ops[op].mute = value != 0;
                self.write_op_volume(v, op);
            }
            OpField::KeyVelocity => {
                self.pool.voices_mut()[v].live_ops[op].key_velocity = value;
                self.write_op_volume(v, op);
            }
        }
    }

    /// Final operator volume: base plus routed delta, scaled by
    /// velocity sensitivity and the channel levels, zeroed by mute.
    fn write_op_volume(&mut self, v: VoiceId, op: usize) {
        let id = Dest::Op {
            op,
            field: OpField::Volume,
        }
        .encode();

        let value: u8 = {
            let voice = &self.pool.voices()[v];
            if voice.live_ops[op].mute {
                0
            } else {
                let base = voice.ops[op].volume as i32;
                let mut x = (base + self.deltas.delta(id)).clamp(0, 63) as u32;

                let kv = voice.live_ops[op].key_velocity as u32;
                if kv > 0 {
                    let vel = voice.actual.velocity as u32;
                    let scale = 127 - (127 - vel) * kv / 7;
                    x = x * scale / 127;
                }

                if let Some(ch) = voice.channel {
                    if let Ok(channel) = self.pool.channel(ch) {
                        x = channel.scale_volume(x as u8) as u32;
                    }
                }
                x as u8
            }
        };
        self.chip.set_operator(v, op, OpRegister::Volume, value);
    }

    // ───────────────────────────────────────────────────────────────
    // Voice management
    // ───────────────────────────────────────────────────────────────

    /// Toggle a voice's membership on a MIDI channel.
    pub fn assign_voice(&mut self, voice: VoiceId, ch: usize) -> EngineResult<()> {
        self.pool.assign(voice, ch, &mut self.host)
    }

    pub fn set_dupl(
        &mut self,
        follower: VoiceId,
        master: VoiceId,
        follow: bool,
    ) -> EngineResult<()> {
        self.pool.set_dupl(follower, master, follow)
    }

    pub fn set_link(&mut self, follower: VoiceId, master: VoiceId) -> EngineResult<()> {
        self.pool.set_link(follower, master, &mut self.host)
    }

    pub fn clear_relation(&mut self, voice: VoiceId) -> EngineResult<()> {
        self.pool.clear_relation(voice)
    }

    /// Toggle 4-operator mode on a leading voice and tell the chip.
    pub fn set_four_op(&mut self, voice: VoiceId, enabled: bool) -> EngineResult<()> {
        let partner = self.pool.set_four_op(voice, enabled)?;
        debug!(
            "voice {}: 4-op {} (trailing half {})",
            voice,
            if enabled { "on" } else { "off" },
            partner
        );
        self.chip.set_four_op(voice, enabled);
        self.pool.voices_mut()[voice].refresh_all = true;
        Ok(())
    }

    /// Replace a voice's parameter block.
    pub fn set_voice_params(&mut self, voice: VoiceId, params: VoiceParams) -> EngineResult<()> {
        self.pool.voice_mut(voice)?.params = params;
        self.commit_params(voice);
        Ok(())
    }

    /// Replace one operator's parameter block.
    pub fn set_operator_params(
        &mut self,
        voice: VoiceId,
        op: usize,
        params: OperatorParams,
    ) -> EngineResult<()> {
        let slots = self.pool.voice(voice)?.operator_count();
        if op >= slots {
            return Err(EngineError::InvalidDestination((op as u8) << 4));
        }
        self.pool.voices_mut()[voice].ops[op] = params;
        self.commit_params(voice);
        Ok(())
    }

    /// Mark a voice's parameters as edited: refresh its live values
    /// and chip state, and re-copy onto live DUPL followers.
    fn commit_params(&mut self, voice: VoiceId) {
        {
            let v = &mut self.pool.voices_mut()[voice];
            v.live.refresh(&v.params);
            v.refresh_all = true;
            v.pitch_dirty = true;
        }

        let followers: Vec<VoiceId> = self
            .pool
            .voices()
            .iter()
            .filter(|f| {
                matches!(f.relation, Relation::Dupl { master, follow: true } if master == voice)
            })
            .map(|f| f.id)
            .collect();
        for f in followers {
            let (params, ops, connections) = {
                let m = &self.pool.voices()[voice];
                (m.params.clone(), m.ops, m.connections.clone())
            };
            let fv = &mut self.pool.voices_mut()[f];
            fv.params = params;
            fv.ops = ops;
            fv.connections = connections;
            fv.live.refresh(&fv.params);
            fv.refresh_all = true;
            fv.pitch_dirty = true;
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Modulation routing
    // ───────────────────────────────────────────────────────────────

    /// Add a modulation connection. Returns the slot index.
    pub fn add_connection(
        &mut self,
        voice: VoiceId,
        source_id: u8,
        dest_id: u8,
        depth: i8,
    ) -> EngineResult<usize> {
        let source = ModSource::from_id(source_id).ok_or(EngineError::InvalidSource(source_id))?;
        let dest = Dest::decode(dest_id).ok_or(EngineError::InvalidDestination(dest_id))?;

        let four_op = self.pool.voice(voice)?.four_op;
        if !four_op && source.requires_four_op() {
            return Err(EngineError::FourOpOnly(source_id));
        }
        if !four_op && dest.requires_four_op() {
            return Err(EngineError::FourOpOnly(dest_id));
        }

        self.pool
            .voice_mut(voice)?
            .connections
            .add(source, dest, depth)
            .ok_or(EngineError::ConnectionTableFull(voice))
    }

    /// Remove a connection; the destination falls back to its base
    /// value on the next refresh.
    pub fn remove_connection(&mut self, voice: VoiceId, slot: usize) -> EngineResult<()> {
        self.pool.voice_mut(voice)?.connections.remove(slot)?;
        self.pool.voices_mut()[voice].refresh_all = true;
        Ok(())
    }

    pub fn set_connection_depth(
        &mut self,
        voice: VoiceId,
        slot: usize,
        depth: i8,
    ) -> EngineResult<()> {
        self.pool
            .voice_mut(voice)?
            .connections
            .set_depth(slot, depth);
        Ok(())
    }

    /// Replace one of a voice's wavetables.
    pub fn set_wavetable(
        &mut self,
        voice: VoiceId,
        index: usize,
        samples: [i8; WT_LEN],
    ) -> EngineResult<()> {
        let v = self.pool.voice_mut(voice)?;
        if let Some(wt) = v.bank.wt.get_mut(index) {
            wt.set_samples(samples);
        }
        Ok(())
    }

    /// Switch between equal temperament and the custom table built at
    /// boot. A request for a missing table stays on equal.
    pub fn set_custom_tuning(&mut self, enabled: bool) {
        self.use_custom = enabled && self.custom.is_some();
        for voice in self.pool.voices_mut() {
            voice.pitch_dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::{CaptureChip, CaptureHost, ChipWrite};
    use crate::config::TemperamentRatios;
    use crate::modulator::EgConfig;

    fn engine() -> Engine<CaptureChip, CaptureHost> {
        let mut e = Engine::new(
            EngineConfig::default(),
            CaptureChip::new(),
            CaptureHost::default(),
        );
        e.assign_voice(0, 0).unwrap();
        e
    }

    fn note_on(e: &mut Engine<CaptureChip, CaptureHost>, note: u8, velocity: u8) {
        e.push_event(MidiEvent::NoteOn {
            port: 0,
            channel: 0,
            note,
            velocity,
        });
    }

    #[test]
    fn test_note_on_writes_frequency_and_gate() {
        let mut e = engine();
        note_on(&mut e, 69, 100);
        e.tick(1);

        let expected = Temperament::equal().lookup(69);
        assert_eq!(
            e.chip().last_frequency(0),
            Some((expected.block, expected.fnum))
        );
        assert_eq!(e.chip().last_gate(0), Some(true));
        // Note start refreshed the operator state too.
        assert_eq!(e.chip().last_operator(0, 0, OpRegister::Volume), Some(48));
    }

    #[test]
    fn test_note_off_releases_gate() {
        let mut e = engine();
        note_on(&mut e, 60, 100);
        e.tick(1);
        e.push_event(MidiEvent::NoteOff {
            port: 0,
            channel: 0,
            note: 60,
        });
        e.tick(1);
        assert_eq!(e.chip().last_gate(0), Some(false));
    }

    #[test]
    fn test_eg_routed_to_volume_offsets_the_write() {
        let mut e = engine();
        let mut params = VoiceParams::default();
        params.mods.eg[0] = EgConfig {
            attack: 0,
            decay1: 0,
            level: 20,
            decay2: 0,
            sustain: 20,
            release: 0,
        };
        e.set_voice_params(0, params).unwrap();
        let mut op = OperatorParams::default();
        op.volume = 30;
        e.set_operator_params(0, 0, op).unwrap();
        // EG1 -> operator 1 volume at full depth
        e.add_connection(0, 1, 0x06, 127).unwrap();

        note_on(&mut e, 60, 100);
        e.tick(1);
        assert_eq!(e.chip().last_operator(0, 0, OpRegister::Volume), Some(50));

        // Still sustained on later ticks.
        e.tick(1);
        assert_eq!(e.chip().last_operator(0, 0, OpRegister::Volume), Some(50));
    }

    #[test]
    fn test_zero_depth_connection_writes_nothing() {
        let mut e = engine();
        e.add_connection(0, 9, 0x06, 0).unwrap();
        note_on(&mut e, 60, 100);
        e.tick(1);

        e.chip_mut().clear();
        e.tick(1);
        assert_eq!(e.chip().last_operator(0, 0, OpRegister::Volume), None);
    }

    #[test]
    fn test_retrigger_cycles_the_gate_for_one_tick() {
        let mut e = engine();
        note_on(&mut e, 60, 100);
        e.tick(1);
        assert_eq!(e.chip().last_gate(0), Some(true));

        note_on(&mut e, 60, 80);
        e.tick(1);
        assert_eq!(e.chip().last_gate(0), Some(false));
        e.tick(1);
        assert_eq!(e.chip().last_gate(0), Some(true));
    }

    #[test]
    fn test_note_delay_postpones_the_start() {
        let mut e = engine();
        let mut params = VoiceParams::default();
        params.delay = 2; // 2 steps x 10 ms
        e.set_voice_params(0, params).unwrap();

        note_on(&mut e, 60, 100);
        e.tick(1);
        assert_eq!(e.chip().last_gate(0), None);

        e.tick(10); // first delay step
        assert_eq!(e.chip().last_gate(0), None);

        e.tick(10); // second step: the note emerges
        assert_eq!(e.chip().last_gate(0), Some(true));
        let expected = Temperament::equal().lookup(60);
        assert_eq!(
            e.chip().last_frequency(0),
            Some((expected.block, expected.fnum))
        );
    }

    #[test]
    fn test_pitch_bend_recomputes_frequency() {
        let mut e = engine();
        note_on(&mut e, 69, 100);
        e.tick(1);
        e.chip_mut().clear();

        // +4096 of bend range 2 = one half-step up
        e.push_event(MidiEvent::PitchBend {
            channel: 0,
            value: 4096,
        });
        e.tick(1);
        let expected = Temperament::equal().lookup(70);
        assert_eq!(
            e.chip().last_frequency(0),
            Some((expected.block, expected.fnum))
        );
    }

    #[test]
    fn test_channel_volume_rescales_operators() {
        let mut e = engine();
        note_on(&mut e, 60, 100);
        e.tick(1);

        e.push_event(MidiEvent::ControlChange {
            channel: 0,
            cc: cc::VOLUME,
            value: 64,
        });
        e.tick(1);
        // 48 * 64/127 = 24
        assert_eq!(e.chip().last_operator(0, 0, OpRegister::Volume), Some(24));
    }

    #[test]
    fn test_out_bus_param_reaches_the_chip() {
        let mut e = engine();
        let mut params = VoiceParams::default();
        params.out_bus = 0b01;
        e.set_voice_params(0, params).unwrap();
        e.tick(1);
        assert!(e.chip().writes.iter().any(|w| matches!(
            w,
            ChipWrite::OutputBus { voice: 0, mask: 0b01 }
        )));

        // Hard-right pan masks the enabled left side away.
        e.push_event(MidiEvent::ControlChange {
            channel: 0,
            cc: cc::PAN,
            value: 127,
        });
        e.tick(1);
        assert!(matches!(
            e.chip().writes.last(),
            Some(ChipWrite::OutputBus { voice: 0, mask: 0 })
        ));
    }

    #[test]
    fn test_program_change_uses_latched_bank() {
        let mut e = engine();
        e.push_event(MidiEvent::ControlChange {
            channel: 0,
            cc: cc::BANK_MSB,
            value: 1,
        });
        e.push_event(MidiEvent::ControlChange {
            channel: 0,
            cc: cc::BANK_LSB,
            value: 2,
        });
        e.push_event(MidiEvent::ProgramChange {
            channel: 0,
            program: 5,
        });
        e.tick(1);
        assert_eq!(e.host().patch_requests.last(), Some(&(0, (1 << 7) | 2, 5)));
    }

    #[test]
    fn test_mod_wheel_routed_to_transpose_shifts_pitch() {
        let mut e = engine();
        e.add_connection(0, 10, 0x40, 127).unwrap();
        note_on(&mut e, 60, 100);
        e.tick(1);

        e.push_event(MidiEvent::ControlChange {
            channel: 0,
            cc: cc::MOD_WHEEL,
            value: 12,
        });
        e.tick(1);
        let expected = Temperament::equal().lookup(72);
        assert_eq!(
            e.chip().last_frequency(0),
            Some((expected.block, expected.fnum))
        );
    }

    #[test]
    fn test_four_op_routes_are_rejected_on_two_op_voices() {
        let mut e = engine();
        assert_eq!(
            e.add_connection(0, 2, 0x06, 10).unwrap_err(),
            EngineError::FourOpOnly(2)
        );
        assert_eq!(
            e.add_connection(0, 1, 0x26, 10).unwrap_err(),
            EngineError::FourOpOnly(0x26)
        );

        e.set_four_op(0, true).unwrap();
        e.add_connection(0, 2, 0x26, 10).unwrap();
    }

    #[test]
    fn test_operator_params_bounded_by_operator_count() {
        let mut e = engine();
        assert_eq!(
            e.set_operator_params(0, 2, OperatorParams::default())
                .unwrap_err(),
            EngineError::InvalidDestination(0x20)
        );

        e.set_four_op(0, true).unwrap();
        e.set_operator_params(0, 2, OperatorParams::default())
            .unwrap();
    }

    #[test]
    fn test_depth_self_modulation_takes_effect_next_tick() {
        let mut e = engine();
        // Wheel drives the depth of connection 1; connection 1 itself
        // starts at zero depth.
        e.add_connection(0, 10, 0x89, 127).unwrap();
        e.add_connection(0, 9, 0x06, 0).unwrap();

        e.push_event(MidiEvent::ControlChange {
            channel: 0,
            cc: cc::MOD_WHEEL,
            value: 50,
        });
        note_on(&mut e, 60, 100);
        e.tick(1);
        // Volume still at base: the routed depth lands this tick but
        // is only consumed by the next routing pass.
        assert_eq!(e.chip().last_operator(0, 0, OpRegister::Volume), Some(48));

        e.tick(1);
        // velocity 100 * depth 50/127 = 39; 48 + 39 clamps to 63
        assert_eq!(e.chip().last_operator(0, 0, OpRegister::Volume), Some(63));
    }

    #[test]
    fn test_percussion_voice_never_gates() {
        let mut e = engine();
        let mut params = VoiceParams::default();
        params.percussion = true;
        e.set_voice_params(0, params).unwrap();

        note_on(&mut e, 60, 100);
        e.tick(1);
        assert_eq!(e.chip().last_gate(0), None);
        assert!(e.chip().last_frequency(0).is_some());
    }

    #[test]
    fn test_key_velocity_scales_the_volume_write() {
        let mut e = engine();
        let mut op = OperatorParams::default();
        op.key_velocity = 7; // fully velocity sensitive
        e.set_operator_params(0, 0, op).unwrap();

        note_on(&mut e, 60, 64);
        e.tick(1);
        // scale = 127 - (127-64)*7/7 = 64; 48 * 64/127 = 24
        assert_eq!(e.chip().last_operator(0, 0, OpRegister::Volume), Some(24));
    }

    #[test]
    fn test_muted_operator_writes_zero_volume() {
        let mut e = engine();
        let mut op = OperatorParams::default();
        op.mute = true;
        e.set_operator_params(0, 0, op).unwrap();

        note_on(&mut e, 60, 100);
        e.tick(1);
        assert_eq!(e.chip().last_operator(0, 0, OpRegister::Volume), Some(0));
        // The other operator is unaffected.
        assert_eq!(e.chip().last_operator(0, 1, OpRegister::Volume), Some(48));
    }

    #[test]
    fn test_custom_tuning_switch_retunes_sounding_voices() {
        // Just fifth on semitone 9 pulls A away from 440 Hz.
        let mut ratios: TemperamentRatios = [(1, 1); 12];
        ratios[9] = (3, 2);
        let config = EngineConfig {
            custom_temperament: Some(ratios),
            ..EngineConfig::default()
        };
        let mut e = Engine::new(config, CaptureChip::new(), CaptureHost::default());
        e.assign_voice(0, 0).unwrap();

        note_on(&mut e, 69, 100);
        e.tick(1);
        let equal = Temperament::equal().lookup(69);
        assert_eq!(
            e.chip().last_frequency(0),
            Some((equal.block, equal.fnum))
        );

        e.set_custom_tuning(true);
        e.tick(1);
        let custom = Temperament::custom(&ratios).lookup(69);
        assert_ne!((custom.block, custom.fnum), (equal.block, equal.fnum));
        assert_eq!(
            e.chip().last_frequency(0),
            Some((custom.block, custom.fnum))
        );

        e.set_custom_tuning(false);
        e.tick(1);
        assert_eq!(
            e.chip().last_frequency(0),
            Some((equal.block, equal.fnum))
        );
    }

    #[test]
    fn test_dupl_follow_recopies_parameter_edits() {
        let mut e = engine();
        e.assign_voice(1, 0).unwrap();
        e.set_dupl(1, 0, true).unwrap();

        let mut params = VoiceParams::default();
        params.feedback = 5;
        e.set_voice_params(0, params).unwrap();

        assert_eq!(e.pool().voice(1).unwrap().params.feedback, 5);
        e.tick(1);
        // Both voices got the refreshed feedback write.
        assert!(e.chip().writes.iter().any(|w| matches!(
            w,
            ChipWrite::Algorithm {
                voice: 1,
                feedback: 5,
                ..
            }
        )));
    }
}

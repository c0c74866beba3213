// src/pool.rs
//
// The polyphonic voice pool: channel membership, DUPL/LINK
// relationships, round-robin stealing with the per-channel notestack,
// and sustain-pedal hold semantics.
//
// The pool owns all voice/channel tables. It consumes MIDI note
// facts and produces "voice now plays note N" facts; it never talks
// to the chip.

use log::debug;

use crate::channel::{CHANNEL_COUNT, Channel, ChannelOptions};
use crate::chip::Host;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::voice::{Relation, Voice, VoiceId};

pub struct VoicePool {
    voices: Vec<Voice>,
    channels: Vec<Channel>,
    voices_per_chip: usize,
}

impl VoicePool {
    pub fn new(config: &EngineConfig) -> Self {
        let voices = (0..config.voice_count())
            .map(|id| Voice::new(id, config.delay_line_len))
            .collect();
        let channels = (0..CHANNEL_COUNT)
            .map(|_| {
                Channel::new(
                    ChannelOptions::from(config.channel_defaults),
                    config.notestack_depth,
                )
            })
            .collect();
        Self {
            voices,
            channels,
            voices_per_chip: config.voices_per_chip.max(1),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Accessors
    // ───────────────────────────────────────────────────────────────

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn voice(&self, id: VoiceId) -> EngineResult<&Voice> {
        self.voices.get(id).ok_or(EngineError::InvalidVoice(id))
    }

    pub fn voice_mut(&mut self, id: VoiceId) -> EngineResult<&mut Voice> {
        self.voices
            .get_mut(id)
            .ok_or(EngineError::InvalidVoice(id))
    }

    pub fn channel(&self, ch: usize) -> EngineResult<&Channel> {
        self.channels.get(ch).ok_or(EngineError::InvalidChannel(ch))
    }

    pub fn channel_mut(&mut self, ch: usize) -> EngineResult<&mut Channel> {
        self.channels
            .get_mut(ch)
            .ok_or(EngineError::InvalidChannel(ch))
    }

    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [Voice] {
        &mut self.voices
    }

    /// Voices mapped to a channel, in index order.
    pub fn channel_voices(&self, ch: usize) -> impl Iterator<Item = VoiceId> + '_ {
        self.voices
            .iter()
            .filter(move |v| v.channel == Some(ch))
            .map(|v| v.id)
    }

    /// Voices on the channel the allocator may pick independently.
    fn selectable_voices(&self, ch: usize) -> impl Iterator<Item = VoiceId> + '_ {
        self.voices
            .iter()
            .filter(move |v| v.channel == Some(ch) && v.selectable())
            .map(|v| v.id)
    }

    // ───────────────────────────────────────────────────────────────
    // Channel membership
    // ───────────────────────────────────────────────────────────────

    /// Toggle a voice's membership on a channel.
    ///
    /// Joining an occupied channel with auto-duplicate copies the
    /// first voice's parameters and records a DUPL relationship; a
    /// pending note from the channel's notestack is then replayed on
    /// the new voice. Leaving relocates the first-voice pointer and
    /// retargets DUPLs aimed at the leaving voice.
    pub fn assign(&mut self, voice: VoiceId, ch: usize, host: &mut dyn Host) -> EngineResult<()> {
        self.voice(voice)?;
        self.channel(ch)?;

        if self.voices[voice].channel == Some(ch) {
            self.leave(voice, ch, host);
            return Ok(());
        }

        // Validate the DUPL copy before any state moves.
        let options = self.channels[ch].options;
        if let Some(master) = self.channels[ch].first_voice {
            if options.auto_duplicate && self.voices[master].four_op != self.voices[voice].four_op
            {
                debug!(
                    "assign: rejecting voice {} on channel {}: operator count mismatch with {}",
                    voice, ch, master
                );
                return Err(EngineError::OperatorCountMismatch {
                    master,
                    follower: voice,
                });
            }
        }

        if let Some(old) = self.voices[voice].channel {
            self.leave(voice, old, host);
        }
        self.join(voice, ch, host);
        Ok(())
    }

    fn join(&mut self, voice: VoiceId, ch: usize, host: &mut dyn Host) {
        let options = self.channels[ch].options;
        self.voices[voice].channel = Some(ch);

        match self.channels[ch].first_voice {
            None => {
                self.channels[ch].first_voice = Some(voice);
                self.channels[ch].round_robin = Some(voice);
                if options.auto_duplicate && options.auto_load {
                    let bank = self.channels[ch].pending_bank;
                    host.request_patch(ch, bank, 0);
                }
            }
            Some(master) => {
                if options.auto_duplicate {
                    self.copy_voice(master, voice, true);
                }
            }
        }

        if let Some(pending) = self.channels[ch].notestack.pop_oldest() {
            self.set_voice_and_linked_note(voice, pending.note, pending.velocity, host);
        }
    }

    fn leave(&mut self, voice: VoiceId, ch: usize, host: &mut dyn Host) {
        self.silence_voice(voice, host);
        self.voices[voice].channel = None;
        self.voices[voice].relation = Relation::None;

        let new_first = self.channel_voices(ch).next();

        // Retarget DUPLs aimed at the leaving voice; drop LINKs, they
        // have nothing left to mirror.
        for v in 0..self.voices.len() {
            match self.voices[v].relation {
                Relation::Dupl { master, follow } if master == voice => {
                    self.voices[v].relation = match new_first {
                        Some(first) if first != v => Relation::Dupl {
                            master: first,
                            follow,
                        },
                        _ => Relation::None,
                    };
                }
                Relation::Link { master } if master == voice => {
                    self.voices[v].relation = Relation::None;
                }
                _ => {}
            }
        }

        if self.channels[ch].first_voice == Some(voice) {
            self.channels[ch].first_voice = new_first;
        }
        if self.channels[ch].round_robin == Some(voice) {
            self.channels[ch].round_robin = new_first;
        }

        if new_first.is_none() {
            self.all_notes_off(ch, host);
        }
    }

    /// Copy the full parameter set of `master` onto `follower` and
    /// record the DUPL relationship.
    fn copy_voice(&mut self, master: VoiceId, follower: VoiceId, follow: bool) {
        let (params, ops, connections) = {
            let m = &self.voices[master];
            (m.params.clone(), m.ops, m.connections.clone())
        };
        let f = &mut self.voices[follower];
        f.params = params;
        f.ops = ops;
        f.connections = connections;
        f.live.refresh(&f.params);
        f.relation = Relation::Dupl {
            master,
            follow,
        };
        f.refresh_all = true;
    }

    // ───────────────────────────────────────────────────────────────
    // Note allocation
    // ───────────────────────────────────────────────────────────────

    /// Handle a channel note-on.
    pub fn note_on(
        &mut self,
        ch: usize,
        note: u8,
        velocity: u8,
        host: &mut dyn Host,
    ) -> EngineResult<()> {
        self.channel(ch)?;

        // Retrigger in place if the note is already sounding. A
        // sustain-held copy stays frozen and a fresh voice is
        // allocated instead.
        if let Some(v) = self.find_sounding(ch, note) {
            if !self.voices[v].sustain_held {
                self.set_voice_and_linked_note(v, note, velocity, host);
                return Ok(());
            }
        }

        // A stalled copy in the notestack is superseded by this event.
        self.channels[ch].notestack.remove(note);

        let target = match self.find_free(ch, note) {
            Some(v) => v,
            None => match self.steal_victim(ch) {
                Some(victim) => {
                    let raw = self.voices[victim].raw;
                    if raw.sounding() && !self.voices[victim].sustain_held {
                        self.channels[ch].notestack.push(raw.note, raw.velocity);
                    }
                    // A sustain-held victim's note is dropped, not stacked.
                    victim
                }
                None => {
                    // No voice on this channel yet: park the note; it
                    // replays when a voice joins.
                    self.channels[ch].notestack.push(note, velocity);
                    return Ok(());
                }
            },
        };

        self.set_voice_and_linked_note(target, note, velocity, host);
        self.advance_round_robin(ch);
        Ok(())
    }

    /// Handle a channel note-off.
    pub fn note_off(&mut self, ch: usize, note: u8, host: &mut dyn Host) -> EngineResult<()> {
        self.channel(ch)?;

        let Some(v) = self.find_sounding(ch, note) else {
            // Possibly a note that never got a voice.
            self.channels[ch].notestack.remove(note);
            return Ok(());
        };

        if self.channels[ch].sustain {
            self.voices[v].sustain_held = true;
            return Ok(());
        }

        if let Some(pending) = self.channels[ch].notestack.pop_oldest() {
            self.set_voice_and_linked_note(v, pending.note, pending.velocity, host);
        } else {
            self.silence_voice(v, host);
        }
        Ok(())
    }

    /// Sustain pedal released: replay or silence every held voice.
    pub fn sustain_release(&mut self, ch: usize, host: &mut dyn Host) -> EngineResult<()> {
        self.channel(ch)?;
        let held: Vec<VoiceId> = self
            .channel_voices(ch)
            .filter(|&v| self.voices[v].sustain_held)
            .collect();

        for v in held {
            if let Some(pending) = self.channels[ch].notestack.pop_oldest() {
                self.set_voice_and_linked_note(v, pending.note, pending.velocity, host);
            } else {
                self.silence_voice(v, host);
            }
            self.voices[v].sustain_held = false;
        }
        Ok(())
    }

    /// Silence every voice on the channel and trim its buffers.
    ///
    /// This is the only bulk-abort primitive; it runs between ticks so
    /// it is atomic with respect to the modulation pass.
    pub fn all_notes_off(&mut self, ch: usize, host: &mut dyn Host) {
        let ids: Vec<VoiceId> = self.channel_voices(ch).collect();
        for v in ids {
            self.silence_voice(v, host);
            self.voices[v].sustain_held = false;
            self.voices[v].delay_line.clear();
        }
        self.channels[ch].notestack.clear();
    }

    /// The single mutation point for a voice's raw note state.
    ///
    /// Writes note/velocity, clears the sustain hold, updates the
    /// activity indicator, and mirrors the write onto every voice
    /// LINKed to this one.
    pub fn set_voice_and_linked_note(
        &mut self,
        voice: VoiceId,
        note: u8,
        velocity: u8,
        host: &mut dyn Host,
    ) {
        self.write_note(voice, note, velocity, host);

        for v in 0..self.voices.len() {
            if let Relation::Link { master } = self.voices[v].relation {
                if master == voice {
                    self.write_note(v, note, velocity, host);
                }
            }
        }
    }

    fn write_note(&mut self, voice: VoiceId, note: u8, velocity: u8, host: &mut dyn Host) {
        let v = &mut self.voices[voice];
        v.raw.note = note;
        v.raw.velocity = velocity;
        v.raw.updated = true;
        v.raw.retrig = velocity > 0;
        v.sustain_held = false;

        let active = velocity > 0;
        if v.active_indicator != active {
            v.active_indicator = active;
            host.voice_activity(voice, active);
        }
    }

    fn silence_voice(&mut self, voice: VoiceId, host: &mut dyn Host) {
        let note = self.voices[voice].raw.note;
        self.set_voice_and_linked_note(voice, note, 0, host);
    }

    /// Sounding, independently-allocated voice on `ch` playing `note`.
    pub fn find_sounding(&self, ch: usize, note: u8) -> Option<VoiceId> {
        self.selectable_voices(ch)
            .find(|&v| self.voices[v].raw.sounding() && self.voices[v].raw.note == note)
    }

    /// Two-pass free-voice search: first a silent voice whose last
    /// note matches, then any silent, non-held voice.
    fn find_free(&self, ch: usize, note: u8) -> Option<VoiceId> {
        let free = |v: &Voice| !v.raw.sounding() && !v.sustain_held;

        if let Some(v) = self
            .selectable_voices(ch)
            .find(|&v| free(&self.voices[v]) && self.voices[v].raw.note == note)
        {
            return Some(v);
        }

        // The second pass starts at the round-robin pointer so fresh
        // notes spread across the channel's voices.
        let ids: Vec<VoiceId> = self.selectable_voices(ch).collect();
        let start = self.channels[ch]
            .round_robin
            .and_then(|rr| ids.iter().position(|&v| v == rr))
            .unwrap_or(0);
        (0..ids.len())
            .map(|i| ids[(start + i) % ids.len()])
            .find(|&v| free(&self.voices[v]))
    }

    fn steal_victim(&self, ch: usize) -> Option<VoiceId> {
        self.channels[ch]
            .round_robin
            .filter(|&v| self.voices[v].channel == Some(ch))
            .or_else(|| self.selectable_voices(ch).next())
    }

    fn advance_round_robin(&mut self, ch: usize) {
        let ids: Vec<VoiceId> = self.selectable_voices(ch).collect();
        if ids.is_empty() {
            self.channels[ch].round_robin = None;
            return;
        }
        let next = match self.channels[ch].round_robin {
            Some(cur) => ids
                .iter()
                .copied()
                .find(|&v| v > cur)
                .unwrap_or(ids[0]),
            None => ids[0],
        };
        self.channels[ch].round_robin = Some(next);
    }

    // ───────────────────────────────────────────────────────────────
    // DUPL / LINK / 4-operator topology
    // ───────────────────────────────────────────────────────────────

    /// Make `follower` a parameter copy of `master`.
    pub fn set_dupl(
        &mut self,
        follower: VoiceId,
        master: VoiceId,
        follow: bool,
    ) -> EngineResult<()> {
        self.check_pairing(master, follower)?;
        self.copy_voice(master, follower, follow);
        Ok(())
    }

    /// Make `follower` mirror `master`'s note continuously.
    pub fn set_link(
        &mut self,
        follower: VoiceId,
        master: VoiceId,
        host: &mut dyn Host,
    ) -> EngineResult<()> {
        self.check_pairing(master, follower)?;
        self.voices[follower].relation = Relation::Link { master };

        // Mirror the master's current state immediately.
        let raw = self.voices[master].raw;
        self.write_note(follower, raw.note, raw.velocity, host);
        Ok(())
    }

    pub fn clear_relation(&mut self, voice: VoiceId) -> EngineResult<()> {
        self.voice_mut(voice)?.relation = Relation::None;
        Ok(())
    }

    fn check_pairing(&self, master: VoiceId, follower: VoiceId) -> EngineResult<()> {
        self.voice(master)?;
        self.voice(follower)?;
        if master == follower {
            return Err(EngineError::InvalidVoice(follower));
        }
        if self.voices[master].four_op != self.voices[follower].four_op {
            debug!(
                "pairing {} -> {} rejected: operator count mismatch",
                follower, master
            );
            return Err(EngineError::OperatorCountMismatch { master, follower });
        }
        if self.voices[master].trailing_half || self.voices[follower].trailing_half {
            return Err(EngineError::FourOpConflict(follower));
        }
        Ok(())
    }

    /// Toggle 4-operator mode on a leading voice. The next voice on
    /// the same chip becomes (or stops being) its trailing half.
    ///
    /// Rejected when either half participates in a DUPL/LINK
    /// relationship, as master or follower, or when the partner
    /// already leads a pair of its own.
    pub fn set_four_op(&mut self, voice: VoiceId, enabled: bool) -> EngineResult<VoiceId> {
        self.voice(voice)?;
        let slot = voice % self.voices_per_chip;
        if slot + 1 >= self.voices_per_chip {
            return Err(EngineError::FourOpConflict(voice));
        }
        let partner = voice + 1;
        self.voice(partner)?;

        if self.voices[voice].trailing_half {
            return Err(EngineError::FourOpConflict(voice));
        }
        // Pairs must not overlap: the partner cannot already lead.
        if enabled && self.voices[partner].four_op {
            return Err(EngineError::FourOpConflict(voice));
        }

        for half in [voice, partner] {
            if !self.voices[half].relation.is_none() {
                return Err(EngineError::FourOpConflict(voice));
            }
            if self
                .voices
                .iter()
                .any(|v| v.relation.master() == Some(half))
            {
                return Err(EngineError::FourOpConflict(voice));
            }
        }

        self.voices[voice].four_op = enabled;
        self.voices[partner].trailing_half = enabled;
        if enabled {
            // The trailing half no longer sounds on its own.
            self.voices[partner].raw.velocity = 0;
            self.voices[partner].actual.velocity = 0;
        }
        Ok(partner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chip::CaptureHost;
    use crate::config::EngineConfig;

    fn pool_with(voices: usize) -> VoicePool {
        let config = EngineConfig {
            chips: 1,
            voices_per_chip: voices,
            ..EngineConfig::default()
        };
        VoicePool::new(&config)
    }

    fn setup(voices: usize, ch: usize) -> (VoicePool, CaptureHost) {
        let mut pool = pool_with(voices.max(2));
        let mut host = CaptureHost::default();
        for v in 0..voices {
            pool.assign(v, ch, &mut host).unwrap();
        }
        (pool, host)
    }

    #[test]
    fn test_scenario_a_steal_pushes_and_pops() {
        let (mut pool, mut host) = setup(2, 0);

        pool.note_on(0, 60, 100, &mut host).unwrap();
        pool.note_on(0, 64, 100, &mut host).unwrap();
        pool.note_on(0, 67, 100, &mut host).unwrap();

        // Third note stole a voice; note 60 was parked.
        assert!(pool.channel(0).unwrap().notestack.contains(60));
        let sounding: Vec<u8> = pool
            .voices()
            .iter()
            .filter(|v| v.raw.sounding())
            .map(|v| v.raw.note)
            .collect();
        assert!(sounding.contains(&67));
        assert!(sounding.contains(&64));
        assert!(!sounding.contains(&60));

        // Releasing 67 replays 60 on the freed voice.
        pool.note_off(0, 67, &mut host).unwrap();
        assert!(pool.find_sounding(0, 60).is_some());
        assert!(pool.channel(0).unwrap().notestack.is_empty());
    }

    #[test]
    fn test_scenario_b_sustain_hold_and_release() {
        let (mut pool, mut host) = setup(2, 0);

        pool.channel_mut(0).unwrap().sustain = true;
        pool.note_on(0, 60, 100, &mut host).unwrap();
        pool.note_off(0, 60, &mut host).unwrap();

        let v = pool.find_sounding(0, 60).expect("voice still sounding");
        assert!(pool.voice(v).unwrap().sustain_held);

        pool.channel_mut(0).unwrap().sustain = false;
        pool.sustain_release(0, &mut host).unwrap();
        assert!(pool.find_sounding(0, 60).is_none());
        assert!(!pool.voice(v).unwrap().sustain_held);
    }

    #[test]
    fn test_scenario_d_dupl_operator_count_mismatch() {
        let mut pool = pool_with(4);
        pool.set_four_op(0, true).unwrap();

        // 2-op voice 2 as DUPL follower of 4-op voice 0 is rejected.
        let err = pool.set_dupl(2, 0, true).unwrap_err();
        assert_eq!(
            err,
            EngineError::OperatorCountMismatch {
                master: 0,
                follower: 2
            }
        );
        assert!(pool.voice(2).unwrap().relation.is_none());
    }

    #[test]
    fn test_no_duplicate_note_assignment() {
        let (mut pool, mut host) = setup(3, 0);

        pool.note_on(0, 60, 100, &mut host).unwrap();
        pool.note_on(0, 60, 110, &mut host).unwrap();

        let holders = pool
            .voices()
            .iter()
            .filter(|v| v.selectable() && v.raw.sounding() && v.raw.note == 60)
            .count();
        assert_eq!(holders, 1);
        // Retriggered in place with the new velocity.
        let v = pool.find_sounding(0, 60).unwrap();
        assert_eq!(pool.voice(v).unwrap().raw.velocity, 110);
    }

    #[test]
    fn test_sustain_held_voice_is_not_preferred_over_free() {
        let (mut pool, mut host) = setup(2, 0);

        pool.channel_mut(0).unwrap().sustain = true;
        pool.note_on(0, 60, 100, &mut host).unwrap();
        pool.note_off(0, 60, &mut host).unwrap(); // held

        pool.note_on(0, 64, 100, &mut host).unwrap();

        // 64 landed on the free voice; the held voice still sounds 60.
        assert!(pool.find_sounding(0, 60).is_some());
        assert!(pool.find_sounding(0, 64).is_some());
    }

    #[test]
    fn test_sustain_held_steal_drops_note_instead_of_stacking() {
        let (mut pool, mut host) = setup(1, 0);

        pool.channel_mut(0).unwrap().sustain = true;
        pool.note_on(0, 60, 100, &mut host).unwrap();
        pool.note_off(0, 60, &mut host).unwrap(); // held

        pool.note_on(0, 64, 100, &mut host).unwrap();

        // The held note was dropped, not parked.
        assert!(!pool.channel(0).unwrap().notestack.contains(60));
        assert!(pool.find_sounding(0, 64).is_some());
    }

    #[test]
    fn test_silent_voice_with_matching_last_note_is_preferred() {
        let (mut pool, mut host) = setup(2, 0);

        pool.note_on(0, 60, 100, &mut host).unwrap();
        let first = pool.find_sounding(0, 60).unwrap();
        pool.note_off(0, 60, &mut host).unwrap();

        pool.note_on(0, 72, 100, &mut host).unwrap();
        pool.note_on(0, 60, 90, &mut host).unwrap();

        // 60 returns to the voice that last played it.
        assert_eq!(pool.find_sounding(0, 60), Some(first));
    }

    #[test]
    fn test_link_mirrors_notes_and_is_never_allocated() {
        let (mut pool, mut host) = setup(3, 0);
        pool.set_link(2, 1, &mut host).unwrap();

        pool.note_on(0, 60, 100, &mut host).unwrap();
        pool.note_on(0, 64, 100, &mut host).unwrap();
        pool.note_on(0, 67, 100, &mut host).unwrap();

        // Voice 2 only ever mirrors voice 1.
        let v1 = pool.voice(1).unwrap().raw;
        let v2 = pool.voice(2).unwrap().raw;
        assert_eq!((v1.note, v1.velocity), (v2.note, v2.velocity));
    }

    #[test]
    fn test_dupl_and_link_are_mutually_exclusive() {
        let mut pool = pool_with(4);
        let mut host = CaptureHost::default();

        pool.set_dupl(1, 0, true).unwrap();
        assert!(pool.voice(1).unwrap().relation.is_dupl());

        pool.set_link(1, 2, &mut host).unwrap();
        let rel = pool.voice(1).unwrap().relation;
        assert!(rel.is_link() && !rel.is_dupl());
    }

    #[test]
    fn test_auto_duplicate_copies_params_on_join() {
        let mut pool = pool_with(4);
        let mut host = CaptureHost::default();
        pool.channel_mut(0).unwrap().options.auto_duplicate = true;

        pool.assign(0, 0, &mut host).unwrap();
        pool.voice_mut(0).unwrap().params.feedback = 5;
        pool.assign(1, 0, &mut host).unwrap();

        assert_eq!(pool.voice(1).unwrap().params.feedback, 5);
        assert_eq!(
            pool.voice(1).unwrap().relation,
            Relation::Dupl {
                master: 0,
                follow: true
            }
        );
    }

    #[test]
    fn test_leave_relocates_first_voice_and_retargets_dupls() {
        let mut pool = pool_with(4);
        let mut host = CaptureHost::default();
        pool.channel_mut(0).unwrap().options.auto_duplicate = true;

        for v in 0..3 {
            pool.assign(v, 0, &mut host).unwrap();
        }
        // Voice 0 leaves; voice 1 becomes first, DUPLs retarget.
        pool.assign(0, 0, &mut host).unwrap();

        assert_eq!(pool.channel(0).unwrap().first_voice, Some(1));
        assert_eq!(
            pool.voice(2).unwrap().relation.master(),
            Some(1)
        );
        assert!(pool.voice(1).unwrap().relation.is_none());
    }

    #[test]
    fn test_pending_note_replays_on_join() {
        let mut pool = pool_with(2);
        let mut host = CaptureHost::default();

        // Note arrives before any voice is on the channel.
        pool.note_on(0, 60, 100, &mut host).unwrap();
        assert!(pool.channel(0).unwrap().notestack.contains(60));

        pool.assign(0, 0, &mut host).unwrap();
        assert!(pool.find_sounding(0, 60).is_some());
    }

    #[test]
    fn test_four_op_conflicts_with_relations() {
        let mut pool = pool_with(4);
        let mut host = CaptureHost::default();
        pool.set_link(1, 3, &mut host).unwrap();

        // Voice 1 is voice 0's would-be trailing half and has a LINK.
        assert_eq!(
            pool.set_four_op(0, true).unwrap_err(),
            EngineError::FourOpConflict(0)
        );
        assert!(!pool.voice(0).unwrap().four_op);
    }

    #[test]
    fn test_overlapping_four_op_pairs_are_rejected() {
        let mut pool = pool_with(4);
        pool.set_four_op(1, true).unwrap();

        // Voice 0's would-be trailing half already leads pair (1, 2).
        assert_eq!(
            pool.set_four_op(0, true).unwrap_err(),
            EngineError::FourOpConflict(0)
        );
        assert!(!pool.voice(0).unwrap().four_op);
        assert!(pool.voice(1).unwrap().four_op);
        assert!(!pool.voice(1).unwrap().trailing_half);
    }

    #[test]
    fn test_four_op_at_chip_edge_is_rejected() {
        let mut pool = pool_with(4);
        assert_eq!(
            pool.set_four_op(3, true).unwrap_err(),
            EngineError::FourOpConflict(3)
        );
    }

    #[test]
    fn test_all_notes_off_clears_channel() {
        let (mut pool, mut host) = setup(2, 0);
        pool.note_on(0, 60, 100, &mut host).unwrap();
        pool.note_on(0, 64, 100, &mut host).unwrap();
        pool.note_on(0, 67, 100, &mut host).unwrap();

        pool.all_notes_off(0, &mut host);
        assert!(pool.voices().iter().all(|v| !v.raw.sounding()));
        assert!(pool.channel(0).unwrap().notestack.is_empty());
    }

    #[test]
    fn test_activity_indicators_reach_host() {
        let (mut pool, mut host) = setup(1, 0);
        pool.note_on(0, 60, 100, &mut host).unwrap();
        pool.note_off(0, 60, &mut host).unwrap();

        assert!(host.activity.contains(&(0, true)));
        assert!(host.activity.contains(&(0, false)));
    }
}

// src/pitch.rs
//
// The pitch pipeline: portamento interpolation, transpose/tune/bend
// combination in 1/128-half-step fixed point, and the final lookup
// into the temperament table.

use crate::config::TimeMap;
use crate::temperament::{BlockFnum, Temperament};
use crate::voice::Voice;

/// Fixed-point scale: 128 units per half-step.
pub const FRAC_UNITS: i32 = 128;

/// Exclusive upper bound of the fractional note range.
pub const NOTE_LIMIT: i32 = 127 * FRAC_UNITS;

/// Whether the voice is still gliding toward its destination note.
pub fn porta_active(voice: &Voice, now: u64, tmap: &TimeMap) -> bool {
    if voice.porta_from == voice.actual.note {
        return false;
    }
    let dur = tmap.ms(voice.live.portamento) as u64;
    dur > 0 && now.saturating_sub(voice.porta_start) < dur
}

/// Current target note in 1/128-half-step units, before offsets.
///
/// Inactive portamento yields the destination note exactly; otherwise
/// the value interpolates linearly from the start note over the
/// time-coded duration.
pub fn note_128(voice: &Voice, now: u64, tmap: &TimeMap) -> i32 {
    let dest = voice.actual.note as i32 * FRAC_UNITS;
    if !porta_active(voice, now, tmap) {
        return dest;
    }
    let from = voice.porta_from as i32 * FRAC_UNITS;
    let dur = tmap.ms(voice.live.portamento) as i64;
    let elapsed = now.saturating_sub(voice.porta_start) as i64;
    (from as i64 + (dest - from) as i64 * elapsed / dur) as i32
}

/// Final (block, fnum) for a voice.
///
/// Combines the portamento target with transpose (half-steps around
/// 64), tune (+-1 half-step around 64) and pitch bend (scaled by the
/// voice's bend range), clamps to [0, 127*128), and interpolates the
/// temperament table by the 7-bit fractional remainder.
pub fn compute(
    voice: &Voice,
    bend: i16,
    now: u64,
    tmap: &TimeMap,
    temperament: &Temperament,
) -> BlockFnum {
    let base = note_128(voice, now, tmap);
    let transpose = (voice.live.transpose as i32 - 64) * FRAC_UNITS;
    let tune = (voice.live.tune as i32 - 64) * 2;
    let bend = bend as i32 * (voice.params.bend_range as i32 * FRAC_UNITS) / 8192;

    let value = (base + transpose + tune + bend).clamp(0, NOTE_LIMIT - 1);
    let note = (value / FRAC_UNITS) as u8;
    let frac = (value % FRAC_UNITS) as u8;
    temperament.lookup_interp(note, frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TimeMap, default_time_map};
    use crate::temperament::Temperament;
    use crate::voice::Voice;

    fn tmap() -> TimeMap {
        TimeMap::new(default_time_map())
    }

    fn gliding_voice(from: u8, to: u8, start: u64) -> Voice {
        let mut v = Voice::new(0, 8);
        v.actual.note = to;
        v.actual.velocity = 100;
        v.porta_from = from;
        v.porta_start = start;
        v.live.portamento = 64; // 16 ms in the default map
        v
    }

    #[test]
    fn test_porta_at_zero_elapsed_is_start_note() {
        let tmap = tmap();
        let v = gliding_voice(48, 60, 1000);
        assert_eq!(note_128(&v, 1000, &tmap), 48 * 128);
    }

    #[test]
    fn test_porta_past_duration_is_destination_exactly() {
        let tmap = tmap();
        let v = gliding_voice(48, 60, 1000);
        assert_eq!(note_128(&v, 1016, &tmap), 60 * 128);
        assert_eq!(note_128(&v, 5000, &tmap), 60 * 128);
        assert!(!porta_active(&v, 1016, &tmap));
    }

    #[test]
    fn test_porta_midpoint_interpolates() {
        let tmap = tmap();
        let v = gliding_voice(48, 60, 1000);
        assert_eq!(note_128(&v, 1008, &tmap), 54 * 128);
        assert!(porta_active(&v, 1008, &tmap));
    }

    #[test]
    fn test_zero_porta_time_jumps_immediately() {
        let tmap = tmap();
        let mut v = gliding_voice(48, 60, 1000);
        v.live.portamento = 0;
        assert_eq!(note_128(&v, 1000, &tmap), 60 * 128);
    }

    #[test]
    fn test_transpose_moves_pitch_by_half_steps() {
        let tmap = tmap();
        let temp = Temperament::equal();
        let mut v = gliding_voice(60, 60, 0);

        let center = compute(&v, 0, 0, &tmap, &temp);
        v.live.transpose = 64 + 12;
        let up = compute(&v, 0, 0, &tmap, &temp);
        assert_eq!(up, temp.lookup(72));
        assert_eq!(center, temp.lookup(60));
    }

    #[test]
    fn test_full_bend_is_bend_range_half_steps() {
        let tmap = tmap();
        let temp = Temperament::equal();
        let mut v = gliding_voice(60, 60, 0);
        v.params.bend_range = 2;

        let bent = compute(&v, 8191, 0, &tmap, &temp);
        // 8191/8192 of two half-steps: within interpolation distance
        // of note 62.
        let target = temp.lookup(62);
        let near = temp.lookup_interp(61, 127);
        assert!(bent == target || bent == near);
    }

    #[test]
    fn test_extreme_offsets_clamp() {
        let tmap = tmap();
        let temp = Temperament::equal();
        let mut v = gliding_voice(127, 127, 0);
        v.live.transpose = 127;
        let top = compute(&v, 8191, 0, &tmap, &temp);
        assert!(top.fnum <= 1023 && top.block <= 7);

        let mut v = gliding_voice(0, 0, 0);
        v.live.transpose = 0;
        let bottom = compute(&v, -8192, 0, &tmap, &temp);
        assert_eq!(bottom, temp.lookup(0));
    }
}

// src/temperament.rs
//
// Note number -> chip (block, fnum) tables, equal-tempered or built
// from user ratios. Stateless after construction.

use crate::config::TemperamentRatios;

/// Chip pitch encoding: 3-bit block (octave shift) plus 10-bit
/// frequency number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFnum {
    pub block: u8,
    pub fnum: u16,
}

/// Chip frequency resolution constant: fnum = freq * 2^(20-block) / CLOCK_REF.
const CLOCK_REF: f64 = 49716.0;

const FNUM_MAX: u32 = 1023;
const BLOCK_MAX: u8 = 7;

/// A fully built note -> (block, fnum) table, one entry per MIDI note.
#[derive(Debug, Clone)]
pub struct Temperament {
    table: [BlockFnum; 128],
}

impl Temperament {
    /// Equal temperament, A4 = 440 Hz.
    pub fn equal() -> Self {
        Self::from_fn(equal_freq)
    }

    /// Custom temperament from one ratio per semitone, each relative
    /// to the C at the bottom of its octave.
    pub fn custom(ratios: &TemperamentRatios) -> Self {
        Self::from_fn(|note| {
            let octave = note / 12;
            let semi = (note % 12) as usize;
            let c_freq = equal_freq(octave * 12);
            let (num, den) = ratios[semi];
            if den == 0 {
                return c_freq;
            }
            c_freq * num as f64 / den as f64
        })
    }

    fn from_fn(freq_of: impl Fn(u8) -> f64) -> Self {
        let mut table = [BlockFnum { block: 0, fnum: 0 }; 128];
        for (note, entry) in table.iter_mut().enumerate() {
            *entry = block_fnum(freq_of(note as u8));
        }
        Self { table }
    }

    /// Exact table entry for a note.
    #[inline]
    pub fn lookup(&self, note: u8) -> BlockFnum {
        self.table[(note & 0x7F) as usize]
    }

    /// Entry interpolated toward the next semitone by `frac` (0..=127
    /// in 1/128 half-step units).
    pub fn lookup_interp(&self, note: u8, frac: u8) -> BlockFnum {
        let cur = self.lookup(note);
        if frac == 0 || note >= 127 {
            return cur;
        }
        let next = self.lookup(note + 1);

        // Express the next semitone in the current block; block never
        // decreases as pitch rises.
        let shift = next.block.saturating_sub(cur.block);
        let next_scaled = (next.fnum as u32) << shift;

        let cur_f = cur.fnum as u32;
        let mut fnum = cur_f + (next_scaled.saturating_sub(cur_f) * frac as u32) / 128;
        let mut block = cur.block;
        while fnum > FNUM_MAX && block < BLOCK_MAX {
            fnum >>= 1;
            block += 1;
        }
        BlockFnum {
            block,
            fnum: fnum.min(FNUM_MAX) as u16,
        }
    }
}

/// Equal-tempered frequency of a MIDI note.
fn equal_freq(note: u8) -> f64 {
    440.0 * (2.0f64).powf((note as f64 - 69.0) / 12.0)
}

/// Pick the lowest block whose fnum fits, for maximum resolution.
fn block_fnum(freq: f64) -> BlockFnum {
    for block in 0..=BLOCK_MAX {
        let fnum = (freq * (1u32 << (20 - block)) as f64 / CLOCK_REF).round() as u32;
        if fnum <= FNUM_MAX {
            return BlockFnum {
                block,
                fnum: fnum as u16,
            };
        }
    }
    BlockFnum {
        block: BLOCK_MAX,
        fnum: FNUM_MAX as u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a440_lands_on_known_encoding() {
        let t = Temperament::equal();
        let a4 = t.lookup(69);
        // freq = fnum * CLOCK_REF / 2^(20-block) must reconstruct ~440 Hz
        let freq = a4.fnum as f64 * CLOCK_REF / (1u32 << (20 - a4.block)) as f64;
        assert!((freq - 440.0).abs() < 1.0, "got {} Hz", freq);
        assert!(a4.fnum <= 1023);
    }

    #[test]
    fn test_table_pitch_is_monotonic() {
        let t = Temperament::equal();
        let mut prev = 0.0;
        for note in 0..128u8 {
            let e = t.lookup(note);
            let freq = e.fnum as f64 * CLOCK_REF / (1u32 << (20 - e.block)) as f64;
            assert!(freq >= prev, "note {} not monotonic", note);
            prev = freq;
        }
    }

    #[test]
    fn test_interp_endpoints() {
        let t = Temperament::equal();
        let cur = t.lookup(60);
        assert_eq!(t.lookup_interp(60, 0), cur);

        // Near frac = 127 the interpolated pitch sits just below the
        // next semitone.
        let hi = t.lookup_interp(60, 127);
        let next = t.lookup(61);
        let hi_freq = hi.fnum as f64 / (1u32 << (20 - hi.block)) as f64;
        let next_freq = next.fnum as f64 / (1u32 << (20 - next.block)) as f64;
        let cur_freq = cur.fnum as f64 / (1u32 << (20 - cur.block)) as f64;
        assert!(hi_freq > cur_freq);
        assert!(hi_freq <= next_freq);
    }

    #[test]
    fn test_custom_ratios_just_intonation_fifth() {
        // C major just fifth: ratio 3/2 on semitone 7
        let mut ratios: TemperamentRatios = [(1, 1); 12];
        ratios[7] = (3, 2);
        let t = Temperament::custom(&ratios);

        let c = t.lookup(60);
        let g = t.lookup(67);
        let c_freq = c.fnum as f64 * CLOCK_REF / (1u32 << (20 - c.block)) as f64;
        let g_freq = g.fnum as f64 * CLOCK_REF / (1u32 << (20 - g.block)) as f64;
        assert!((g_freq / c_freq - 1.5).abs() < 0.01);
    }

    #[test]
    fn test_top_of_range_is_clamped() {
        let t = Temperament::equal();
        let top = t.lookup(127);
        assert!(top.block <= 7);
        assert!(top.fnum <= 1023);
    }
}

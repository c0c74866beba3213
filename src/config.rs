// src/config.rs
//
// Boot-time configuration. Consumed once at engine construction;
// nothing here changes while the engine runs.

/// Default options stamped onto every channel at init.
#[derive(Debug, Clone, Copy)]
pub struct ChannelDefaults {
    /// Copy the first voice's parameters onto voices joining the channel.
    pub auto_duplicate: bool,

    /// Request a patch load when a voice joins an empty channel.
    pub auto_load: bool,

    /// Per-CC forwarding enables.
    pub forward_volume: bool,
    pub forward_expression: bool,
    pub forward_pan: bool,
}

impl Default for ChannelDefaults {
    fn default() -> Self {
        Self {
            auto_duplicate: false,
            auto_load: false,
            forward_volume: true,
            forward_expression: true,
            forward_pan: true,
        }
    }
}

/// Custom temperament: one frequency ratio per semitone, relative to
/// the C at the bottom of the octave.
pub type TemperamentRatios = [(u16, u16); 12];

/// Engine configuration, fixed at boot.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of sound chips driven.
    pub chips: usize,

    /// 2-operator voices per chip.
    pub voices_per_chip: usize,

    /// Capacity of each channel's pending-note stack.
    pub notestack_depth: usize,

    /// Length of each voice's note delay line, in slots.
    pub delay_line_len: usize,

    /// Wall-clock milliseconds per delay-line step.
    pub ms_per_delay_step: u32,

    /// Nonlinear time-code -> milliseconds mapping, 256 entries.
    pub time_map: Vec<u32>,

    /// Options stamped onto every channel.
    pub channel_defaults: ChannelDefaults,

    /// Custom tuning ratios, if any. `None` means equal temperament
    /// is the only table built.
    pub custom_temperament: Option<TemperamentRatios>,
}

impl EngineConfig {
    /// Total voices in the pool.
    pub fn voice_count(&self) -> usize {
        self.chips * self.voices_per_chip
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chips: 1,
            voices_per_chip: 18,
            notestack_depth: 8,
            delay_line_len: 64,
            ms_per_delay_step: 10,
            time_map: default_time_map(),
            channel_defaults: ChannelDefaults::default(),
            custom_temperament: None,
        }
    }
}

/// Default time map: exponential, `ms = 2^(code/16)`.
///
/// Code 0 maps to 0 ms so that zero always means "instant".
pub fn default_time_map() -> Vec<u32> {
    let mut table = Vec::with_capacity(256);
    table.push(0);
    for code in 1..256u32 {
        let ms = (2.0f64).powf(code as f64 / 16.0).round() as u32;
        table.push(ms);
    }
    table
}

/// Time-code -> duration lookup.
#[derive(Debug, Clone)]
pub struct TimeMap {
    table: Vec<u32>,
}

impl TimeMap {
    /// Build from a 256-entry table. Shorter tables are padded by
    /// repeating the last entry; missing tables fall back to default.
    pub fn new(mut table: Vec<u32>) -> Self {
        if table.is_empty() {
            table = default_time_map();
        }
        while table.len() < 256 {
            let last = *table.last().unwrap_or(&0);
            table.push(last);
        }
        Self { table }
    }

    #[inline]
    pub fn ms(&self, code: u8) -> u32 {
        self.table[code as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_time_map_is_monotonic() {
        let map = TimeMap::new(default_time_map());
        assert_eq!(map.ms(0), 0);
        for code in 1..=255u8 {
            assert!(map.ms(code) >= map.ms(code - 1));
        }
        // 2^(255/16) is a bit over 63000 ms
        assert!(map.ms(255) > 60_000);
    }

    #[test]
    fn test_short_table_is_padded() {
        let map = TimeMap::new(vec![0, 5, 10]);
        assert_eq!(map.ms(2), 10);
        assert_eq!(map.ms(255), 10);
    }
}

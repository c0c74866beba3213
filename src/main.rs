// src/main.rs
//
// Demo binary: drives the engine with a scripted MIDI sequence
// against a capturing chip driver and prints every register write.

use fmvoice::chip::{CaptureChip, CaptureHost};
use fmvoice::{Engine, EngineConfig, MidiEvent, cc};

fn main() {
    env_logger::init();

    let mut engine = Engine::new(
        EngineConfig::default(),
        CaptureChip::new(),
        CaptureHost::default(),
    );
    for v in 0..4 {
        engine.assign_voice(v, 0).expect("voice assignment");
    }

    // Subtle vibrato: LFO1 into the transpose destination.
    engine.add_connection(0, 3, 0x40, 4).expect("connection");

    let script: &[(u32, MidiEvent)] = &[
        (
            0,
            MidiEvent::NoteOn {
                port: 0,
                channel: 0,
                note: 60,
                velocity: 100,
            },
        ),
        (
            120,
            MidiEvent::NoteOn {
                port: 0,
                channel: 0,
                note: 64,
                velocity: 90,
            },
        ),
        (
            120,
            MidiEvent::NoteOn {
                port: 0,
                channel: 0,
                note: 67,
                velocity: 90,
            },
        ),
        (
            240,
            MidiEvent::ControlChange {
                channel: 0,
                cc: cc::VOLUME,
                value: 80,
            },
        ),
        (
            120,
            MidiEvent::PitchBend {
                channel: 0,
                value: 2048,
            },
        ),
        (
            240,
            MidiEvent::NoteOff {
                port: 0,
                channel: 0,
                note: 60,
            },
        ),
        (
            0,
            MidiEvent::NoteOff {
                port: 0,
                channel: 0,
                note: 64,
            },
        ),
        (
            0,
            MidiEvent::NoteOff {
                port: 0,
                channel: 0,
                note: 67,
            },
        ),
    ];

    for &(wait_ms, event) in script {
        for _ in 0..wait_ms {
            engine.tick(1);
        }
        engine.push_event(event);
    }
    engine.tick(1);

    for write in &engine.chip().writes {
        println!("{:?}", write);
    }
    println!(
        "{} chip writes over {} ms",
        engine.chip().writes.len(),
        engine.now_ms()
    );
}

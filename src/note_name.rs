use crate::mapping::MidiNote;

const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

/// Pitch class of a note letter plus optional accidental (`#`, or `b`/`B` for flat).
/// Flats may wrap below C, so `Cb` yields -1.
pub fn pitch_class(letter: char, accidental: Option<char>) -> Option<i32> {
    let base = match letter.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    match accidental {
        None => Some(base),
        Some('#') => Some(base + 1),
        Some('b') | Some('B') => Some(base - 1),
        Some(_) => None,
    }
}

/// Converts a letter/accidental/octave triple to MIDI, with C3 = 60.
pub fn note_to_midi(letter: char, accidental: Option<char>, octave: i32) -> Option<MidiNote> {
    let pc = pitch_class(letter, accidental)?;
    let midi = (octave + 2) * 12 + pc;
    (0..=127).contains(&midi).then_some(midi as MidiNote)
}

/// Parses a bare note name such as `C#3`, `Db-1` or `bb2`.
pub fn name_to_midi(name: &str) -> Option<MidiNote> {
    let mut chars = name.trim().chars().peekable();
    let letter = chars.next()?;
    let accidental = match chars.peek() {
        Some(&c) if c == '#' || c == 'b' || c == 'B' => {
            chars.next();
            Some(c)
        }
        _ => None,
    };
    let octave: i32 = chars.collect::<String>().parse().ok()?;
    note_to_midi(letter, accidental, octave)
}

/// Formats a MIDI note with sharps, e.g. 61 -> `C#3`.
pub fn midi_to_name(note: MidiNote) -> String {
    format!("{}{}", NOTE_NAMES[(note % 12) as usize], (note / 12) as i32 - 2)
}

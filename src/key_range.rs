use std::collections::HashSet;

use crate::mapping::{MIDI_MAX, MidiNote, SampleMapping};

/// Fills `low_note`/`high_note` for one instrument's mappings from their root notes.
///
/// Mappings are ordered by root (stable, so equal roots keep their input order) and
/// each boundary sits at the midpoint between neighbouring roots. The first mapping
/// starts at 0 and the last ends at 127, so the result partitions the full MIDI range.
/// Equal roots produce degenerate adjacent ranges rather than velocity layers.
pub fn assign_ranges(mappings: &mut [&mut SampleMapping]) {
    if mappings.is_empty() {
        return;
    }
    mappings.sort_by_key(|m| m.root_note);
    let roots: Vec<MidiNote> = mappings.iter().map(|m| m.root_note).collect();
    let boundaries = boundaries_for_roots(&roots);
    for (mapping, (low, high)) in mappings.iter_mut().zip(boundaries) {
        mapping.low_note = low;
        mapping.high_note = high;
    }
}

/// Assigns ranges to groups of mappings (indices into `mappings`) in one pass.
/// A group whose members share a root is one entry and every member gets the
/// same range; a group with mixed roots contributes one entry per member.
pub fn assign_grouped_ranges(mappings: &mut [SampleMapping], groups: &[Vec<usize>]) {
    let mut entries: Vec<Vec<usize>> = Vec::new();
    for group in groups {
        let Some(&first) = group.first() else { continue };
        let root = mappings[first].root_note;
        if group.iter().all(|&i| mappings[i].root_note == root) {
            entries.push(group.clone());
        } else {
            entries.extend(group.iter().map(|&i| vec![i]));
        }
    }

    // Each entry's first member stands in for the whole entry.
    let leads: HashSet<usize> = entries.iter().map(|members| members[0]).collect();
    let mut lead_refs: Vec<&mut SampleMapping> = mappings
        .iter_mut()
        .enumerate()
        .filter(|(i, _)| leads.contains(i))
        .map(|(_, m)| m)
        .collect();
    assign_ranges(&mut lead_refs);

    for members in &entries {
        let (low, high) = mappings[members[0]].key_range();
        for &i in &members[1..] {
            mappings[i].low_note = low;
            mappings[i].high_note = high;
        }
    }
}

/// The range computation on bare roots. `roots` must already be sorted ascending.
pub fn boundaries_for_roots(roots: &[MidiNote]) -> Vec<(MidiNote, MidiNote)> {
    let last = roots.len().saturating_sub(1);
    roots
        .iter()
        .enumerate()
        .map(|(i, &root)| {
            let low = if i == 0 {
                0
            } else {
                midpoint(roots[i - 1], root).saturating_add(1).min(MIDI_MAX)
            };
            let high = if i == last { MIDI_MAX } else { midpoint(root, roots[i + 1]) };
            (low, high)
        })
        .collect()
}

fn midpoint(a: MidiNote, b: MidiNote) -> MidiNote {
    ((a as u16 + b as u16) / 2) as MidiNote
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn at_root(root: u8) -> SampleMapping {
        SampleMapping::single_key(PathBuf::from(format!("/s/{root}.wav")), root)
    }

    fn ranges_of(roots: &[u8]) -> Vec<(u8, u8, u8)> {
        let mut maps: Vec<SampleMapping> = roots.iter().map(|&r| at_root(r)).collect();
        let mut refs: Vec<&mut SampleMapping> = maps.iter_mut().collect();
        assign_ranges(&mut refs);
        let mut out: Vec<(u8, u8, u8)> = maps.iter().map(|m| (m.low_note, m.root_note, m.high_note)).collect();
        out.sort_by_key(|t| t.1);
        out
    }

    #[test]
    fn three_roots_split_at_midpoints() {
        assert_eq!(ranges_of(&[60, 48, 72]), vec![(0, 48, 53), (54, 60, 65), (66, 72, 127)]);
    }

    #[test]
    fn single_mapping_covers_everything() {
        assert_eq!(ranges_of(&[30]), vec![(0, 30, 127)]);
    }

    #[test]
    fn empty_input_is_a_no_op() {
        let mut refs: Vec<&mut SampleMapping> = Vec::new();
        assign_ranges(&mut refs);
        assert!(refs.is_empty());
    }

    #[test]
    fn distinct_roots_partition_the_keyboard() {
        let roots = [0u8, 5, 17, 36, 37, 64, 90, 126, 127];
        let ranges = ranges_of(&roots);
        let mut expected_low = 0u16;
        for &(low, root, high) in &ranges {
            assert_eq!(low as u16, expected_low, "gap or overlap before root {root}");
            assert!(low <= root && root <= high, "root {root} outside {low}-{high}");
            expected_low = high as u16 + 1;
        }
        assert_eq!(expected_low, 128);
    }

    #[test]
    fn velocity_layers_sharing_a_root_share_a_range() {
        let mut maps = vec![at_root(72), at_root(48), at_root(48), at_root(60), at_root(62)];
        maps[2].velocity_low = 64;
        // [48 soft, 48 loud] is one keygroup, [60, 62] a keygroup with mixed roots.
        assign_grouped_ranges(&mut maps, &[vec![1, 2], vec![0], vec![3, 4]]);
        let ranges: Vec<(u8, u8)> = maps.iter().map(|m| m.key_range()).collect();
        assert_eq!(ranges, vec![(68, 127), (0, 54), (0, 54), (55, 61), (62, 67)]);
    }

    #[test]
    fn equal_roots_keep_input_order() {
        let mut maps = vec![at_root(60), at_root(60)];
        maps[0].sample_path = PathBuf::from("/s/first.wav");
        maps[1].sample_path = PathBuf::from("/s/second.wav");
        let mut refs: Vec<&mut SampleMapping> = maps.iter_mut().collect();
        assign_ranges(&mut refs);
        assert_eq!((maps[0].low_note, maps[0].high_note), (0, 60));
        assert_eq!((maps[1].low_note, maps[1].high_note), (61, 127));
    }
}

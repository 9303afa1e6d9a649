use anyhow::{Context, Result, anyhow};
use rustfft::{FftPlanner, num_complex::Complex};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::mapping::MidiNote;

/// Below this many frames the FFT has too little resolution to be worth trying.
pub const MIN_ANALYSIS_FRAMES: usize = 2048;
const MIN_FREQUENCY_HZ: f64 = 20.0;

/// Mono audio plus its rate.
#[derive(Debug, Clone)]
pub struct MonoClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decodes at most `max_seconds` of the first audio track, down-mixed to mono.
/// The read stops as soon as enough frames are collected, whatever the file size.
pub fn decode_head(path: &Path, max_seconds: f32) -> Result<MonoClip> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let opened = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .with_context(|| format!("Unsupported audio format: {:?}", path))?;
    let mut format = opened.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No audio track in {:?}", path))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate in {:?}", path))?;
    let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let frame_limit = ((sample_rate as f32 * max_seconds).ceil() as usize).max(1);
    let mut samples = Vec::with_capacity(frame_limit);

    'packets: loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                log::debug!("[decode_head] Skipping undecodable packet in {:?}: {}", path, e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);

        for frame in buffer.samples().chunks(channels) {
            samples.push(frame.iter().sum::<f32>() / channels as f32);
            if samples.len() >= frame_limit {
                break 'packets;
            }
        }
    }

    Ok(MonoClip { samples, sample_rate })
}

/// Frequency of the strongest non-DC bin, or `None` when the clip is too short or silent.
pub fn dominant_frequency(samples: &[f32], sample_rate: u32, silence_threshold: f32) -> Option<f64> {
    if samples.len() < MIN_ANALYSIS_FRAMES || sample_rate == 0 {
        return None;
    }

    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64;
    let rms = (samples.iter().map(|&s| (s as f64 - mean).powi(2)).sum::<f64>() / samples.len() as f64).sqrt();
    if rms < silence_threshold as f64 {
        return None;
    }

    // Largest power of two that fits, so every bin is backed by real audio.
    let fft_size = 1usize << (usize::BITS - 1 - samples.len().leading_zeros());
    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_size);

    let mut buffer: Vec<Complex<f64>> = samples
        .iter()
        .take(fft_size)
        .enumerate()
        .map(|(i, &s)| {
            let window = 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / fft_size as f64).cos());
            Complex::new((s as f64 - mean) * window, 0.0)
        })
        .collect();

    fft.process(&mut buffer);

    let nyquist = fft_size / 2;
    let freq_resolution = sample_rate as f64 / fft_size as f64;
    let min_bin = ((MIN_FREQUENCY_HZ / freq_resolution).ceil() as usize).max(1);

    let (best_bin, best_magnitude) = buffer
        .iter()
        .take(nyquist)
        .enumerate()
        .skip(min_bin)
        .map(|(i, c)| (i, c.norm()))
        .fold((0usize, 0.0f64), |best, cur| if cur.1 > best.1 { cur } else { best });

    if best_bin == 0 || best_magnitude <= 0.0 {
        return None;
    }
    Some(best_bin as f64 * freq_resolution)
}

/// `69 + 12*log2(f/440)`, rounded; `None` outside the MIDI range.
pub fn frequency_to_midi(freq: f64) -> Option<MidiNote> {
    if !freq.is_finite() || freq <= 0.0 {
        return None;
    }
    let midi = (69.0 + 12.0 * (freq / 440.0).log2()).round();
    (0.0..=127.0).contains(&midi).then_some(midi as MidiNote)
}

/// Full stage: bounded decode, then the dominant bin converted to a note.
pub fn estimate_root_note(path: &Path, max_seconds: f32, silence_threshold: f32) -> Result<Option<MidiNote>> {
    let clip = decode_head(path, max_seconds)?;
    let note = dominant_frequency(&clip.samples, clip.sample_rate, silence_threshold).and_then(frequency_to_midi);
    log::debug!("[Spectral] {:?}: {} frames @ {} Hz -> {:?}", path, clip.samples.len(), clip.sample_rate, note);
    Ok(note)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, rate: u32, seconds: f32, dc: f32) -> Vec<f32> {
        let n = (rate as f32 * seconds) as usize;
        (0..n)
            .map(|i| dc + 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn a440_is_midi_69() {
        let freq = dominant_frequency(&sine(440.0, 44100, 1.0, 0.0), 44100, 1e-4).unwrap();
        assert_eq!(frequency_to_midi(freq), Some(69));
    }

    #[test]
    fn dc_offset_does_not_win() {
        let freq = dominant_frequency(&sine(261.63, 48000, 1.0, 0.4), 48000, 1e-4).unwrap();
        assert_eq!(frequency_to_midi(freq), Some(60));
    }

    #[test]
    fn silence_and_short_clips_are_rejected() {
        assert_eq!(dominant_frequency(&vec![0.0; 44100], 44100, 1e-4), None);
        assert_eq!(dominant_frequency(&sine(440.0, 44100, 0.01, 0.0), 44100, 1e-4), None);
    }

    #[test]
    fn frequency_conversion_bounds() {
        assert_eq!(frequency_to_midi(8.1758), Some(0));
        assert_eq!(frequency_to_midi(12543.85), Some(127));
        assert_eq!(frequency_to_midi(20000.0), None);
        assert_eq!(frequency_to_midi(0.0), None);
    }

    #[test]
    fn decode_reads_at_most_the_requested_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in sine(220.0, 22050, 3.0, 0.0) {
            let v = (s * i16::MAX as f32) as i16;
            writer.write_sample(v).unwrap();
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();

        let clip = decode_head(&path, 1.0).unwrap();
        assert_eq!(clip.sample_rate, 22050);
        assert_eq!(clip.samples.len(), 22050);
        assert_eq!(estimate_root_note(&path, 1.0, 1e-4).unwrap(), Some(57));
    }
}

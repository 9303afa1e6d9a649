use anyhow::{Context, Result, anyhow};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use crate::mapping::MidiNote;

/// Holds format information from the 'fmt ' chunk.
#[derive(Debug, Clone, Copy)]
pub struct WavFmt {
    pub audio_format: u16, // 1 = PCM, 3 = IEEE Float
    pub num_channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

/// Result of one pass over a RIFF/WAVE file's chunk list.
#[derive(Debug)]
pub struct RiffLayout {
    pub fmt: Option<WavFmt>,
    /// (offset, size) of the 'data' chunk payload, size capped at the file's end.
    pub data: Option<(u64, u32)>,
    /// Raw payload of the 'smpl' chunk.
    pub smpl: Option<Vec<u8>>,
}

/// What the 'smpl' chunk tells us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerInfo {
    pub unity_note: u32,
    /// (loop_start, loop_end) of the first loop, in frames.
    pub first_loop: Option<(u32, u32)>,
}

const SMPL_HEADER_LEN: usize = 36;
const SMPL_LOOP_LEN: usize = 24;
const SMPL_UNITY_NOTE_OFFSET: usize = 12;
const FMT_MIN_LEN: u64 = 16;

/// Walks the chunk list of a WAV file. Only 'fmt ' and 'smpl' are read; every other
/// chunk is seeked over. Declared sizes are checked against the stream length
/// before anything is allocated.
pub fn parse_wav_metadata<R: Read + Seek>(reader: &mut R, full_path_for_logs: &Path) -> Result<RiffLayout> {
    let mut header = [0; 4];
    reader.read_exact(&mut header)?;
    if &header != b"RIFF" {
        return Err(anyhow!("Not a RIFF file (found {:?}): {:?}", header, full_path_for_logs));
    }

    let _file_size = reader.read_u32::<LittleEndian>()?;
    let mut wave_header = [0; 4];
    reader.read_exact(&mut wave_header)?;
    if &wave_header != b"WAVE" {
        return Err(anyhow!("Not a WAVE file: {:?}", full_path_for_logs));
    }

    let chunks_start = reader.stream_position()?;
    let stream_len = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(chunks_start))?;

    let mut layout = RiffLayout { fmt: None, data: None, smpl: None };

    while let Ok(chunk_id) = reader.read_u32::<LittleEndian>().map(|id| id.to_le_bytes()) {
        let Ok(chunk_size) = reader.read_u32::<LittleEndian>() else { break };
        let chunk_data_start_pos = reader.stream_position()?;
        let remaining = stream_len.saturating_sub(chunk_data_start_pos);
        let declared = chunk_size as u64;
        let next_chunk_aligned_pos = chunk_data_start_pos + declared + declared % 2;

        match &chunk_id {
            b"fmt " => {
                if declared < FMT_MIN_LEN || declared > remaining {
                    return Err(anyhow!(
                        "'fmt ' chunk declares {} bytes, {} available: {:?}",
                        declared,
                        remaining,
                        full_path_for_logs
                    ));
                }
                let audio_format = reader.read_u16::<LittleEndian>()?;
                let num_channels = reader.read_u16::<LittleEndian>()?;
                let sample_rate = reader.read_u32::<LittleEndian>()?;
                let _byte_rate = reader.read_u32::<LittleEndian>()?;
                let _block_align = reader.read_u16::<LittleEndian>()?;
                let bits_per_sample = reader.read_u16::<LittleEndian>()?;
                layout.fmt = Some(WavFmt { audio_format, num_channels, sample_rate, bits_per_sample });
            }
            b"data" => {
                layout.data = Some((chunk_data_start_pos, declared.min(remaining) as u32));
            }
            b"smpl" => {
                if declared > remaining {
                    log::warn!(
                        "[parse_wav_metadata] 'smpl' chunk declares {} bytes, only {} left in {:?}",
                        declared,
                        remaining,
                        full_path_for_logs
                    );
                    break;
                }
                let mut smpl = vec![0; chunk_size as usize];
                reader.read_exact(&mut smpl)?;
                layout.smpl = Some(smpl);
            }
            _ => {}
        }
        if next_chunk_aligned_pos >= stream_len {
            break; // Last chunk, or one that claims to run past the end
        }
        reader.seek(SeekFrom::Start(next_chunk_aligned_pos))?;
    }

    Ok(layout)
}

/// Parses a 'smpl' chunk's data.
pub fn parse_smpl_chunk(data: &[u8]) -> Option<SamplerInfo> {
    if data.len() < SMPL_HEADER_LEN {
        log::warn!("[parse_smpl_chunk] 'smpl' data is too short for header: {} bytes", data.len());
        return None;
    }
    let mut cursor = Cursor::new(data);
    cursor.seek(SeekFrom::Start(SMPL_UNITY_NOTE_OFFSET as u64)).ok()?;
    let unity_note = cursor.read_u32::<LittleEndian>().ok()?;

    cursor.seek(SeekFrom::Start(28)).ok()?;
    let num_sample_loops = cursor.read_u32::<LittleEndian>().ok()?;

    let mut first_loop = None;
    if num_sample_loops > 0 && data.len() >= SMPL_HEADER_LEN + SMPL_LOOP_LEN {
        cursor.seek(SeekFrom::Start(SMPL_HEADER_LEN as u64)).ok()?;
        let _cue_point_id = cursor.read_u32::<LittleEndian>().ok()?;
        let _loop_type = cursor.read_u32::<LittleEndian>().ok()?;
        let loop_start = cursor.read_u32::<LittleEndian>().ok()?;
        let loop_end = cursor.read_u32::<LittleEndian>().ok()?;
        log::debug!("[parse_smpl_chunk] Found loop: {} -> {}", loop_start, loop_end);
        first_loop = Some((loop_start, loop_end));
    }

    Some(SamplerInfo { unity_note, first_loop })
}

/// Number of frames in a WAV file's 'data' chunk, from the chunk headers alone.
pub fn wav_frame_count(path: &Path) -> Result<Option<u64>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let layout = parse_wav_metadata(&mut BufReader::new(file), path)?;
    Ok(match (layout.fmt, layout.data) {
        (Some(fmt), Some((_, size))) => {
            let frame_bytes = fmt.num_channels as u64 * (fmt.bits_per_sample as u64).div_ceil(8);
            (frame_bytes > 0).then(|| size as u64 / frame_bytes)
        }
        _ => None,
    })
}

/// Reads the root key a sampler stored in the file: 'smpl' for WAV, 'INST' for AIFF.
/// `Ok(None)` means the container is readable but carries no usable root key.
pub fn read_embedded_root_note(path: &Path) -> Result<Option<MidiNote>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    reader.seek(SeekFrom::Start(0))?;

    let note = match &magic {
        b"RIFF" => parse_wav_metadata(&mut reader, path)?
            .smpl
            .and_then(|data| parse_smpl_chunk(&data))
            .map(|info| info.unity_note),
        b"FORM" => read_aiff_base_note(&mut reader, path)?.map(|n| n as u32),
        _ => return Err(anyhow!("Unrecognised audio container {:?}: {:?}", magic, path)),
    };

    Ok(note.filter(|&n| n <= 127).map(|n| n as MidiNote))
}

/// The 'smpl' chunk of a WAV file, if it has a readable one.
pub fn read_sampler_info(path: &Path) -> Result<Option<SamplerInfo>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let layout = parse_wav_metadata(&mut BufReader::new(file), path)?;
    Ok(layout.smpl.and_then(|data| parse_smpl_chunk(&data)))
}

/// Walks an AIFF/AIFC FORM and returns the 'INST' chunk's base note, if any.
fn read_aiff_base_note<R: Read + Seek>(reader: &mut R, path: &Path) -> Result<Option<i8>> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let _form_size = reader.read_u32::<BigEndian>()?;
    let mut form_type = [0u8; 4];
    reader.read_exact(&mut form_type)?;
    if &form_type != b"AIFF" && &form_type != b"AIFC" {
        return Err(anyhow!("Not an AIFF file: {:?}", path));
    }

    while let Ok(chunk_id) = reader.read_u32::<BigEndian>().map(|id| id.to_be_bytes()) {
        let Ok(chunk_size) = reader.read_u32::<BigEndian>() else { break };
        let start = reader.stream_position()?;
        if &chunk_id == b"INST" {
            if chunk_size < 1 {
                return Ok(None);
            }
            return Ok(Some(reader.read_i8()?));
        }
        let next = start + chunk_size as u64 + (chunk_size as u64 % 2);
        if reader.seek(SeekFrom::Start(next)).is_err() {
            break;
        }
    }
    Ok(None)
}

/// Rewrites a WAV image so its 'smpl' chunk carries `note` as the MIDI unity note.
/// An existing 'smpl' chunk is patched in place, otherwise a loop-less one is appended.
/// All other chunks are kept byte for byte and in order.
pub fn set_smpl_root_note(image: &[u8], note: MidiNote) -> Result<Vec<u8>> {
    if image.len() < 12 || &image[0..4] != b"RIFF" || &image[8..12] != b"WAVE" {
        return Err(anyhow!("Not a RIFF/WAVE image"));
    }

    let mut chunks: Vec<([u8; 4], Vec<u8>)> = Vec::new();
    let mut pos = 12usize;
    while pos + 8 <= image.len() {
        let id: [u8; 4] = [image[pos], image[pos + 1], image[pos + 2], image[pos + 3]];
        let size = u32::from_le_bytes([image[pos + 4], image[pos + 5], image[pos + 6], image[pos + 7]]) as usize;
        let start = pos + 8;
        let end = (start + size).min(image.len());
        chunks.push((id, image[start..end].to_vec()));
        pos = start + size + size % 2;
    }

    let sample_rate = chunks
        .iter()
        .find(|(id, _)| id == b"fmt ")
        .filter(|(_, data)| data.len() >= 8)
        .map(|(_, data)| u32::from_le_bytes([data[4], data[5], data[6], data[7]]))
        .unwrap_or(44100);

    match chunks.iter().position(|(id, _)| id == b"smpl") {
        Some(index) => {
            let data = &mut chunks[index].1;
            if data.len() < SMPL_HEADER_LEN {
                data.resize(SMPL_HEADER_LEN, 0);
            }
            data[SMPL_UNITY_NOTE_OFFSET..SMPL_UNITY_NOTE_OFFSET + 4].copy_from_slice(&(note as u32).to_le_bytes());
        }
        None => {
            let mut data = Vec::with_capacity(SMPL_HEADER_LEN);
            data.write_u32::<LittleEndian>(0)?; // manufacturer
            data.write_u32::<LittleEndian>(0)?; // product
            data.write_u32::<LittleEndian>(1_000_000_000 / sample_rate.max(1))?; // sample period, ns
            data.write_u32::<LittleEndian>(note as u32)?;
            data.write_u32::<LittleEndian>(0)?; // pitch fraction
            data.write_u32::<LittleEndian>(0)?; // SMPTE format
            data.write_u32::<LittleEndian>(0)?; // SMPTE offset
            data.write_u32::<LittleEndian>(0)?; // loop count
            data.write_u32::<LittleEndian>(0)?; // sampler data
            chunks.push((*b"smpl", data));
        }
    }

    let body_len: usize = chunks.iter().map(|(_, d)| 8 + d.len() + d.len() % 2).sum();
    let mut out = Vec::with_capacity(12 + body_len);
    out.extend_from_slice(b"RIFF");
    out.write_u32::<LittleEndian>((4 + body_len) as u32)?;
    out.extend_from_slice(b"WAVE");
    for (id, data) in &chunks {
        out.extend_from_slice(id);
        out.write_u32::<LittleEndian>(data.len() as u32)?;
        out.extend_from_slice(data);
        if data.len() % 2 != 0 {
            out.write_u8(0)?; // padding byte
        }
    }
    Ok(out)
}

/// Stores `note` in the WAV file's 'smpl' chunk. Returns false when it already matched.
pub fn write_wav_root_note(path: &Path, note: MidiNote) -> Result<bool> {
    let image = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let current = {
        let mut cursor = Cursor::new(image.as_slice());
        parse_wav_metadata(&mut cursor, path)?
            .smpl
            .and_then(|data| parse_smpl_chunk(&data))
            .map(|info| info.unity_note)
    };
    if current == Some(note as u32) {
        return Ok(false);
    }
    let updated = set_smpl_root_note(&image, note)?;
    fs::write(path, updated).with_context(|| format!("Failed to write {:?}", path))?;
    log::info!("[WavRootNote] {:?} -> {}", path, note);
    Ok(true)
}

//! WAV framing for 16-bit linear PCM.

use thiserror::Error;

const BITS_PER_SAMPLE: u16 = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WavError {
    #[error("not a RIFF/WAVE file")]
    NotWave,

    #[error("truncated {0} chunk")]
    Truncated(&'static str),

    #[error("missing {0} chunk")]
    Missing(&'static str),

    #[error("unsupported format tag {0}")]
    UnsupportedFormat(u16),
}

/// A parsed WAV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wav {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub data: Vec<u8>,
}

/// Wrap raw little-endian 16-bit PCM bytes in a WAV container.
pub fn frame_pcm(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let pad = pcm.len() % 2;
    let byte_rate = sample_rate * channels as u32 * BITS_PER_SAMPLE as u32 / 8;
    let block_align = channels * BITS_PER_SAMPLE / 8;
    let file_size = 36 + data_len + pad as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len() + pad);

    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&file_size.to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

    // data chunk, padded to an even length
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    if pad == 1 {
        wav.push(0);
    }

    wav
}

/// Parse a WAV container back into its format and PCM bytes.
pub fn parse_wav(bytes: &[u8]) -> Result<Wav, WavError> {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err(WavError::NotWave);
    }

    let mut format: Option<(u32, u16, u16)> = None;
    let mut offset = 12;

    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        let body_start = offset + 8;
        let body = bytes.get(body_start..body_start + size);

        match id {
            b"fmt " => {
                let body = body.filter(|b| b.len() >= 16).ok_or(WavError::Truncated("fmt"))?;
                let tag = u16::from_le_bytes([body[0], body[1]]);
                if tag != 1 {
                    return Err(WavError::UnsupportedFormat(tag));
                }
                let channels = u16::from_le_bytes([body[2], body[3]]);
                let sample_rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let bits = u16::from_le_bytes([body[14], body[15]]);
                format = Some((sample_rate, channels, bits));
            }
            b"data" => {
                let (sample_rate, channels, bits_per_sample) =
                    format.ok_or(WavError::Missing("fmt"))?;
                let data = body.ok_or(WavError::Truncated("data"))?;
                return Ok(Wav {
                    sample_rate,
                    channels,
                    bits_per_sample,
                    data: data.to_vec(),
                });
            }
            _ => {}
        }

        // Chunks are word-aligned
        offset = body_start + size + size % 2;
    }

    Err(WavError::Missing("data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_generation() {
        let pcm = vec![0u8; 24000 * 2]; // 1 second at 24kHz
        let wav = frame_pcm(&pcm, 24000, 1);

        assert_eq!(wav.len(), 44 + pcm.len());
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        assert_eq!(&wav[36..40], b"data");

        let sr = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sr, 24000);
        let byte_rate = u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]);
        assert_eq!(byte_rate, 48000);
    }

    #[test]
    fn test_round_trip_24khz_mono() {
        let pcm: Vec<u8> = (0..4801u32).map(|i| (i * 7 % 251) as u8).collect();
        let parsed = parse_wav(&frame_pcm(&pcm, 24000, 1)).unwrap();
        assert_eq!(parsed.sample_rate, 24000);
        assert_eq!(parsed.channels, 1);
        assert_eq!(parsed.bits_per_sample, 16);
        assert_eq!(parsed.data, pcm);
    }

    #[test]
    fn test_round_trip_empty() {
        let parsed = parse_wav(&frame_pcm(&[], 16000, 2)).unwrap();
        assert!(parsed.data.is_empty());
        assert_eq!(parsed.channels, 2);
    }

    #[test]
    fn test_skips_unknown_chunks() {
        let framed = frame_pcm(&[1, 2, 3, 4], 24000, 1);
        let mut wav = framed[..36].to_vec();
        wav.extend_from_slice(b"LIST");
        wav.extend_from_slice(&3u32.to_le_bytes());
        wav.extend_from_slice(&[9, 9, 9, 0]);
        wav.extend_from_slice(&framed[36..]);
        assert_eq!(parse_wav(&wav).unwrap().data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_wav(b"hello"), Err(WavError::NotWave));
        let mut truncated = frame_pcm(&[0; 100], 24000, 1);
        truncated.truncate(60);
        assert_eq!(parse_wav(&truncated), Err(WavError::Truncated("data")));
    }
}

//! Fixed-layout 44-byte RIFF/WAVE header.

use crate::error::{Result, VozError};

pub const WAV_HEADER_LEN: usize = 44;

/// The classic canonical WAV header. Only the fields the compatibility gate
/// looks at are interpreted; everything else is carried verbatim.
#[derive(Debug, Clone, Copy)]
pub struct WavHeader {
    pub riff: [u8; 4],
    pub chunk_size: u32,
    pub wave: [u8; 4],
    pub fmt: [u8; 4],
    pub subchunk1_size: u32,
    pub audio_format: u16,
    pub num_channels: u16,
    pub sample_rate: u32,
    pub bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    pub subchunk2_id: [u8; 4],
    pub subchunk2_size: u32,
}

impl WavHeader {
    pub fn parse(raw: &[u8; WAV_HEADER_LEN]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([raw[i], raw[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            riff: [raw[0], raw[1], raw[2], raw[3]],
            chunk_size: u32_at(4),
            wave: [raw[8], raw[9], raw[10], raw[11]],
            fmt: [raw[12], raw[13], raw[14], raw[15]],
            subchunk1_size: u32_at(16),
            audio_format: u16_at(20),
            num_channels: u16_at(22),
            sample_rate: u32_at(24),
            bytes_per_sec: u32_at(28),
            block_align: u16_at(32),
            bits_per_sample: u16_at(34),
            subchunk2_id: [raw[36], raw[37], raw[38], raw[39]],
            subchunk2_size: u32_at(40),
        }
    }

    /// The stream behind the header is usable when it is 16-bit mono PCM at
    /// 16kHz and the data sub-chunk is where the canonical layout puts it.
    pub fn check_compatible(&self) -> Result<()> {
        let ok = self.audio_format == 1
            && self.num_channels == 1
            && self.sample_rate == crate::SAMPLE_RATE
            && self.bits_per_sample == 16
            && self.subchunk2_id[0] == b'd'
            && self.subchunk2_id[3] == b'a';
        if ok {
            Ok(())
        } else {
            Err(VozError::Config(format!(
                "unsupported wav stream: format={} channels={} rate={} bits={}",
                self.audio_format, self.num_channels, self.sample_rate, self.bits_per_sample
            )))
        }
    }

    pub fn num_samples(&self) -> u32 {
        let bytes_per_sample = (self.bits_per_sample / 8).max(1) as u32;
        self.subchunk2_size / (bytes_per_sample * self.num_channels.max(1) as u32)
    }
}

#[cfg(test)]
pub(crate) fn test_header(rate: u32, channels: u16, bits: u16) -> [u8; WAV_HEADER_LEN] {
    let mut raw = [0u8; WAV_HEADER_LEN];
    raw[0..4].copy_from_slice(b"RIFF");
    raw[4..8].copy_from_slice(&36u32.to_le_bytes());
    raw[8..12].copy_from_slice(b"WAVE");
    raw[12..16].copy_from_slice(b"fmt ");
    raw[16..20].copy_from_slice(&16u32.to_le_bytes());
    raw[20..22].copy_from_slice(&1u16.to_le_bytes());
    raw[22..24].copy_from_slice(&channels.to_le_bytes());
    raw[24..28].copy_from_slice(&rate.to_le_bytes());
    raw[28..32].copy_from_slice(&(rate * 2).to_le_bytes());
    raw[32..34].copy_from_slice(&2u16.to_le_bytes());
    raw[34..36].copy_from_slice(&bits.to_le_bytes());
    raw[36..40].copy_from_slice(b"data");
    raw[40..44].copy_from_slice(&32000u32.to_le_bytes());
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_header() {
        let raw = test_header(16000, 1, 16);
        let hdr = WavHeader::parse(&raw);
        assert_eq!(hdr.sample_rate, 16000);
        assert_eq!(hdr.num_channels, 1);
        assert_eq!(hdr.bits_per_sample, 16);
        assert!(hdr.check_compatible().is_ok());
        assert_eq!(hdr.num_samples(), 16000);
    }

    #[test]
    fn rejects_wrong_rate_and_channels() {
        let hdr = WavHeader::parse(&test_header(44100, 1, 16));
        assert!(hdr.check_compatible().is_err());
        let hdr = WavHeader::parse(&test_header(16000, 2, 16));
        assert!(hdr.check_compatible().is_err());
        let hdr = WavHeader::parse(&test_header(16000, 1, 8));
        assert!(hdr.check_compatible().is_err());
    }

    #[test]
    fn rejects_missing_data_chunk() {
        let mut raw = test_header(16000, 1, 16);
        raw[36..40].copy_from_slice(b"LIST");
        let hdr = WavHeader::parse(&raw);
        assert!(hdr.check_compatible().is_err());
    }
}

//! Wire framing: `SOH | header(5) | header_checksum | payload | payload_checksum`.
//!
//! The header is `event_id | ~event_id | event_extra | payload_size:u16`,
//! little-endian, 1-byte aligned. Checksums are the byte sum mod 256. The
//! reader resynchronises by scanning for the next SOH after any rejection.

use crate::error::{FrameFormatKind, Result, VozError};

use super::event::{Event, EventId};

pub const SOH: u8 = 0x01;
pub const MAX_PAYLOAD: usize = 2048;

const HEADER_LEN: usize = 5;
/// SOH + header + header checksum.
const PREFIX_LEN: usize = 1 + HEADER_LEN + 1;
/// Keep at most this much unparsed garbage around.
const READER_CAP: usize = 4 * (PREFIX_LEN + MAX_PAYLOAD + 1);

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Serialise one event into a wire frame.
pub fn encode(event: &Event) -> Vec<u8> {
    let payload = event.payload();
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let size = payload.len() as u16;
    let header = [
        event.id() as u8,
        !(event.id() as u8),
        event.extra(),
        size.to_le_bytes()[0],
        size.to_le_bytes()[1],
    ];
    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len() + 1);
    out.push(SOH);
    out.extend_from_slice(&header);
    out.push(checksum(&header));
    out.extend_from_slice(&payload);
    out.push(checksum(&payload));
    out
}

/// Incremental frame parser over a byte stream.
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > READER_CAP {
            let excess = self.buf.len() - READER_CAP;
            self.buf.drain(..excess);
            log::warn!("frame reader overflow, {} bytes discarded", excess);
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// The stream closed; leftover bytes mean a frame was cut short.
    pub fn at_eof(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            self.buf.clear();
            Err(VozError::FrameFormat(FrameFormatKind::IncompleteEvent))
        }
    }

    /// Try to parse the next frame. `Ok(None)` means more bytes are needed;
    /// an error reports one rejected candidate, after which parsing may be
    /// retried immediately (the reader has already resynchronised).
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] != SOH {
            let skipped = self
                .buf
                .iter()
                .position(|&b| b == SOH)
                .unwrap_or(self.buf.len());
            self.buf.drain(..skipped);
            return Err(VozError::FrameFormat(FrameFormatKind::NoSoh));
        }
        if self.buf.len() < PREFIX_LEN {
            return Ok(None);
        }

        let header: [u8; HEADER_LEN] = [
            self.buf[1], self.buf[2], self.buf[3], self.buf[4], self.buf[5],
        ];
        let event_id = header[0];
        let event_id_comp = header[1];
        if event_id_comp != !event_id || self.buf[6] != checksum(&header) {
            // the header cannot be trusted, rescan from the next byte
            self.buf.drain(..1);
            return Err(VozError::FrameFormat(FrameFormatKind::HeaderIntegrity));
        }
        let payload_size = u16::from_le_bytes([header[3], header[4]]) as usize;
        if payload_size > MAX_PAYLOAD {
            self.buf.drain(..1);
            return Err(VozError::FrameFormat(FrameFormatKind::PayloadTooBig));
        }

        let total = PREFIX_LEN + payload_size + 1;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload_start = PREFIX_LEN;
        let payload_end = payload_start + payload_size;
        if self.buf[payload_end] != checksum(&self.buf[payload_start..payload_end]) {
            // frame boundaries were sound, drop the whole frame
            self.buf.drain(..total);
            return Err(VozError::FrameFormat(FrameFormatKind::PayloadChecksum));
        }

        let id = match EventId::try_from(event_id) {
            Ok(id) => id,
            Err(e) => {
                self.buf.drain(..total);
                return Err(e);
            }
        };
        let event = Event::decode(id, header[2], &self.buf[payload_start..payload_end]);
        self.buf.drain(..total);
        event.map(Some)
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::event::{
        AudioConfPayload, StatusPayload, WwConfPayload, WwMatchPayload, WwStatusPayload,
    };
    use super::*;

    fn roundtrip(ev: Event) {
        let mut reader = FrameReader::new();
        reader.push(&encode(&ev));
        let got = reader.next_event().unwrap().unwrap();
        assert_eq!(got, ev);
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn every_event_round_trips() {
        roundtrip(Event::Nop);
        roundtrip(Event::Status(StatusPayload {
            mode: 1,
            error_kind: 0,
            ready: 1,
            frames_in: 1234,
            frames_dropped: 5,
            ww_mask: 0b11,
        }));
        roundtrip(Event::Mode(2));
        roundtrip(Event::Config(AudioConfPayload {
            preamp: 2.0,
            noiser: 1,
            autogain: 3,
            vad: 1,
        }));
        roundtrip(Event::Audio(vec![0xAA; 320]));
        roundtrip(Event::BAudio(0b1100_0000, vec![0x55; 64]));
        roundtrip(Event::Areset(4));
        roundtrip(Event::Reboot);
        roundtrip(Event::WwList(true));
        roundtrip(Event::WwStatus(WwStatusPayload::with_name(
            "ok_voz",
            WwConfPayload {
                index: 0,
                enabled: 1,
                threshold: 0.5,
                patience: 1,
            },
        )));
        roundtrip(Event::WwConf(WwConfPayload {
            index: 2,
            enabled: 1,
            threshold: 0.75,
            patience: 3,
        }));
        roundtrip(Event::WwMatch(WwMatchPayload {
            index: 1,
            score: 0.92,
            count: 2,
        }));
    }

    #[test]
    fn resyncs_after_leading_garbage() {
        let mut reader = FrameReader::new();
        let mut stream = vec![0x55u8; 32]; // no accidental SOH
        stream.extend_from_slice(&encode(&Event::Status(StatusPayload::default())));
        reader.push(&stream);

        match reader.next_event() {
            Err(VozError::FrameFormat(FrameFormatKind::NoSoh)) => {}
            other => panic!("expected NoSoh, got {:?}", other.map(|_| ())),
        }
        let ev = reader.next_event().unwrap().unwrap();
        assert!(matches!(ev, Event::Status(_)));
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let frame = encode(&Event::Status(StatusPayload {
            mode: 2,
            error_kind: 0,
            ready: 0,
            frames_in: 0x2233_4455,
            frames_dropped: 0x6677_8899,
            ww_mask: 0x0300,
        }));
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupt = frame.clone();
                corrupt[byte] ^= 1 << bit;
                let mut reader = FrameReader::new();
                reader.push(&corrupt);
                match reader.next_event() {
                    Err(VozError::FrameFormat(_)) => {}
                    other => panic!(
                        "byte {} bit {} not rejected: {:?}",
                        byte,
                        bit,
                        other.map(|_| ())
                    ),
                }
            }
        }
    }

    #[test]
    fn oversized_payload_is_rejected() {
        // forge a header that declares a payload beyond the cap
        let size = (MAX_PAYLOAD as u16 + 1).to_le_bytes();
        let header = [EventId::Audio as u8, !(EventId::Audio as u8), 0, size[0], size[1]];
        let mut stream = vec![SOH];
        stream.extend_from_slice(&header);
        stream.push(checksum(&header));
        let mut reader = FrameReader::new();
        reader.push(&stream);
        assert!(matches!(
            reader.next_event(),
            Err(VozError::FrameFormat(FrameFormatKind::PayloadTooBig))
        ));
    }

    #[test]
    fn unknown_event_id_is_rejected() {
        let header = [0x42u8, !0x42u8, 0, 0, 0];
        let mut stream = vec![SOH];
        stream.extend_from_slice(&header);
        stream.push(checksum(&header));
        stream.push(0); // empty payload checksum
        let mut reader = FrameReader::new();
        reader.push(&stream);
        assert!(matches!(
            reader.next_event(),
            Err(VozError::FrameFormat(FrameFormatKind::UnknownEvent))
        ));
        // the bad frame was consumed, the reader is clean again
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn partial_frame_waits_then_completes() {
        let frame = encode(&Event::WwConf(WwConfPayload {
            index: 0,
            enabled: 1,
            threshold: 0.5,
            patience: 1,
        }));
        let mut reader = FrameReader::new();
        reader.push(&frame[..4]);
        assert!(reader.next_event().unwrap().is_none());
        reader.push(&frame[4..]);
        assert!(reader.next_event().unwrap().is_some());
        assert!(reader.at_eof().is_ok());
    }

    #[test]
    fn eof_with_leftover_is_incomplete() {
        let frame = encode(&Event::Reboot);
        let mut reader = FrameReader::new();
        reader.push(&frame[..3]);
        assert!(reader.next_event().unwrap().is_none());
        assert!(matches!(
            reader.at_eof(),
            Err(VozError::FrameFormat(FrameFormatKind::IncompleteEvent))
        ));
    }
}

//! Control-plane events and their fixed-layout payloads.
//!
//! All multi-byte fields are little-endian and packed with 1-byte alignment.
//! Single-byte parameters (mode, clear flag, refractory count, the BAudio
//! VAD bits) ride in the header's `event_extra` byte and leave the payload
//! empty.

use crate::error::{FrameFormatKind, Result, VozError};

pub const STATUS_LEN: usize = 13;
pub const AUDIO_CONF_LEN: usize = 7;
pub const WW_CONF_LEN: usize = 7;
pub const WW_STATUS_LEN: usize = 40;
pub const WW_MATCH_LEN: usize = 6;
pub const WW_NAME_LEN: usize = 33; // 32 bytes of name plus terminator

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventId {
    Nop = 0x00,
    Status = 0x01,
    Mode = 0x10,
    Config = 0x11,
    Audio = 0x12,
    BAudio = 0x13,
    Areset = 0x14,
    Reboot = 0x15,
    WwList = 0x20,
    WwStatus = 0x21,
    WwConf = 0x22,
    WwMatch = 0x23,
}

impl TryFrom<u8> for EventId {
    type Error = VozError;

    fn try_from(v: u8) -> Result<Self> {
        Ok(match v {
            0x00 => EventId::Nop,
            0x01 => EventId::Status,
            0x10 => EventId::Mode,
            0x11 => EventId::Config,
            0x12 => EventId::Audio,
            0x13 => EventId::BAudio,
            0x14 => EventId::Areset,
            0x15 => EventId::Reboot,
            0x20 => EventId::WwList,
            0x21 => EventId::WwStatus,
            0x22 => EventId::WwConf,
            0x23 => EventId::WwMatch,
            _ => return Err(VozError::FrameFormat(FrameFormatKind::UnknownEvent)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusPayload {
    pub mode: u8,
    pub error_kind: u8,
    pub ready: u8,
    pub frames_in: u32,
    pub frames_dropped: u32,
    pub ww_mask: u16,
}

impl StatusPayload {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATUS_LEN);
        out.push(self.mode);
        out.push(self.error_kind);
        out.push(self.ready);
        out.extend_from_slice(&self.frames_in.to_le_bytes());
        out.extend_from_slice(&self.frames_dropped.to_le_bytes());
        out.extend_from_slice(&self.ww_mask.to_le_bytes());
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self> {
        if raw.len() != STATUS_LEN {
            return Err(VozError::FrameFormat(FrameFormatKind::InvalidPayloadLen));
        }
        Ok(Self {
            mode: raw[0],
            error_kind: raw[1],
            ready: raw[2],
            frames_in: u32::from_le_bytes([raw[3], raw[4], raw[5], raw[6]]),
            frames_dropped: u32::from_le_bytes([raw[7], raw[8], raw[9], raw[10]]),
            ww_mask: u16::from_le_bytes([raw[11], raw[12]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioConfPayload {
    pub preamp: f32,
    pub noiser: u8,
    pub autogain: u8,
    pub vad: u8,
}

impl AudioConfPayload {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AUDIO_CONF_LEN);
        out.extend_from_slice(&self.preamp.to_le_bytes());
        out.push(self.noiser);
        out.push(self.autogain);
        out.push(self.vad);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self> {
        if raw.len() != AUDIO_CONF_LEN {
            return Err(VozError::FrameFormat(FrameFormatKind::InvalidPayloadLen));
        }
        Ok(Self {
            preamp: f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            noiser: raw[4],
            autogain: raw[5],
            vad: raw[6],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WwConfPayload {
    pub index: u8,
    pub enabled: u8,
    pub threshold: f32,
    pub patience: u8,
}

impl WwConfPayload {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WW_CONF_LEN);
        out.push(self.index);
        out.push(self.enabled);
        out.extend_from_slice(&self.threshold.to_le_bytes());
        out.push(self.patience);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self> {
        if raw.len() != WW_CONF_LEN {
            return Err(VozError::FrameFormat(FrameFormatKind::InvalidPayloadLen));
        }
        Ok(Self {
            index: raw[0],
            enabled: raw[1],
            threshold: f32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]),
            patience: raw[6],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WwStatusPayload {
    pub name: [u8; WW_NAME_LEN],
    pub conf: WwConfPayload,
}

impl WwStatusPayload {
    pub fn with_name(name: &str, conf: WwConfPayload) -> Self {
        let mut raw = [0u8; WW_NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(WW_NAME_LEN - 1);
        raw[..n].copy_from_slice(&bytes[..n]);
        Self { name: raw, conf }
    }

    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(WW_NAME_LEN - 1);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WW_STATUS_LEN);
        out.extend_from_slice(&self.name);
        out.extend_from_slice(&self.conf.pack());
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self> {
        if raw.len() != WW_STATUS_LEN {
            return Err(VozError::FrameFormat(FrameFormatKind::InvalidPayloadLen));
        }
        let mut name = [0u8; WW_NAME_LEN];
        name.copy_from_slice(&raw[..WW_NAME_LEN]);
        Ok(Self {
            name,
            conf: WwConfPayload::unpack(&raw[WW_NAME_LEN..])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WwMatchPayload {
    pub index: u8,
    pub score: f32,
    pub count: u8,
}

impl WwMatchPayload {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WW_MATCH_LEN);
        out.push(self.index);
        out.extend_from_slice(&self.score.to_le_bytes());
        out.push(self.count);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self> {
        if raw.len() != WW_MATCH_LEN {
            return Err(VozError::FrameFormat(FrameFormatKind::InvalidPayloadLen));
        }
        Ok(Self {
            index: raw[0],
            score: f32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]),
            count: raw[5],
        })
    }
}

/// A decoded control-plane event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Nop,
    Status(StatusPayload),
    /// Requested mode in `event_extra`.
    Mode(u8),
    Config(AudioConfPayload),
    Audio(Vec<u8>),
    /// VAD bits in `event_extra`, cleaned PCM in the payload.
    BAudio(u8, Vec<u8>),
    /// Refractory frame count in `event_extra`.
    Areset(u8),
    Reboot,
    /// Clear-enables flag in `event_extra`.
    WwList(bool),
    WwStatus(WwStatusPayload),
    WwConf(WwConfPayload),
    WwMatch(WwMatchPayload),
}

impl Event {
    pub fn id(&self) -> EventId {
        match self {
            Event::Nop => EventId::Nop,
            Event::Status(_) => EventId::Status,
            Event::Mode(_) => EventId::Mode,
            Event::Config(_) => EventId::Config,
            Event::Audio(_) => EventId::Audio,
            Event::BAudio(..) => EventId::BAudio,
            Event::Areset(_) => EventId::Areset,
            Event::Reboot => EventId::Reboot,
            Event::WwList(_) => EventId::WwList,
            Event::WwStatus(_) => EventId::WwStatus,
            Event::WwConf(_) => EventId::WwConf,
            Event::WwMatch(_) => EventId::WwMatch,
        }
    }

    pub fn extra(&self) -> u8 {
        match self {
            Event::Mode(m) => *m,
            Event::BAudio(vad, _) => *vad,
            Event::Areset(refrac) => *refrac,
            Event::WwList(clear) => *clear as u8,
            _ => 0,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            Event::Nop | Event::Mode(_) | Event::Areset(_) | Event::Reboot | Event::WwList(_) => {
                Vec::new()
            }
            Event::Status(p) => p.pack(),
            Event::Config(p) => p.pack(),
            Event::Audio(p) => p.clone(),
            Event::BAudio(_, p) => p.clone(),
            Event::WwStatus(p) => p.pack(),
            Event::WwConf(p) => p.pack(),
            Event::WwMatch(p) => p.pack(),
        }
    }

    /// Rebuild an event from validated frame pieces.
    pub fn decode(id: EventId, extra: u8, payload: &[u8]) -> Result<Self> {
        let expect_empty = |ev: Event| {
            if payload.is_empty() {
                Ok(ev)
            } else {
                Err(VozError::FrameFormat(FrameFormatKind::InvalidPayloadLen))
            }
        };
        match id {
            EventId::Nop => expect_empty(Event::Nop),
            EventId::Status => Ok(Event::Status(StatusPayload::unpack(payload)?)),
            EventId::Mode => expect_empty(Event::Mode(extra)),
            EventId::Config => Ok(Event::Config(AudioConfPayload::unpack(payload)?)),
            EventId::Audio => Ok(Event::Audio(payload.to_vec())),
            EventId::BAudio => Ok(Event::BAudio(extra, payload.to_vec())),
            EventId::Areset => expect_empty(Event::Areset(extra)),
            EventId::Reboot => expect_empty(Event::Reboot),
            EventId::WwList => expect_empty(Event::WwList(extra != 0)),
            EventId::WwStatus => Ok(Event::WwStatus(WwStatusPayload::unpack(payload)?)),
            EventId::WwConf => Ok(Event::WwConf(WwConfPayload::unpack(payload)?)),
            EventId::WwMatch => Ok(Event::WwMatch(WwMatchPayload::unpack(payload)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_sizes_are_fixed() {
        assert_eq!(StatusPayload::default().pack().len(), STATUS_LEN);
        assert_eq!(
            AudioConfPayload {
                preamp: 1.5,
                noiser: 2,
                autogain: 3,
                vad: 1
            }
            .pack()
            .len(),
            AUDIO_CONF_LEN
        );
        assert_eq!(
            WwConfPayload {
                index: 0,
                enabled: 1,
                threshold: 0.5,
                patience: 1
            }
            .pack()
            .len(),
            WW_CONF_LEN
        );
        let conf = WwConfPayload {
            index: 1,
            enabled: 0,
            threshold: 0.4,
            patience: 2,
        };
        assert_eq!(
            WwStatusPayload::with_name("hey", conf).pack().len(),
            WW_STATUS_LEN
        );
        assert_eq!(
            WwMatchPayload {
                index: 0,
                score: 0.9,
                count: 1
            }
            .pack()
            .len(),
            WW_MATCH_LEN
        );
    }

    #[test]
    fn status_packs_little_endian() {
        let p = StatusPayload {
            mode: 1,
            error_kind: 0,
            ready: 1,
            frames_in: 0x0403_0201,
            frames_dropped: 0,
            ww_mask: 0x0201,
        };
        let raw = p.pack();
        assert_eq!(&raw[3..7], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&raw[11..13], &[0x01, 0x02]);
        assert_eq!(StatusPayload::unpack(&raw).unwrap(), p);
    }

    #[test]
    fn ww_status_name_truncates_to_32_bytes() {
        let long = "x".repeat(80);
        let conf = WwConfPayload {
            index: 3,
            enabled: 1,
            threshold: 0.6,
            patience: 2,
        };
        let p = WwStatusPayload::with_name(&long, conf);
        assert_eq!(p.name_str().len(), 32);
        let back = WwStatusPayload::unpack(&p.pack()).unwrap();
        assert_eq!(back.name_str(), p.name_str());
        assert_eq!(back.conf, conf);
    }

    #[test]
    fn decode_rejects_wrong_payload_sizes() {
        assert!(Event::decode(EventId::Status, 0, &[0u8; 12]).is_err());
        assert!(Event::decode(EventId::Mode, 1, &[0u8; 1]).is_err());
        assert!(Event::decode(EventId::WwConf, 0, &[0u8; 8]).is_err());
        assert!(Event::decode(EventId::Reboot, 0, &[]).is_ok());
    }

    #[test]
    fn extra_carries_scalar_parameters() {
        assert_eq!(Event::Mode(2).extra(), 2);
        assert_eq!(Event::Areset(5).extra(), 5);
        assert_eq!(Event::WwList(true).extra(), 1);
        assert_eq!(Event::BAudio(0b1010, vec![1, 2]).extra(), 0b1010);
        assert_eq!(Event::Nop.extra(), 0);
    }
}

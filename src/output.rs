//! Textual renderings of detector events.
//!
//! The machine format is what the serial bridge parses from a child
//! detector; json is the default for interactive use.

use crate::detector::WakeWordPrediction;
use crate::error::VozError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Machine,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = VozError;

    fn from_str(s: &str) -> Result<Self, VozError> {
        match s {
            "human" => Ok(OutputFormat::Human),
            "machine" => Ok(OutputFormat::Machine),
            "json" => Ok(OutputFormat::Json),
            other => Err(VozError::Config(format!("unknown output format '{other}'"))),
        }
    }
}

fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

pub fn prediction_line(fmt: OutputFormat, p: &WakeWordPrediction) -> String {
    match fmt {
        OutputFormat::Json => format!(
            "{{\"event\":\"prediction\",\"wakeword\":\"{}\",\"prob\":{:.6},\"cnt\":{}}}",
            json_escape(&p.name),
            p.score,
            p.count
        ),
        OutputFormat::Machine => format!("P:{}:{:.6}:{}", p.name, p.score, p.count),
        OutputFormat::Human => format!(
            "wake-word '{}' detected (score {:.3}, {} consecutive)",
            p.name, p.score, p.count
        ),
    }
}

pub fn ready_line(fmt: OutputFormat, ready: bool) -> String {
    match fmt {
        OutputFormat::Json => format!("{{\"event\":\"status\",\"ready\":{}}}", ready),
        OutputFormat::Machine => format!("R:{}", ready as u8),
        OutputFormat::Human => {
            if ready {
                "pipeline ready".to_string()
            } else {
                "pipeline stopped".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pred() -> WakeWordPrediction {
        WakeWordPrediction {
            name: "ok_voz".into(),
            score: 0.8125,
            count: 2,
        }
    }

    #[test]
    fn json_lines() {
        assert_eq!(
            prediction_line(OutputFormat::Json, &pred()),
            "{\"event\":\"prediction\",\"wakeword\":\"ok_voz\",\"prob\":0.812500,\"cnt\":2}"
        );
        assert_eq!(
            ready_line(OutputFormat::Json, true),
            "{\"event\":\"status\",\"ready\":true}"
        );
    }

    #[test]
    fn machine_lines() {
        assert_eq!(
            prediction_line(OutputFormat::Machine, &pred()),
            "P:ok_voz:0.812500:2"
        );
        assert_eq!(ready_line(OutputFormat::Machine, false), "R:0");
        assert_eq!(ready_line(OutputFormat::Machine, true), "R:1");
    }

    #[test]
    fn json_escapes_awkward_names() {
        let p = WakeWordPrediction {
            name: "he\"y".into(),
            score: 0.6,
            count: 1,
        };
        let line = prediction_line(OutputFormat::Json, &p);
        assert!(line.contains("he\\\"y"));
    }
}

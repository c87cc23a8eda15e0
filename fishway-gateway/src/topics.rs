//! Topic classification.
//!
//! Device topics look like `<deviceId>/device/<kind>[/...]` with `kind` one of
//! `telemetry`, `reply` or `log`. Log topics carry the stream name right after
//! the `log` segment (`fish1/device/log/error`).

/// Stream used when a log topic carries no name.
pub const DEFAULT_LOG_STREAM: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageClass {
    Telemetry,
    Reply,
    /// Plain-text log line; `stream` is already case-folded.
    Log { stream: String },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub device_id: String,
    pub class: MessageClass,
}

/// Maps a topic to `(device id, class)`. Never fails: anything that does not
/// follow the device pattern is `Unknown`, keyed on its first segment.
pub fn classify(topic: &str) -> Classified {
    let segments: Vec<&str> = topic.split('/').collect();

    if segments.len() >= 3 && !segments[0].is_empty() && segments[1] == "device" {
        let class = match segments[2] {
            "telemetry" => Some(MessageClass::Telemetry),
            "reply" => Some(MessageClass::Reply),
            "log" => Some(MessageClass::Log { stream: log_stream_name(segments.get(3).copied()) }),
            _ => None,
        };
        if let Some(class) = class {
            return Classified { device_id: segments[0].to_string(), class };
        }
    }

    let device_id = segments
        .iter()
        .find(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_default();
    Classified { device_id, class: MessageClass::Unknown }
}

fn log_stream_name(segment: Option<&str>) -> String {
    match segment.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_lowercase(),
        _ => DEFAULT_LOG_STREAM.to_string(),
    }
}

/// Topic the gateway publishes commands on for a device.
pub fn command_topic(device_id: &str) -> String {
    format!("{device_id}/device/command")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_telemetry_and_reply() {
        assert_eq!(
            classify("fish1/device/telemetry"),
            Classified { device_id: "fish1".into(), class: MessageClass::Telemetry }
        );
        assert_eq!(classify("fish1/device/telemetry/extra/parts").class, MessageClass::Telemetry);
        assert_eq!(
            classify("gate-7/device/reply"),
            Classified { device_id: "gate-7".into(), class: MessageClass::Reply }
        );
        assert_eq!(classify("gate-7/device/reply/v2").device_id, "gate-7");
    }

    #[test]
    fn log_stream_is_case_folded() {
        let c = classify("fish1/device/log/BOOT");
        assert_eq!(c.device_id, "fish1");
        assert_eq!(c.class, MessageClass::Log { stream: "boot".into() });
    }

    #[test]
    fn log_without_name_defaults_to_error() {
        let default_stream = MessageClass::Log { stream: "error".into() };
        assert_eq!(classify("fish1/device/log").class, default_stream);
        assert_eq!(classify("fish1/device/log/").class, default_stream);
    }

    #[test]
    fn unknown_topics_keep_first_segment() {
        assert_eq!(
            classify("fish1/status"),
            Classified { device_id: "fish1".into(), class: MessageClass::Unknown }
        );
        assert_eq!(classify("fish1/device/command").class, MessageClass::Unknown);
        assert_eq!(classify("/lead/slash").device_id, "lead");
        assert_eq!(classify("site/fish1/device/telemetry").class, MessageClass::Unknown);
    }

    #[test]
    fn empty_topic_is_unknown_without_device() {
        let unknown = Classified { device_id: String::new(), class: MessageClass::Unknown };
        assert_eq!(classify(""), unknown);
        assert_eq!(classify("///").device_id, "");
    }

    #[test]
    fn command_topic_format() {
        assert_eq!(command_topic("fish1"), "fish1/device/command");
    }
}

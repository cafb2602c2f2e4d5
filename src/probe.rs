//! Media metadata extraction from `ffprobe` output.

use serde::Deserialize;

use crate::error::ProbeError;

/// The metadata needed to decide whether a source has to be compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaInfo {
    pub duration_secs: Option<u64>,
    pub width: i64,
    pub height: i64,
    pub codec: String,
}

#[derive(Deserialize, Debug)]
struct ProbeOutput {
    streams: Vec<StreamInfo>,
}

#[derive(Deserialize, Debug)]
struct StreamInfo {
    codec_name: Option<String>,
    width: Option<i64>,
    height: Option<i64>,
    duration: Option<String>,
}

const STREAMS_MARKER: &str = r#""streams": ["#;

/// Cut the JSON document out of raw probe output.
///
/// Some hosts print banner text before the document, and a few print it
/// *inside* the outer object. Everything outside the first `{` line and the
/// last `}` line is dropped, as is everything between the opening brace and
/// the `"streams"` key.
pub fn extract_payload(output: &str) -> Option<String> {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.iter().position(|l| l.trim_end() == "{")?;
    let end = lines.iter().rposition(|l| l.trim_end() == "}")?;
    if end <= start {
        return None;
    }
    let body = &lines[start + 1..end];
    let body = match body.iter().position(|l| l.trim() == STREAMS_MARKER) {
        Some(streams) => &body[streams..],
        None => body,
    };

    let mut payload = String::from("{\n");
    for line in body {
        payload.push_str(line);
        payload.push('\n');
    }
    payload.push('}');
    Some(payload)
}

/// Parse `ffprobe -show_streams -select_streams v -print_format json` output.
pub fn parse_probe_output(output: &str) -> Result<MediaInfo, ProbeError> {
    let payload = extract_payload(output).ok_or(ProbeError::NoPayload)?;
    let parsed: ProbeOutput = serde_json::from_str(&payload)?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or(ProbeError::NoVideoStream)?;

    Ok(MediaInfo {
        duration_secs: stream.duration.as_deref().and_then(parse_duration),
        width: stream.width.unwrap_or(-1),
        height: stream.height.unwrap_or(-1),
        codec: stream.codec_name.unwrap_or_default(),
    })
}

/// Parse the container duration query, which prints the value on its last line.
pub fn parse_format_duration(output: &str) -> Option<u64> {
    output.lines().last().and_then(parse_duration)
}

fn parse_duration(raw: &str) -> Option<u64> {
    let secs: f64 = raw.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then_some(secs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN: &str = r#"{
    "streams": [
        {
            "index": 0,
            "codec_name": "h264",
            "width": 1920,
            "height": 1080,
            "duration": "125.458333"
        }
    ]
}"#;

    #[test]
    fn parses_clean_output() {
        let info = parse_probe_output(CLEAN).unwrap();
        assert_eq!(
            info,
            MediaInfo {
                duration_secs: Some(125),
                width: 1920,
                height: 1080,
                codec: "h264".to_string(),
            }
        );
    }

    #[test]
    fn skips_banner_and_noise_inside_the_object() {
        let noisy = format!(
            "ffprobe version 4.4 Copyright (c) 2007-2021\n  built with gcc\n{{\n\
             WARNING: licence server unreachable\nsome: [garbage\n{}",
            CLEAN.trim_start_matches("{\n")
        );
        let info = parse_probe_output(&noisy).unwrap();
        assert_eq!(info.codec, "h264");
        assert_eq!(info.width, 1920);
    }

    #[test]
    fn missing_duration_is_left_for_fallback() {
        let out = r#"{
    "streams": [
        { "codec_name": "hevc", "width": 3840, "height": 2160 }
    ]
}"#;
        let info = parse_probe_output(out).unwrap();
        assert_eq!(info.duration_secs, None);
        assert_eq!(info.codec, "hevc");
    }

    #[test]
    fn rejects_output_without_payload() {
        assert!(matches!(
            parse_probe_output("No such file or directory"),
            Err(ProbeError::NoPayload)
        ));
    }

    #[test]
    fn rejects_empty_stream_list() {
        let out = "{\n    \"streams\": [\n    ]\n}";
        assert!(matches!(
            parse_probe_output(out),
            Err(ProbeError::NoVideoStream)
        ));
    }

    #[test]
    fn format_duration_reads_last_line() {
        assert_eq!(parse_format_duration("noise\n42.9\n"), Some(42));
        assert_eq!(parse_format_duration("N/A"), None);
    }
}

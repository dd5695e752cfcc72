//! SDP post-processing

use std::collections::HashMap;

/// Move the payload type of `codec` to the front of every `m=video` line
///
/// `codec` is matched case-insensitively against the encoding names of the
/// `a=rtpmap` lines; when several payload types map to it, the first one
/// listed wins. Lines are split on CRLF and every other line is passed
/// through unchanged, as is the relative order of the remaining payload
/// types. Returns the input unchanged when the codec is not present.
pub fn prefer_codec(sdp: &str, codec: &str) -> String {
    let codec = codec.to_lowercase();
    let lines: Vec<&str> = sdp.split("\r\n").collect();

    let mut payload_to_codec: HashMap<&str, String> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for line in &lines {
        let Some(rest) = line.strip_prefix("a=rtpmap:") else {
            continue;
        };
        let mut parts = rest.split(' ');
        let (Some(pt), Some(encoding)) = (parts.next(), parts.next()) else {
            continue;
        };
        let name = encoding.split('/').next().unwrap_or_default().to_lowercase();
        if payload_to_codec.insert(pt, name).is_none() {
            order.push(pt);
        }
    }

    let chosen = order
        .into_iter()
        .find(|pt| payload_to_codec.get(pt).is_some_and(|name| *name == codec));
    let Some(chosen) = chosen else {
        return sdp.to_string();
    };

    lines
        .iter()
        .map(|line| {
            if !line.starts_with("m=video") {
                return line.to_string();
            }
            let parts: Vec<&str> = line.split(' ').collect();
            if parts.len() <= 3 || !parts[3..].contains(&chosen) {
                return line.to_string();
            }
            let mut reordered: Vec<&str> = parts[..3].to_vec();
            reordered.push(chosen);
            reordered.extend(parts[3..].iter().copied().filter(|pt| *pt != chosen));
            reordered.join(" ")
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

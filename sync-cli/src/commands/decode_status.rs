//! Decode a captured GFDI frame.

use anyhow::{Context, Result};
use sync_types::{Frame, MessageType, StatusMessage};

/// Parse hex, ignoring whitespace, `:` separators and a leading `0x`.
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let cleaned: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).context("Invalid hex")
}

/// Describe a raw GFDI frame, line by line.
pub fn describe(raw: &[u8]) -> Result<Vec<String>> {
    let frame = Frame::decode(raw).context("Invalid GFDI frame")?;
    let mut lines = vec![format!("Type:     {}", frame.message_type)];
    if let Some(sequence) = frame.sequence {
        lines.push(format!("Sequence: {sequence}"));
    }
    lines.push(format!("Payload:  {} bytes", frame.payload.len()));

    if frame.message_type == MessageType::Response {
        let status = StatusMessage::from_frame(&frame).context("Invalid status payload")?;
        lines.push(format!("Answers:  {}", status.original_type));
        lines.push(format!("Status:   {}", status.status.name()));
        lines.push(format!("Detail:   {:?}", status.detail));
        lines.push(format!(
            "Proceed:  {}",
            if status.can_proceed() { "yes" } else { "no" }
        ));
    } else if !frame.payload.is_empty() {
        lines.push(format!("Data:     {}", hex::encode(&frame.payload)));
    }
    Ok(lines)
}

/// Run the decode-status command.
pub fn run(input: &str) -> Result<()> {
    let raw = parse_hex(input)?;
    for line in describe(&raw)? {
        println!("{line}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{DownloadStatus, Status, StatusDetail};

    #[test]
    fn parses_loose_hex() {
        assert_eq!(parse_hex("0x0a:0B 0c").unwrap(), vec![0x0a, 0x0b, 0x0c]);
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn describes_download_status() {
        let raw = StatusMessage {
            original_type: MessageType::DownloadRequest,
            status: Status::Ack,
            detail: StatusDetail::Download {
                status: DownloadStatus::NoSpaceLeft,
                max_file_size: 0,
            },
        }
        .to_frame()
        .encode();

        let lines = describe(&raw).unwrap();
        assert_eq!(lines[0], "Type:     Response(5000)");
        assert!(lines.contains(&"Answers:  DownloadRequest(5002)".to_string()));
        assert!(lines.contains(&"Status:   ACK".to_string()));
        assert_eq!(lines.last().unwrap(), "Proceed:  no");
    }

    #[test]
    fn describes_plain_message() {
        let raw = Frame::new(MessageType::Synchronization, vec![0x01, 0x02]).encode();
        let lines = describe(&raw).unwrap();
        assert_eq!(lines[0], "Type:     Synchronization(5037)");
        assert_eq!(lines.last().unwrap(), "Data:     0102");
    }

    #[test]
    fn rejects_bad_crc() {
        let mut raw = Frame::new(MessageType::Synchronization, vec![]).encode();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert!(describe(&raw).is_err());
    }
}

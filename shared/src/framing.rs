//! Brace-depth framing for a stream of concatenated JSON objects
//!
//! Neither channel carries a length prefix. A frame starts at a `{` and ends
//! at the `}` that brings the nesting depth back to zero, so nested payloads
//! (roster lists, tallies) are never cut short. Braces inside string literals
//! do not count, which keeps usernames like `"}{"` from desynchronising the
//! stream.
//!
//! The decoder works on raw bytes: a chunk boundary may fall in the middle of
//! a multi-byte UTF-8 sequence and the frame is only decoded once complete.

use log::debug;

use crate::error::ProtocolError;
use crate::message::Message;

pub const FRAME_START: u8 = b'{';
pub const FRAME_END: u8 = b'}';

/// Largest incomplete frame held before the buffer is discarded
pub const DEFAULT_MAX_BUFFER: usize = 64 * 1024;

/// Incremental frame extractor for one byte stream (or one datagram source)
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_buffer: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer,
        }
    }

    /// Appends a newly received chunk
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Extracts the next complete frame, if any.
    ///
    /// A frame that fails to decode is consumed and reported as an error so
    /// the caller can log it; extraction continues after it on the next call.
    pub fn next_frame(&mut self) -> Option<Result<Message, ProtocolError>> {
        // Anything before the first start marker can never become a frame
        match self.buffer.iter().position(|&b| b == FRAME_START) {
            Some(0) => {}
            Some(start) => {
                debug!("Skipping {} bytes of inter-frame noise", start);
                self.buffer.drain(..start);
            }
            None => {
                self.buffer.clear();
                return None;
            }
        }

        match find_frame_end(&self.buffer) {
            Some(end) => {
                let frame: Vec<u8> = self.buffer.drain(..=end).collect();
                Some(Message::decode(&frame))
            }
            None if self.buffer.len() > self.max_buffer => {
                self.buffer.clear();
                Some(Err(ProtocolError::FrameTooLarge {
                    limit: self.max_buffer,
                }))
            }
            None => None,
        }
    }

    /// Iterates over every complete frame currently buffered
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { decoder: self }
    }
}

/// Draining iterator returned by [`FrameDecoder::frames`]
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<Message, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_frame()
    }
}

/// Index of the end marker closing the frame that starts at `buf[0]`
fn find_frame_end(buf: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &byte) in buf.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            FRAME_START => depth += 1,
            FRAME_END => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientInfo, Method, Response};
    use crate::{ProposalId, Role, Time};

    fn sample_stream() -> (Vec<Message>, Vec<u8>) {
        let messages: Vec<Message> = vec![
            Method::Join {
                username: Some("we{ird}\"name".into()),
                udp_address: Some("127.0.0.1".into()),
                udp_port: Some(5000),
            }
            .into(),
            Method::Roster {
                clients: vec![ClientInfo {
                    player_id: 1,
                    is_alive: false,
                    address: "127.0.0.1".into(),
                    port: 5001,
                    username: "bjørn".into(),
                    role: Some(Role::Civilian),
                }],
            }
            .into(),
            Response::ok()
                .with_proposal(ProposalId::new(2, 7))
                .with_previous_accepted(Some((ProposalId::new(1, 6), 6)))
                .into(),
            Method::VoteNow {
                phase: Time::Night,
                quorum: Some(2),
            }
            .into(),
        ];

        let mut bytes = Vec::new();
        for message in &messages {
            bytes.extend(message.encode().unwrap());
        }
        (messages, bytes)
    }

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Message> {
        decoder.frames().map(|frame| frame.unwrap()).collect()
    }

    #[test]
    fn test_whole_stream_in_one_chunk() {
        let (expected, bytes) = sample_stream();
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);

        assert_eq!(decode_all(&mut decoder), expected);
        assert!(decoder.buffered().is_empty());
    }

    #[test]
    fn test_every_single_split_point() {
        let (expected, bytes) = sample_stream();

        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();

            decoder.push(&bytes[..split]);
            decoded.extend(decode_all(&mut decoder));
            decoder.push(&bytes[split..]);
            decoded.extend(decode_all(&mut decoder));

            assert_eq!(decoded, expected, "split at byte {}", split);
        }
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let (expected, bytes) = sample_stream();
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();

        for byte in &bytes {
            decoder.push(std::slice::from_ref(byte));
            decoded.extend(decode_all(&mut decoder));
        }

        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut decoder = FrameDecoder::new();
        decoder.push(br#"{"method":"vote_now","#);
        assert!(decoder.next_frame().is_none());
        assert!(!decoder.buffered().is_empty());

        decoder.push(br#""phase":"day"}"#);
        let message = decoder.next_frame().unwrap().unwrap();
        assert_eq!(
            message,
            Method::VoteNow {
                phase: Time::Day,
                quorum: None
            }
            .into()
        );
    }

    #[test]
    fn test_noise_between_frames_is_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"\n}garbage{\"method\":\"ready\"}\n\n{\"method\":\"leave\"}");
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Method::Ready.into());
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Method::Leave.into());

        // Noise without any start marker is dropped on the next poll
        decoder.push(b"trailing");
        assert_eq!(decoder.buffered(), b"trailing");
        assert!(decoder.next_frame().is_none());
        assert!(decoder.buffered().is_empty());
    }

    #[test]
    fn test_bad_frame_is_reported_then_skipped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(br#"{"method":"dance"}{"no_discriminator":1}{"method":"ready"}"#);

        assert!(matches!(
            decoder.next_frame(),
            Some(Err(ProtocolError::UnknownMethod(_)))
        ));
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(ProtocolError::MissingDiscriminator))
        ));
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Method::Ready.into());
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_oversized_partial_frame_is_dropped() {
        let mut decoder = FrameDecoder::with_max_buffer(16);
        decoder.push(br#"{"method":"join","username":"#);

        assert!(matches!(
            decoder.next_frame(),
            Some(Err(ProtocolError::FrameTooLarge { limit: 16 }))
        ));
        assert!(decoder.buffered().is_empty());

        decoder.push(br#"{"method":"leave"}"#);
        assert_eq!(decoder.next_frame().unwrap().unwrap(), Method::Leave.into());
    }

    #[test]
    fn test_frame_end_respects_strings_and_nesting() {
        assert_eq!(find_frame_end(b"{}"), Some(1));
        assert_eq!(find_frame_end(br#"{"a":{"b":{}}}"#), Some(13));
        assert_eq!(find_frame_end(br#"{"a":"}"}"#), Some(8));
        assert_eq!(find_frame_end(br#"{"a":"\"}"}"#), Some(10));
        assert_eq!(find_frame_end(br#"{"a":{"#), None);
    }
}

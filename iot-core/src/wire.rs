//! Message codec and framing: tokens joined by `SEPARATOR`, sent as a 2-byte
//! big-endian length followed by the UTF-8 payload.

/// Delimits tokens inside one message. Tokens must not contain it; callers are responsible.
pub const SEPARATOR: &str = "::_::";

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 2;
const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Join tokens with the separator. A token that already contains the separator
/// will come back split on decode.
pub fn encode<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.push_str(SEPARATOR);
        }
        out.push_str(token.as_ref());
    }
    out
}

/// Split a message on the separator. Always yields at least one token; `""` gives `[""]`.
pub fn decode(wire: &str) -> Vec<String> {
    wire.split(SEPARATOR).map(str::to_owned).collect()
}

/// Encode tokens into a single frame: 2 bytes BE length + UTF-8 payload.
pub fn encode_frame<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode(tokens);
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload.as_bytes());
    Ok(out)
}

/// Error encoding tokens into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame payload of {0} bytes exceeds the 65535 byte limit")]
    TooLarge(usize),
}

/// Read the payload length from a frame header.
pub fn frame_len(header: [u8; HEADER_LEN]) -> usize {
    u16::from_be_bytes(header) as usize
}

/// Decode a frame payload (header already stripped) into tokens.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<String>, FrameDecodeError> {
    let text = std::str::from_utf8(payload)?;
    Ok(decode(text))
}

/// Decode one frame from the front of `bytes`. Returns the tokens and the number of bytes consumed.
/// A short buffer gives `NeedMore`; call again once more data has arrived.
pub fn decode_frame(bytes: &[u8]) -> Result<(Vec<String>, usize), FrameDecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1]]);
    if bytes.len() < HEADER_LEN + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let tokens = decode_payload(&bytes[HEADER_LEN..HEADER_LEN + len])?;
    Ok((tokens, HEADER_LEN + len))
}

/// Error decoding a frame (need more bytes, or payload is not UTF-8).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn report_layout() {
        let wire = encode(&["A1", "report", "w:3", "e:7"]);
        assert_eq!(wire, "A1::_::report::_::w:3::_::e:7");
        assert_eq!(decode(&wire), vec!["A1", "report", "w:3", "e:7"]);
    }

    #[test]
    fn empty_input_is_one_empty_token() {
        assert_eq!(decode(""), vec![String::new()]);
        let none: [&str; 0] = [];
        assert_eq!(encode(&none), "");
    }

    #[test]
    fn single_token_has_no_separator() {
        assert_eq!(encode(&["addmeter"]), "addmeter");
        assert_eq!(decode("addmeter"), vec!["addmeter"]);
    }

    #[test]
    fn frame_header_is_big_endian_length() {
        let frame = encode_frame(&["ping"]).unwrap();
        assert_eq!(&frame[..2], &[0, 4]);
        assert_eq!(&frame[2..], b"ping");
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&["M1", "ping"]).unwrap();
        assert!(matches!(
            decode_frame(&frame[..1]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let fa = encode_frame(&["addmeter"]).unwrap();
        let fb = encode_frame(&["A1", "OK"]).unwrap();
        let mut buf = fa.clone();
        buf.extend_from_slice(&fb);
        let (first, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        assert_eq!(first, vec!["addmeter"]);
        let (second, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(second, vec!["A1", "OK"]);
    }

    #[test]
    fn oversized_payload_rejected() {
        let big = "x".repeat(MAX_FRAME_LEN + 1);
        assert!(matches!(
            encode_frame(&[big]),
            Err(FrameEncodeError::TooLarge(n)) if n == MAX_FRAME_LEN + 1
        ));
    }

    #[test]
    fn invalid_utf8_payload() {
        let frame = [0u8, 2, 0xff, 0xfe];
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameDecodeError::InvalidUtf8(_))
        ));
    }

    proptest! {
        // No '_' in the alphabet, so neighbouring tokens can never fake a separator.
        #[test]
        fn decode_inverts_encode(tokens in prop::collection::vec("[a-zA-Z0-9:. -]{0,12}", 1..8)) {
            let wire = encode(&tokens);
            prop_assert_eq!(decode(&wire), tokens);
        }

        #[test]
        fn frame_roundtrip(tokens in prop::collection::vec("[a-z0-9:]{0,8}", 1..6)) {
            let frame = encode_frame(&tokens).unwrap();
            let (decoded, used) = decode_frame(&frame).unwrap();
            prop_assert_eq!(used, frame.len());
            prop_assert_eq!(decoded, tokens);
        }
    }
}

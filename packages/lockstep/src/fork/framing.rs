//! Length-prefixed JSON frames over a byte stream.
//!
//! ```text
//! +----------------+------------------+
//! | length (4 LE)  | JSON payload     |
//! +----------------+------------------+
//! ```

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Largest frame either side accepts.
pub(crate) const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub(crate) enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for a frame")]
    TimedOut,

    #[error("the other side closed the channel")]
    EndOfStream,

    #[error("frame of {size} bytes exceeds the maximum of {MAX_FRAME_SIZE} bytes")]
    TooLarge { size: usize },

    #[error("zero-length frame")]
    Empty,

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Writes one message and flushes the writer.
pub(crate) fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize,
{
    let bytes = serde_json::to_vec(message).map_err(FrameError::Encode)?;

    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|_| bytes.len() <= MAX_FRAME_SIZE)
        .ok_or(FrameError::TooLarge { size: bytes.len() })?;

    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()?;

    Ok(())
}

/// Reads one message. A read timeout configured on the underlying stream surfaces as
/// [`FrameError::TimedOut`].
pub(crate) fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf).map_err(classify)?;

    let len = usize::try_from(u32::from_le_bytes(len_buf))
        .expect("u32 always fits in usize on supported targets");

    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge { size: len });
    }

    if len == 0 {
        return Err(FrameError::Empty);
    }

    let mut buf = vec![0_u8; len];
    reader.read_exact(&mut buf).map_err(classify)?;

    serde_json::from_slice(&buf).map_err(FrameError::Decode)
}

fn classify(error: io::Error) -> FrameError {
    match error.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::EndOfStream,
        // Platforms disagree on which kind a socket read timeout produces.
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => FrameError::TimedOut,
        _ => FrameError::Io(error),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frames_are_read_back_in_order() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &"first").unwrap();
        write_frame(&mut buffer, &vec![1_u32, 2, 3]).unwrap();

        let mut reader = Cursor::new(buffer);
        let first: String = read_frame(&mut reader).unwrap();
        let second: Vec<u32> = read_frame(&mut reader).unwrap();

        assert_eq!(first, "first");
        assert_eq!(second, [1, 2, 3]);
        assert!(matches!(
            read_frame::<_, String>(&mut reader),
            Err(FrameError::EndOfStream)
        ));
    }

    #[test]
    fn truncated_frame_is_end_of_stream() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, &"truncated").unwrap();
        buffer.truncate(buffer.len() - 2);

        let result = read_frame::<_, String>(&mut Cursor::new(buffer));

        assert!(matches!(result, Err(FrameError::EndOfStream)));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let len = u32::try_from(MAX_FRAME_SIZE + 1).unwrap();
        let buffer = len.to_le_bytes().to_vec();

        let result = read_frame::<_, String>(&mut Cursor::new(buffer));

        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
    }

    #[test]
    fn zero_length_frame_is_rejected() {
        let result = read_frame::<_, String>(&mut Cursor::new(vec![0, 0, 0, 0]));

        assert!(matches!(result, Err(FrameError::Empty)));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let mut buffer = 3_u32.to_le_bytes().to_vec();
        buffer.extend_from_slice(b"{{{");

        let result = read_frame::<_, String>(&mut Cursor::new(buffer));

        assert!(matches!(result, Err(FrameError::Decode(_))));
    }
}

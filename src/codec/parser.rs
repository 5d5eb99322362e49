use crate::codec::frame::*;
use anyhow::Context;

pub struct Parser;

impl Parser {
    /// Decode one frame from the front of `buf`
    ///
    /// Returns the frame and the number of bytes it occupied. Fails with
    /// [`FrameError::TooShort`] while the buffer holds only part of a frame.
    pub fn unmarshal(buf: &[u8]) -> crate::Result<(Frame, usize)> {
        if buf.len() < HDR_LEN {
            return Err(FrameError::TooShort.into());
        }

        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        let version = buf[2];
        let cmd = buf[3];
        let payload_size = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;

        if magic != MAGIC || version != VERSION {
            return Err(FrameError::Invalid.into());
        }
        if payload_size > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge(payload_size).into());
        }

        let total_len = HDR_LEN + payload_size;
        if buf.len() < total_len {
            return Err(FrameError::TooShort.into());
        }
        let payload = &buf[HDR_LEN..total_len];

        let frame_type = FrameType::try_from(cmd)?;
        let frame = match frame_type {
            FrameType::Request => {
                Frame::Request(serde_json::from_slice(payload).map_err(|_| FrameError::Invalid)?)
            }
            FrameType::Response => {
                Frame::Response(serde_json::from_slice(payload).map_err(|_| FrameError::Invalid)?)
            }
            FrameType::Event => {
                Frame::Event(serde_json::from_slice(payload).map_err(|_| FrameError::Invalid)?)
            }
            FrameType::KeepAlive => Frame::KeepAlive(KeepAliveFrame {}),
        };
        Ok((frame, total_len))
    }

    pub fn marshal(frame: Frame) -> crate::Result<Vec<u8>> {
        match frame {
            Frame::Request(request) => {
                let payload = serde_json::to_vec(&request).with_context(|| "failed to marshal request")?;
                Parser::encode(FrameType::Request, &payload)
            }
            Frame::Response(response) => {
                let payload = serde_json::to_vec(&response).with_context(|| "failed to marshal response")?;
                Parser::encode(FrameType::Response, &payload)
            }
            Frame::Event(event) => {
                let payload = serde_json::to_vec(&event).with_context(|| "failed to marshal event")?;
                Parser::encode(FrameType::Event, &payload)
            }
            Frame::KeepAlive(_) => Parser::encode(FrameType::KeepAlive, &[]),
        }
    }

    fn encode(frame_type: FrameType, payload: &[u8]) -> crate::Result<Vec<u8>> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::TooLarge(payload.len()).into());
        }

        let mut buf = Vec::with_capacity(HDR_LEN + payload.len());
        // magic: 0x5350
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        // version: 0x01
        buf.push(VERSION);
        // cmd
        buf.push(frame_type as u8);
        // reserved
        buf.extend_from_slice(&[0, 0]);
        // payload_size
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        // payload
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// True if `err` only means the buffer needs more bytes
    pub fn is_incomplete(err: &crate::Error) -> bool {
        matches!(err.downcast_ref::<FrameError>(), Some(FrameError::TooShort))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::status::StatusFilter;
    use crate::rpc::CoreEvent;
    use serde_json::json;

    #[test]
    fn test_request_frame() {
        let frame = Frame::Request(RequestFrame {
            id: 7,
            call: Call::GetStatus {
                filter: StatusFilter::by_ids(vec!["t1".to_string(), "t2".to_string()]),
                fields: vec!["name".to_string()],
                diff: true,
            },
        });
        let buf = Parser::marshal(frame.clone()).unwrap();
        assert_eq!(&buf[0..2], &[0x53, 0x50]);
        assert_eq!(buf[3], 1);

        let (decoded, used) = Parser::unmarshal(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_partial_buffer_is_incomplete() {
        let buf = Parser::marshal(Frame::Response(ResponseFrame::ok(1, json!({"t1": {}})))).unwrap();
        for cut in [0, 4, HDR_LEN, buf.len() - 1] {
            let err = Parser::unmarshal(&buf[..cut]).unwrap_err();
            assert!(Parser::is_incomplete(&err), "cut at {} gave {}", cut, err);
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = Parser::marshal(Frame::KeepAlive(KeepAliveFrame {})).unwrap();
        let event = Frame::Event(EventFrame {
            event: CoreEvent::Removed { id: "t1".to_string() },
        });
        buf.extend(Parser::marshal(event.clone()).unwrap());

        let (first, used) = Parser::unmarshal(&buf).unwrap();
        assert_eq!(first, Frame::KeepAlive(KeepAliveFrame {}));
        assert_eq!(used, HDR_LEN);
        let (second, _) = Parser::unmarshal(&buf[used..]).unwrap();
        assert_eq!(second, event);
    }

    #[test]
    fn test_bad_magic_is_invalid() {
        let mut buf = Parser::marshal(Frame::KeepAlive(KeepAliveFrame {})).unwrap();
        buf[0] = 0x91;
        let err = Parser::unmarshal(&buf).unwrap_err();
        assert!(!Parser::is_incomplete(&err));
        assert_eq!(err.to_string(), "invalid frame");
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut buf = Parser::marshal(Frame::KeepAlive(KeepAliveFrame {})).unwrap();
        buf[6..10].copy_from_slice(&((MAX_PAYLOAD_LEN as u32) + 1).to_be_bytes());
        let err = Parser::unmarshal(&buf).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}

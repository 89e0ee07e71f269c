//! Reassembly of fragmented data messages.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::opcode::Opcode;

/// Joins a text/binary frame and its continuations into one message.
///
/// Control frames are not accepted here; the caller handles them between
/// fragments.
pub struct Assembler {
    /// Opcode of the message in progress
    opcode: Option<Opcode>,
    /// Payload collected so far
    buffer: Vec<u8>,
    /// Maximum assembled message size
    limit: usize,
}

impl Assembler {
    /// Create an assembler that rejects messages above `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            opcode: None,
            buffer: Vec::new(),
            limit,
        }
    }

    /// Feed one data frame.
    ///
    /// Returns the complete message as a single final frame once the last
    /// fragment arrives, or `None` while more fragments are expected.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>, ProtocolError> {
        match (self.opcode, frame.opcode) {
            (None, Opcode::Continuation) => Err(ProtocolError::UnexpectedContinuation),
            (Some(_), op @ (Opcode::Text | Opcode::Binary)) => {
                Err(ProtocolError::ExpectedContinuation(op))
            }
            (None, op) => {
                self.check_size(frame.payload.len())?;
                if frame.fin {
                    return Ok(Some(Frame::new(op, frame.payload)));
                }
                self.opcode = Some(op);
                self.buffer = frame.payload;
                Ok(None)
            }
            (Some(op), _) => {
                self.check_size(self.buffer.len() + frame.payload.len())?;
                self.buffer.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                self.opcode = None;
                Ok(Some(Frame::new(op, std::mem::take(&mut self.buffer))))
            }
        }
    }

    /// True while a fragmented message is open.
    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    /// Bytes buffered for the open message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn check_size(&mut self, size: usize) -> Result<(), ProtocolError> {
        if size > self.limit {
            self.opcode = None;
            self.buffer.clear();
            return Err(ProtocolError::MessageTooLarge {
                size: size as u64,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn unfragmented_message_passes_through() {
        let mut asm = Assembler::new(1024);
        let msg = asm.push(Frame::text("hi")).unwrap().unwrap();
        assert_eq!(msg.opcode, Opcode::Text);
        assert_eq!(msg.payload, b"hi");
        assert!(!asm.in_progress());
    }

    #[test]
    fn fragments_are_joined_in_order() {
        let mut asm = Assembler::new(1024);
        assert!(asm.push(Frame::binary(vec![1, 2]).with_fin(false)).unwrap().is_none());
        assert!(asm.push(Frame::continuation(vec![3], false)).unwrap().is_none());
        assert_eq!(asm.buffered(), 3);

        let msg = asm.push(Frame::continuation(vec![4, 5], true)).unwrap().unwrap();
        assert_eq!(msg.opcode, Opcode::Binary);
        assert!(msg.fin);
        assert_eq!(msg.payload, [1, 2, 3, 4, 5]);
        assert!(!asm.in_progress());
    }

    #[test]
    fn stray_continuation_is_rejected() {
        let mut asm = Assembler::new(1024);
        assert_matches!(
            asm.push(Frame::continuation(vec![1], true)),
            Err(ProtocolError::UnexpectedContinuation)
        );
    }

    #[test]
    fn interleaved_data_frame_is_rejected() {
        let mut asm = Assembler::new(1024);
        asm.push(Frame::text("a").with_fin(false)).unwrap();
        assert_matches!(
            asm.push(Frame::text("b")),
            Err(ProtocolError::ExpectedContinuation(Opcode::Text))
        );
    }

    #[test]
    fn accumulated_size_is_bounded() {
        let mut asm = Assembler::new(4);
        asm.push(Frame::binary(vec![0; 3]).with_fin(false)).unwrap();
        assert_matches!(
            asm.push(Frame::continuation(vec![0; 2], true)),
            Err(ProtocolError::MessageTooLarge { size: 5, limit: 4 })
        );
        assert!(!asm.in_progress());
    }
}

//! Framed echo: every decoded frame is sent back re-encoded.

use super::codec::{FrameDecoder, FrameEncoder};
use crate::protocols::stream::{Flow, Service};
use tracing::warn;

pub struct FramedEcho;

impl Service for FramedEcho {
    type State = FrameDecoder;

    fn name(&self) -> &'static str {
        "framed-echo"
    }

    fn open(&self) -> FrameDecoder {
        FrameDecoder::new()
    }

    fn on_data(&self, decoder: &mut FrameDecoder, data: &[u8], replies: &mut Vec<Vec<u8>>) -> Flow {
        decoder.extend(data);

        let mut encoder = FrameEncoder::new();
        let flow = loop {
            match decoder.try_extract() {
                Ok(Some(frame)) => {
                    if let Err(e) = encoder.push(&frame) {
                        warn!(error = %e, "Failed to encode frame");
                        break Flow::Close;
                    }
                }
                Ok(None) => break Flow::Continue,
                Err(e) => {
                    warn!(error = %e, "Protocol violation");
                    break Flow::Close;
                }
            }
        };

        while let Some(frame) = encoder.pop() {
            replies.push(frame.to_vec());
        }
        flow
    }
}

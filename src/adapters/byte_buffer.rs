use std::sync::Arc;

use parking_lot::Mutex;

use super::{ByteBuffer, ByteBufferInputConfig, ByteBufferOutputConfig};
use crate::*;

pub struct ByteBufferInput {
    data: Arc<[u8]>,
}

impl BaseAdapterHandler<Input, ByteBuffer> for ByteBufferInput {
    fn create(config: &ByteBufferInputConfig) -> Result<Self, GvoxError> {
        Ok(Self {
            data: config.data.clone(),
        })
    }
}

impl InputAdapterHandler for ByteBufferInput {
    fn read(
        &mut self,
        _blit_ctx: &BlitContext,
        position: usize,
        data: &mut [u8],
    ) -> Result<(), GvoxError> {
        let src = position
            .checked_add(data.len())
            .and_then(|end| self.data.get(position..end));
        match src {
            Some(src) => {
                data.copy_from_slice(src);
                Ok(())
            }
            None => Err(GvoxError::new(
                ErrorType::InputAdapter,
                "Tried reading past the end of the provided input buffer.",
            )),
        }
    }

    fn size(&self) -> Option<usize> {
        Some(self.data.len())
    }
}

/// Writes into the caller's shared buffer, growing it (zero-filled) for
/// writes past the current end.
pub struct ByteBufferOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl BaseAdapterHandler<Output, ByteBuffer> for ByteBufferOutput {
    fn create(config: &ByteBufferOutputConfig) -> Result<Self, GvoxError> {
        let buffer = config.buffer.clone();
        buffer.lock().clear();
        Ok(Self { buffer })
    }
}

impl OutputAdapterHandler for ByteBufferOutput {
    fn write(&mut self, _blit_ctx: &BlitContext, position: usize, data: &[u8]) -> Result<(), GvoxError> {
        let Some(end) = position.checked_add(data.len()) else {
            return Err(GvoxError::new(
                ErrorType::OutputAdapter,
                "Tried writing past the addressable end of the output buffer.",
            ));
        };
        let mut buffer = self.buffer.lock();
        if end > buffer.len() {
            let additional = end - buffer.len();
            buffer.try_reserve(additional).map_err(|e| {
                GvoxError::new(
                    ErrorType::OutputAdapter,
                    format!("Failed to grow the output buffer to {end} bytes: {e}"),
                )
            })?;
            buffer.resize(end, 0);
        }
        buffer[position..end].copy_from_slice(data);
        Ok(())
    }

    fn reserve(&mut self, _blit_ctx: &BlitContext, size: usize) -> Result<(), GvoxError> {
        let mut buffer = self.buffer.lock();
        let additional = size.saturating_sub(buffer.len());
        buffer.try_reserve(additional).map_err(|e| {
            GvoxError::new(
                ErrorType::OutputAdapter,
                format!("Failed to reserve {size} bytes of output: {e}"),
            )
        })
    }
}

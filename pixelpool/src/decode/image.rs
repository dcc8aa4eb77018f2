//! Default decoder built on the `image` crate.

use std::io::BufReader;

use image::{DynamicImage, ImageReader};

use crate::buffer::{Dimensions, Orientation, PooledBuffer};
use crate::decode::{DecodeError, Decoder};
use crate::request::ByteSource;

/// Decoder for the common raster formats (JPEG, PNG, GIF, WebP, ...).
///
/// Reads the direct file-handle path without buffering the whole file in
/// memory; generic streams are drained first. Images larger than the decode
/// target are downscaled preserving aspect ratio; smaller images are kept
/// at their native size.
#[derive(Debug, Default)]
pub struct ImageDecoder;

impl ImageDecoder {
    /// Creates the decoder.
    pub fn new() -> Self {
        Self
    }

    fn load(&self, source: ByteSource) -> Result<DynamicImage, DecodeError> {
        match source {
            ByteSource::Handle(file) => ImageReader::new(BufReader::new(file))
                .with_guessed_format()
                .map_err(|e| DecodeError::Decode(e.to_string()))?
                .decode()
                .map_err(|e| DecodeError::Decode(e.to_string())),
            ByteSource::Stream(_) => {
                let bytes = source
                    .read_all()
                    .map_err(|e| DecodeError::Decode(e.to_string()))?;
                image::load_from_memory(&bytes).map_err(|e| DecodeError::Decode(e.to_string()))
            }
        }
    }
}

impl Decoder for ImageDecoder {
    fn decode(
        &self,
        source: ByteSource,
        target: Dimensions,
        recycled: Option<Vec<u8>>,
    ) -> Result<PooledBuffer, DecodeError> {
        let decoded = self.load(source)?;

        let scaled = if !target.is_empty()
            && (decoded.width() > target.width || decoded.height() > target.height)
        {
            decoded.thumbnail(target.width, target.height)
        } else {
            decoded
        };

        let rgba = scaled.into_rgba8();
        let dims = Dimensions::new(rgba.width(), rgba.height());

        let mut storage = recycled.unwrap_or_default();
        storage.clear();
        storage.extend_from_slice(rgba.as_raw());

        Ok(PooledBuffer::new(storage, dims, Orientation::Deg0))
    }
}

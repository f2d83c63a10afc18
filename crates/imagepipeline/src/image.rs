//! Result payloads flowing through the pipeline.

use bytes::Bytes;
use pipeline_core::CloseableRef;

/// Encoded image bytes backed by a reference-counted buffer.
///
/// Cloning is cheap: it bumps the underlying refcount, never copies the
/// bytes. A stage that wants to retain an image past a callback's return
/// must clone it; the cache and multiplexer layers rely on this.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    buffer: CloseableRef<Bytes>,
}

impl EncodedImage {
    pub fn new(bytes: Bytes) -> EncodedImage {
        EncodedImage {
            buffer: CloseableRef::of(bytes),
        }
    }

    pub fn from_ref(buffer: CloseableRef<Bytes>) -> EncodedImage {
        EncodedImage { buffer }
    }

    pub fn size(&self) -> usize {
        self.buffer.get().len()
    }

    /// Copies out the underlying bytes handle (refcount bump, no copy).
    pub fn bytes(&self) -> Bytes {
        self.buffer.get().clone()
    }

    pub fn ref_count(&self) -> usize {
        self.buffer.ref_count()
    }
}

/// A decoded bitmap. The pixel buffer is reference counted the same way
/// encoded bytes are; decode internals are a collaborator concern and only
/// the dimensions matter here.
#[derive(Debug)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

impl DecodedImage {
    pub fn byte_size(&self) -> usize {
        self.pixels.len()
    }
}

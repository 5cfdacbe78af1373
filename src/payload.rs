//! Builds the self-extracting image sent to the device.
//!
//! The image is laid out as follows:
//! 1. The shellcode, an LZ4 decompressor stub which expects the length of the
//!    compressed data as a native-endian `u32` at [`COMPRESSED_SIZE_OFFSET`].
//! 2. The PongoOS image, compressed as a raw LZ4 block with LZ4 HC at its
//!    maximum level.

use std::{
    fmt,
    io::Read,
    path::{Path, PathBuf},
};

use lz4::block::CompressionMode;

/// PongoOS must be strictly smaller than this before compression.
pub const MAX_IMAGE_LEN: usize = 0x7fe00;
/// Byte offset of the compressed length field read by the shellcode.
pub const COMPRESSED_SIZE_OFFSET: usize = 0x1fc;
/// Smallest shellcode which still contains the compressed length field.
pub const MIN_SHELLCODE_LEN: usize = COMPRESSED_SIZE_OFFSET + size_of::<u32>();

const LZ4HC_CLEVEL_MAX: i32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Shellcode,
    Image,
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Shellcode => f.write_str("shellcode"),
            Input::Image => f.write_str("PongoOS image"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Failed to open {input} '{}': {source}", path.display())]
    Open {
        input: Input,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to fetch {input} file metadata for '{}': {source}", path.display())]
    Metadata {
        input: Input,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read {input} '{}': {source}", path.display())]
    Read {
        input: Input,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("PongoOS is too large, must be less than {limit:#x} bytes but is {actual:#x} bytes")]
    ImageTooLarge { limit: usize, actual: u64 },
    #[error(
        "{input} size changed? It was {expected} bytes when checked but {actual} bytes were read from disk"
    )]
    SizeChanged {
        input: Input,
        expected: u64,
        actual: usize,
    },
    #[error(
        "Shellcode is too small, must be at least {required:#x} bytes to hold the compressed size field but is {actual:#x} bytes"
    )]
    ShellcodeTooShort { required: usize, actual: usize },
    #[error("Failed to compress PongoOS: {0}")]
    Compress(std::io::Error),
    #[error("Failed to compress PongoOS: compressor produced no output")]
    CompressEmpty,
    #[error("Compressed PongoOS is too large for the size field ({0:#x} bytes)")]
    CompressedTooLarge(usize),
    #[error("Field at {offset:#x} does not fit in a {len:#x} byte image")]
    FieldOutOfBounds { offset: usize, len: usize },
}

/// The shellcode followed by the compressed PongoOS image.
#[derive(Clone, PartialEq, Eq)]
pub struct CombinedImage {
    buffer: Vec<u8>,
    shellcode_len: usize,
}

impl fmt::Debug for CombinedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinedImage")
            .field("len", &self.buffer.len())
            .field("shellcode_len", &self.shellcode_len)
            .finish()
    }
}

impl CombinedImage {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub const fn shellcode_len(&self) -> usize {
        self.shellcode_len
    }

    pub fn compressed_len(&self) -> usize {
        self.buffer.len() - self.shellcode_len
    }

    /// Reads back the compressed length field as the shellcode will see it.
    pub fn compressed_size_field(&self) -> Option<u32> {
        read_u32_ne(&self.buffer, COMPRESSED_SIZE_OFFSET)
    }
}

/// Writes `value` in host byte order at `offset`, refusing to grow or overrun `buffer`.
pub fn write_u32_ne(buffer: &mut [u8], offset: usize, value: u32) -> Result<(), BuildError> {
    let len = buffer.len();
    let field = offset
        .checked_add(size_of::<u32>())
        .and_then(|end| buffer.get_mut(offset..end))
        .ok_or(BuildError::FieldOutOfBounds { offset, len })?;

    field.copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

pub fn read_u32_ne(buffer: &[u8], offset: usize) -> Option<u32> {
    let field = buffer.get(offset..offset.checked_add(size_of::<u32>())?)?;
    Some(u32::from_ne_bytes(field.try_into().ok()?))
}

fn read_input(input: Input, path: &Path, max_len: Option<usize>) -> Result<Vec<u8>, BuildError> {
    let mut file = std::fs::File::open(path).map_err(|source| BuildError::Open {
        input,
        path: path.to_owned(),
        source,
    })?;

    let len = file
        .metadata()
        .map_err(|source| BuildError::Metadata {
            input,
            path: path.to_owned(),
            source,
        })?
        .len();

    if let Some(limit) = max_len
        && len >= limit as u64
    {
        return Err(BuildError::ImageTooLarge { limit, actual: len });
    }

    let mut buffer = Vec::with_capacity(len as usize);
    file.read_to_end(&mut buffer)
        .map_err(|source| BuildError::Read {
            input,
            path: path.to_owned(),
            source,
        })?;

    if buffer.len() as u64 != len {
        return Err(BuildError::SizeChanged {
            input,
            expected: len,
            actual: buffer.len(),
        });
    }

    Ok(buffer)
}

/// Reads the shellcode and PongoOS image from disk and builds the combined image.
pub fn build(shellcode_path: &Path, image_path: &Path) -> Result<CombinedImage, BuildError> {
    let shellcode = read_input(Input::Shellcode, shellcode_path, None)?;
    let image = read_input(Input::Image, image_path, Some(MAX_IMAGE_LEN))?;

    tracing::debug!(
        "Read {:#x} bytes of shellcode from '{}' and {:#x} bytes of PongoOS from '{}'",
        shellcode.len(),
        shellcode_path.display(),
        image.len(),
        image_path.display()
    );

    build_from_parts(shellcode, &image)
}

pub fn build_from_parts(shellcode: Vec<u8>, image: &[u8]) -> Result<CombinedImage, BuildError> {
    if image.len() >= MAX_IMAGE_LEN {
        return Err(BuildError::ImageTooLarge {
            limit: MAX_IMAGE_LEN,
            actual: image.len() as u64,
        });
    }

    if shellcode.len() < MIN_SHELLCODE_LEN {
        return Err(BuildError::ShellcodeTooShort {
            required: MIN_SHELLCODE_LEN,
            actual: shellcode.len(),
        });
    }

    tracing::debug!("Compressing PongoOS");
    let compressed = lz4::block::compress(
        image,
        Some(CompressionMode::HIGHCOMPRESSION(LZ4HC_CLEVEL_MAX)),
        false,
    )
    .map_err(BuildError::Compress)?;

    if compressed.is_empty() {
        return Err(BuildError::CompressEmpty);
    }

    let compressed_len = u32::try_from(compressed.len())
        .map_err(|_| BuildError::CompressedTooLarge(compressed.len()))?;

    tracing::debug!(
        "Compressed PongoOS from {:#x} to {:#x} bytes, adding shellcode",
        image.len(),
        compressed_len
    );

    let shellcode_len = shellcode.len();
    let mut buffer = shellcode;
    buffer.reserve_exact(compressed.len());
    buffer.extend_from_slice(&compressed);

    write_u32_ne(&mut buffer, COMPRESSED_SIZE_OFFSET, compressed_len)?;

    Ok(CombinedImage {
        buffer,
        shellcode_len,
    })
}

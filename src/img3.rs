//! IMG3 tagged-container codec.
//!
//! An IMG3 image is a 20-byte header followed by a sequence of chunks,
//! each `(tag, total-length, data-length, payload, padding)`. The device
//! verifies the payload of the `SHSH` chunk against its own identity, so
//! restoring on a different device means swapping that one payload for
//! the blob the signing authority issued.
//!
//! Substitution happens in place: every chunk other than `SHSH` is kept
//! as its original raw bytes, including chunks this codec knows nothing
//! about. Only the header length fields and the signature chunk are
//! rewritten.

use std::fmt;

use crate::{Error, Result};

/// Container magic, `Img3` (stored little-endian, so files begin `3gmI`).
pub const MAGIC: u32 = 0x496d_6733;

/// Chunk tags with structural meaning to this codec.
pub mod tag {
    /// Payload type FourCC (`krnl`, `ibec`, ...)
    pub const TYPE: u32 = 0x5459_5045;
    /// Firmware payload
    pub const DATA: u32 = 0x4441_5441;
    /// Version string
    pub const VERS: u32 = 0x5645_5253;
    /// Device signature, verified against the signing ticket
    pub const SHSH: u32 = 0x5348_5348;
    /// Certificate chain
    pub const CERT: u32 = 0x4345_5254;
    /// Encryption keybag
    pub const KBAG: u32 = 0x4b42_4147;
}

pub mod len {
    /// Container header length
    pub const HEADER: usize = 20;
    /// Per-chunk header length (tag, total length, data length)
    pub const CHUNK_HEADER: usize = 12;
}

mod index {
    pub const MAGIC: usize = 0;
    pub const FULL_SIZE: usize = 4;
    pub const DATA_SIZE: usize = 8;
    pub const SIG_OFFSET: usize = 12;
    pub const IDENT: usize = 16;
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// One parsed chunk. `raw` holds the full framed bytes (header, payload,
/// padding) exactly as they appeared on disk.
#[derive(Clone, Debug, PartialEq)]
struct Chunk {
    tag: u32,
    data_len: usize,
    raw: Vec<u8>,
}

impl Chunk {
    fn payload(&self) -> &[u8] {
        &self.raw[len::CHUNK_HEADER..len::CHUNK_HEADER + self.data_len]
    }
}

/// A parsed IMG3 container.
#[derive(Clone, Debug, PartialEq)]
pub struct Img3 {
    ident: u32,
    sig_offset: u32,
    chunks: Vec<Chunk>,
}

impl Img3 {
    /// Parse a container, validating the framing.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < len::HEADER {
            return Err(Error::malformed("short header"));
        }

        let magic = read_u32(bytes, index::MAGIC);
        if magic != MAGIC {
            return Err(Error::malformed(format!("bad magic: {magic:#010x}")));
        }

        let full_size = read_u32(bytes, index::FULL_SIZE) as usize;
        let data_size = read_u32(bytes, index::DATA_SIZE) as usize;
        let sig_offset = read_u32(bytes, index::SIG_OFFSET);
        let ident = read_u32(bytes, index::IDENT);

        if full_size != bytes.len() {
            return Err(Error::malformed(format!(
                "full size {full_size} does not match container length {}",
                bytes.len()
            )));
        }
        if data_size != full_size - len::HEADER {
            return Err(Error::malformed(format!("data size {data_size} disagrees with full size")));
        }

        let data = &bytes[len::HEADER..];
        let mut chunks = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            if data.len() - offset < len::CHUNK_HEADER {
                return Err(Error::malformed("truncated chunk header"));
            }

            let tag = read_u32(data, offset);
            let total_len = read_u32(data, offset + 4) as usize;
            let data_len = read_u32(data, offset + 8) as usize;

            if tag.to_le_bytes().iter().any(|b| !b.is_ascii_graphic()) {
                return Err(Error::malformed(format!("unknown structural tag: {tag:#010x}")));
            }
            if total_len < len::CHUNK_HEADER || data_len > total_len - len::CHUNK_HEADER {
                return Err(Error::malformed(format!("chunk lengths disagree: {total_len}/{data_len}")));
            }
            if total_len > data.len() - offset {
                return Err(Error::malformed("truncated chunk"));
            }

            chunks.push(Chunk {
                tag,
                data_len,
                raw: data[offset..offset + total_len].to_vec(),
            });

            offset += total_len;
        }

        Ok(Self {
            ident,
            sig_offset,
            chunks,
        })
    }

    /// Get the payload type FourCC from the header.
    pub fn ident(&self) -> u32 {
        self.ident
    }

    /// Get the signature chunk payload, if the container has one.
    pub fn signature(&self) -> Option<&[u8]> {
        self.chunks
            .iter()
            .find(|chunk| chunk.tag == tag::SHSH)
            .map(Chunk::payload)
    }

    /// Overwrite the signature chunk payload with `blob`.
    ///
    /// The chunk is reframed for the new payload length (padded to a
    /// 4-byte boundary); every other chunk keeps its original bytes.
    pub fn replace_signature(&mut self, blob: &[u8]) -> Result<()> {
        let chunk = self
            .chunks
            .iter_mut()
            .find(|chunk| chunk.tag == tag::SHSH)
            .ok_or(Error::NoSignatureChunk)?;

        let total_len = (len::CHUNK_HEADER + blob.len() + 3) & !3;

        let mut raw = Vec::with_capacity(total_len);
        raw.extend_from_slice(&tag::SHSH.to_le_bytes());
        raw.extend_from_slice(&(total_len as u32).to_le_bytes());
        raw.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        raw.extend_from_slice(blob);
        raw.resize(total_len, 0);

        chunk.data_len = blob.len();
        chunk.raw = raw;

        Ok(())
    }

    /// Serialize the container.
    ///
    /// Untouched chunks are emitted byte-for-byte; the header length
    /// fields are recomputed. The signature offset is carried over as
    /// parsed: chunks ahead of `SHSH` are never touched, so replacement
    /// cannot move it.
    pub fn serialize(&self) -> Vec<u8> {
        let data_size: usize = self.chunks.iter().map(|chunk| chunk.raw.len()).sum();
        let full_size = len::HEADER + data_size;

        let mut out = Vec::with_capacity(full_size);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&(full_size as u32).to_le_bytes());
        out.extend_from_slice(&(data_size as u32).to_le_bytes());
        out.extend_from_slice(&self.sig_offset.to_le_bytes());
        out.extend_from_slice(&self.ident.to_le_bytes());

        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.raw);
        }

        out
    }
}

impl fmt::Display for Img3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        write!(f, r#""ident": "{:#010x}", "#, self.ident)?;
        write!(f, r#""chunks": ["#)?;
        for (i, chunk) in self.chunks.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, r#""{:#010x}""#, chunk.tag)?;
        }
        write!(f, "]}}")
    }
}

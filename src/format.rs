//! TBT container codec
//!
//! The container is the serialized form of a [`Buffer`]: a fixed header,
//! sizing fields, an optionally zlib-compressed payload of cell records,
//! and (since version 2) trailing metadata strings.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ magic "TBT" (3 bytes)                                        │
//! │ version (1 byte)                                             │
//! │ width, height, flags (4-byte LE signed each)                 │
//! │ metadata entry count (4 bytes, version 2 only)               │
//! │ decompressed size, compressed size (4 bytes each)            │
//! │ payload (compressed size bytes if COMPRESSED, else           │
//! │          decompressed size bytes)                            │
//! │ metadata entries (version 2 only, on the raw stream)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Metadata strings use an unsigned LEB128 length prefix (7 data bits per
//! byte, high bit set on continuation bytes) followed by UTF-8 data. They
//! always sit on the raw outer stream after the payload block, never
//! inside the compression filter, even though the decompressed-size field
//! also counts an embedded copy inside the payload.
//!
//! There is no forward compatibility: versions other than 1 and 2 are
//! rejected, and decoding consumes the whole container in one pass.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;

use crate::buffer::{Buffer, BufferFlags};
use crate::cell::Cell;
use crate::error::FormatError;

/// Magic bytes opening every container.
pub const MAGIC: [u8; 3] = *b"TBT";

/// The container version this codec writes. Version 1 (no metadata block)
/// is still decoded.
pub const FORMAT_VERSION: u8 = 2;

/// Serialize `buffer` as a TBT container.
///
/// The version byte is always [`FORMAT_VERSION`], regardless of the
/// version the buffer was decoded from: writing upgrades to the current
/// on-disk version. The payload is zlib-compressed at maximum effort when
/// the buffer's `COMPRESSED` flag is set.
pub fn encode<W: Write>(buffer: &Buffer, writer: &mut W) -> Result<(), FormatError> {
    let width = dimension(buffer.width(), buffer)?;
    let height = dimension(buffer.height(), buffer)?;
    let metadata_count =
        i32::try_from(buffer.metadata().len()).map_err(|_| FormatError::Oversize("metadata count"))?;

    writer.write_all(&MAGIC)?;
    writer.write_all(&[FORMAT_VERSION])?;
    write_i32(writer, width)?;
    write_i32(writer, height)?;
    write_i32(writer, buffer.flags().bits() as i32)?;
    write_i32(writer, metadata_count)?;

    // Payload scratch: every cell record, then an embedded metadata copy.
    // The embedded copy only feeds the sizing fields; the decoder consumes
    // the trailing copy written on the raw stream below.
    let mut scratch = Vec::with_capacity(buffer.cells().len() * Cell::ENCODED_LEN);
    for cell in buffer.cells() {
        cell.encode(&mut scratch)?;
    }
    for (key, value) in buffer.metadata() {
        write_string(&mut scratch, key)?;
        write_string(&mut scratch, value)?;
    }

    let decompressed_size =
        i32::try_from(scratch.len()).map_err(|_| FormatError::Oversize("payload size"))?;

    if buffer.is_compressed() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&scratch)?;
        let compressed = encoder.finish()?;
        let compressed_size = i32::try_from(compressed.len())
            .map_err(|_| FormatError::Oversize("compressed payload size"))?;
        write_i32(writer, decompressed_size)?;
        write_i32(writer, compressed_size)?;
        writer.write_all(&compressed)?;
        debug!(
            "encoded {}x{} container: payload {} -> {} bytes, {} metadata entries",
            width,
            height,
            scratch.len(),
            compressed.len(),
            metadata_count
        );
    } else {
        write_i32(writer, decompressed_size)?;
        write_i32(writer, 0)?;
        writer.write_all(&scratch)?;
        debug!(
            "encoded {}x{} container: payload {} bytes, {} metadata entries",
            width,
            height,
            scratch.len(),
            metadata_count
        );
    }

    for (key, value) in buffer.metadata() {
        write_string(writer, key)?;
        write_string(writer, value)?;
    }

    Ok(())
}

/// Deserialize a TBT container into a new [`Buffer`].
///
/// The stream must be positioned at the start of a container. Decoding is
/// all-or-nothing: either a fully populated buffer is returned or the
/// first failure aborts with nothing usable.
pub fn decode<R: Read>(reader: &mut R) -> Result<Buffer, FormatError> {
    let mut magic = [0u8; 3];
    read_exact_or(reader, &mut magic, "magic")?;
    if magic != MAGIC {
        return Err(FormatError::BadMagic(magic));
    }

    let version = read_u8(reader, "version")?;
    match version {
        1 | FORMAT_VERSION => {}
        other => return Err(FormatError::UnsupportedVersion(other)),
    }

    let width = read_i32(reader, "width")?;
    let height = read_i32(reader, "height")?;
    if width < 0 || height < 0 {
        return Err(FormatError::InvalidDimensions {
            width: i64::from(width),
            height: i64::from(height),
        });
    }
    let flags = BufferFlags::new(read_i32(reader, "flags")? as u32);

    // Version 1 containers carry no metadata count and no trailing
    // metadata block.
    let metadata_count = if version == FORMAT_VERSION {
        non_negative(read_i32(reader, "metadata count")?, "metadata count")?
    } else {
        0
    };

    let decompressed_size = non_negative(read_i32(reader, "decompressed size")?, "decompressed size")?;
    let compressed_size = non_negative(read_i32(reader, "compressed size")?, "compressed size")?;

    let payload = if flags.contains(BufferFlags::COMPRESSED) {
        let mut compressed = vec![0u8; compressed_size];
        read_exact_or(reader, &mut compressed, "compressed payload")?;
        let mut payload = Vec::with_capacity(decompressed_size);
        ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut payload)
            .map_err(FormatError::CorruptPayload)?;
        payload
    } else {
        let mut payload = vec![0u8; decompressed_size];
        read_exact_or(reader, &mut payload, "payload")?;
        payload
    };

    let cell_count = (width as usize)
        .checked_mul(height as usize)
        .ok_or(FormatError::InvalidDimensions {
            width: i64::from(width),
            height: i64::from(height),
        })?;

    let mut remaining = payload.as_slice();
    let mut cells = Vec::with_capacity(cell_count);
    for _ in 0..cell_count {
        let cell = Cell::decode(&mut remaining).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => FormatError::Truncated("cell data"),
            _ => FormatError::Io(err),
        })?;
        cells.push(cell);
    }
    // Any bytes left in the payload are the embedded metadata copy; the
    // authoritative entries follow on the raw stream.

    let mut metadata = Vec::with_capacity(metadata_count);
    for _ in 0..metadata_count {
        let key = read_string(reader)?;
        let value = read_string(reader)?;
        metadata.push((key, value));
    }

    debug!(
        "decoded {}x{} v{} container: {} cells, {} metadata entries",
        width, height, version, cell_count, metadata_count
    );

    Ok(Buffer::from_parts(
        version,
        width as usize,
        height as usize,
        flags,
        cells,
        metadata,
    ))
}

/// Open a file and decode the container it holds. Thin pass-through to
/// [`decode`] over a buffered reader.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Buffer, FormatError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    decode(&mut reader)
}

fn dimension(value: usize, buffer: &Buffer) -> Result<i32, FormatError> {
    i32::try_from(value).map_err(|_| FormatError::InvalidDimensions {
        width: buffer.width() as i64,
        height: buffer.height() as i64,
    })
}

fn non_negative(value: i32, context: &'static str) -> Result<usize, FormatError> {
    if value < 0 {
        return Err(FormatError::NegativeField(context));
    }
    Ok(value as usize)
}

fn read_exact_or<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    context: &'static str,
) -> Result<(), FormatError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => FormatError::Truncated(context),
        _ => FormatError::Io(err),
    })
}

fn read_u8<R: Read>(reader: &mut R, context: &'static str) -> Result<u8, FormatError> {
    let mut byte = [0u8; 1];
    read_exact_or(reader, &mut byte, context)?;
    Ok(byte[0])
}

fn read_i32<R: Read>(reader: &mut R, context: &'static str) -> Result<i32, FormatError> {
    let mut bytes = [0u8; 4];
    read_exact_or(reader, &mut bytes, context)?;
    Ok(i32::from_le_bytes(bytes))
}

fn write_i32<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

/// Write a string as an unsigned LEB128 byte length followed by UTF-8 data.
fn write_string<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    let mut length = s.len() as u64;
    loop {
        let byte = (length & 0x7F) as u8;
        length >>= 7;
        if length == 0 {
            writer.write_all(&[byte])?;
            break;
        }
        writer.write_all(&[byte | 0x80])?;
    }
    writer.write_all(s.as_bytes())
}

/// Read a string written by [`write_string`]. The length prefix is capped
/// at five bytes (a `u32` length).
fn read_string<R: Read>(reader: &mut R) -> Result<String, FormatError> {
    let mut length: u32 = 0;
    let mut shift = 0;
    loop {
        let byte = read_u8(reader, "string length")?;
        length |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            return Err(FormatError::BadStringLength);
        }
    }
    let mut bytes = vec![0u8; length as usize];
    read_exact_or(reader, &mut bytes, "string data")?;
    Ok(String::from_utf8(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        for s in ["", "k", "hello", "naïve", "日本語", &"x".repeat(300)] {
            let mut bytes = Vec::new();
            write_string(&mut bytes, s).unwrap();
            let decoded = read_string(&mut bytes.as_slice()).unwrap();
            assert_eq!(decoded, s);
        }
    }

    #[test]
    fn test_string_length_prefix_is_leb128() {
        let s = "x".repeat(300);
        let mut bytes = Vec::new();
        write_string(&mut bytes, &s).unwrap();
        // 300 = 0b10_0101100 -> 0xAC 0x02
        assert_eq!(&bytes[..2], &[0xAC, 0x02]);
        assert_eq!(bytes.len(), 2 + 300);
    }

    #[test]
    fn test_string_prefix_too_long() {
        let bytes = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01];
        let err = read_string(&mut bytes.as_ref()).unwrap_err();
        assert!(matches!(err, FormatError::BadStringLength));
    }

    #[test]
    fn test_string_invalid_utf8() {
        let bytes = [0x02u8, 0xFF, 0xFE];
        let err = read_string(&mut bytes.as_ref()).unwrap_err();
        assert!(matches!(err, FormatError::InvalidUtf8(_)));
    }

    #[test]
    fn test_string_truncated_data() {
        let bytes = [0x05u8, b'a', b'b'];
        let err = read_string(&mut bytes.as_ref()).unwrap_err();
        assert!(matches!(err, FormatError::Truncated("string data")));
    }
}

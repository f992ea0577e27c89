//! Source image access for OOB reads and bulk streaming.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to open image {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("requested range {offset}+{len} exceeds image size {total}")]
    RangeOutOfBounds { offset: u64, len: u64, total: u64 },

    #[error("image truncated: wanted {wanted} bytes, got {got}")]
    Truncated { wanted: u64, got: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A seekable byte source with a known total length.
///
/// Owned exclusively by one transfer at a time; serves both random-access
/// OOB reads and the sequential streaming pass.
pub struct SourceImage<R> {
    reader: R,
    total_len: u64,
}

impl SourceImage<File> {
    /// Open a filesystem image.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ImageError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let total_len = file.metadata()?.len();
        Ok(Self {
            reader: file,
            total_len,
        })
    }
}

impl<R: Read + Seek> SourceImage<R> {
    /// Wrap an arbitrary seekable reader, measuring its length.
    pub fn from_reader(mut reader: R) -> Result<Self, ImageError> {
        let total_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self { reader, total_len })
    }

    pub fn len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Absolute-offset read for OOB service.
    ///
    /// The whole range must lie inside the image; a request past the end is
    /// rejected before any byte is read.
    pub fn read_at(&mut self, offset: u64, len: u64) -> Result<Vec<u8>, ImageError> {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.total_len);
        if !in_bounds {
            return Err(ImageError::RangeOutOfBounds {
                offset,
                len,
                total: self.total_len,
            });
        }

        self.reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf, len)?;
        Ok(buf)
    }

    /// Seek back to the start of the image.
    pub fn rewind(&mut self) -> Result<(), ImageError> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Sequential read of exactly `buf.len()` bytes at the current position.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<(), ImageError> {
        let wanted = buf.len() as u64;
        self.fill(buf, wanted)
    }

    fn fill(&mut self, buf: &mut [u8], wanted: u64) -> Result<(), ImageError> {
        let mut got = 0;
        while got < buf.len() {
            let n = self.reader.read(&mut buf[got..])?;
            if n == 0 {
                return Err(ImageError::Truncated {
                    wanted,
                    got: got as u64,
                });
            }
            got += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image_of(len: usize) -> SourceImage<Cursor<Vec<u8>>> {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        SourceImage::from_reader(Cursor::new(data)).unwrap()
    }

    #[test]
    fn test_read_at_in_bounds() {
        let mut image = image_of(1000);
        let data = image.read_at(500, 200).unwrap();
        assert_eq!(data.len(), 200);
        assert_eq!(data[0], (500 % 251) as u8);
        assert_eq!(data[199], (699 % 251) as u8);
    }

    #[test]
    fn test_read_at_past_end() {
        let mut image = image_of(1000);
        let err = image.read_at(900, 200).unwrap_err();
        assert!(matches!(
            err,
            ImageError::RangeOutOfBounds {
                offset: 900,
                len: 200,
                total: 1000
            }
        ));
    }

    #[test]
    fn test_read_at_offset_overflow() {
        let mut image = image_of(10);
        assert!(matches!(
            image.read_at(u64::MAX, 2),
            Err(ImageError::RangeOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_sequential_chunks() {
        let mut image = image_of(100);
        let mut buf = [0u8; 60];
        image.read_chunk(&mut buf).unwrap();
        assert_eq!(buf[0], 0);

        let mut rest = [0u8; 40];
        image.read_chunk(&mut rest).unwrap();
        assert_eq!(rest[39], 99 % 251);
    }

    #[test]
    fn test_empty_image() {
        let image = image_of(0);
        assert!(image.is_empty());
        assert_eq!(image.len(), 0);
    }
}

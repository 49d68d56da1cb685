#![forbid(unsafe_code)]
//! Encoding helpers shared by the page, fragment, and log codecs.

pub mod le {
    //! Fixed-width little-endian fields. Callers slice the exact width.

    use core::convert::TryInto;

    /// Writes a u16 into the first two bytes of `dst`.
    pub fn put_u16(dst: &mut [u8], v: u16) {
        dst[..2].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a u32 into the first four bytes of `dst`.
    pub fn put_u32(dst: &mut [u8], v: u32) {
        dst[..4].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a u64 into the first eight bytes of `dst`.
    pub fn put_u64(dst: &mut [u8], v: u64) {
        dst[..8].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a u16 from the first two bytes of `src`.
    pub fn get_u16(src: &[u8]) -> u16 {
        u16::from_le_bytes(src[..2].try_into().unwrap_or([0; 2]))
    }

    /// Reads a u32 from the first four bytes of `src`.
    pub fn get_u32(src: &[u8]) -> u32 {
        u32::from_le_bytes(src[..4].try_into().unwrap_or([0; 4]))
    }

    /// Reads a u64 from the first eight bytes of `src`.
    pub fn get_u64(src: &[u8]) -> u64 {
        u64::from_le_bytes(src[..8].try_into().unwrap_or([0; 8]))
    }
}

pub mod buf {
    //! Cursor-style encoder/decoder over byte buffers used by record payloads.

    use crate::types::{Result, TesseraError};

    /// Appends fixed-width little-endian fields and length-prefixed blobs.
    #[derive(Default)]
    pub struct Writer {
        out: Vec<u8>,
    }

    impl Writer {
        /// Creates an empty writer.
        pub fn new() -> Self {
            Self::default()
        }

        /// Writer with preallocated capacity.
        pub fn with_capacity(cap: usize) -> Self {
            Self {
                out: Vec::with_capacity(cap),
            }
        }

        /// Appends one byte.
        pub fn u8(&mut self, v: u8) -> &mut Self {
            self.out.push(v);
            self
        }

        /// Appends a little-endian u16.
        pub fn u16(&mut self, v: u16) -> &mut Self {
            self.out.extend_from_slice(&v.to_le_bytes());
            self
        }

        /// Appends a little-endian u32.
        pub fn u32(&mut self, v: u32) -> &mut Self {
            self.out.extend_from_slice(&v.to_le_bytes());
            self
        }

        /// Appends a little-endian u64.
        pub fn u64(&mut self, v: u64) -> &mut Self {
            self.out.extend_from_slice(&v.to_le_bytes());
            self
        }

        /// Appends a u32 length prefix followed by the bytes.
        pub fn blob(&mut self, bytes: &[u8]) -> &mut Self {
            self.u32(bytes.len() as u32);
            self.out.extend_from_slice(bytes);
            self
        }

        /// Appends a presence byte and, when present, a blob.
        pub fn opt_blob(&mut self, bytes: Option<&[u8]>) -> &mut Self {
            match bytes {
                Some(b) => self.u8(1).blob(b),
                None => self.u8(0),
            }
        }

        /// Consumes the writer.
        pub fn finish(self) -> Vec<u8> {
            self.out
        }
    }

    /// Reads fields written by [`Writer`]; running short is corruption.
    pub struct Reader<'a> {
        src: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        /// Starts reading at the beginning of `src`.
        pub fn new(src: &'a [u8]) -> Self {
            Self { src, pos: 0 }
        }

        fn take(&mut self, len: usize) -> Result<&'a [u8]> {
            let end = self
                .pos
                .checked_add(len)
                .filter(|end| *end <= self.src.len())
                .ok_or_else(|| TesseraError::corrupt("record payload truncated"))?;
            let out = &self.src[self.pos..end];
            self.pos = end;
            Ok(out)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a little-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            Ok(super::le::get_u16(self.take(2)?))
        }

        /// Reads a little-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            Ok(super::le::get_u32(self.take(4)?))
        }

        /// Reads a little-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            Ok(super::le::get_u64(self.take(8)?))
        }

        /// Reads a length-prefixed blob.
        pub fn blob(&mut self) -> Result<Vec<u8>> {
            let len = self.u32()? as usize;
            Ok(self.take(len)?.to_vec())
        }

        /// Reads an optional blob written by [`Writer::opt_blob`].
        pub fn opt_blob(&mut self) -> Result<Option<Vec<u8>>> {
            match self.u8()? {
                0 => Ok(None),
                1 => self.blob().map(Some),
                other => Err(TesseraError::corrupt(format!(
                    "invalid presence byte {other}"
                ))),
            }
        }

        /// Bytes not yet consumed.
        pub fn remaining(&self) -> usize {
            self.src.len() - self.pos
        }
    }
}

#[cfg(test)]
mod tests {
    use super::buf::{Reader, Writer};
    use super::le;

    #[test]
    fn le_fields_are_little_endian() {
        let mut buf = [0u8; 8];
        le::put_u32(&mut buf, 0x0102_0304);
        assert_eq!(&buf[..4], &[4, 3, 2, 1]);
        assert_eq!(le::get_u32(&buf), 0x0102_0304);
    }

    #[test]
    fn reader_reports_truncation() {
        let mut w = Writer::new();
        w.u16(7).blob(b"abc").opt_blob(None);
        let bytes = w.finish();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.u16().unwrap(), 7);
        assert_eq!(r.blob().unwrap(), b"abc");
        assert_eq!(r.opt_blob().unwrap(), None);
        assert_eq!(r.remaining(), 0);

        let mut short = Reader::new(&bytes[..4]);
        short.u16().unwrap();
        assert!(short.blob().is_err());
    }
}

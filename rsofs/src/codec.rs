use std::{
	fs::File,
	io::{Read, Seek, SeekFrom, Write},
	path::Path,
};

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};

use crate::error::Result;

/// The backing file is anything seekable; production uses [`File`], tests
/// use in-memory cursors.
pub trait Backend: Read + Write + Seek {}

impl<T: Read + Write + Seek> Backend for T {}

/// On-disk integers are little-endian with fixed widths.
pub(crate) type Config = Configuration<LittleEndian, Fixint, NoLimit>;

pub(crate) const CONFIG: Config = bincode::config::standard()
	.with_fixed_int_encoding()
	.with_little_endian();

/// Typed positional I/O over a backing file.
pub struct Codec<B: Backend> {
	inner: B,
}

impl Codec<File> {
	pub fn open(path: &Path, rw: bool) -> Result<Self> {
		let file = File::options().read(true).write(rw).open(path)?;
		Ok(Self::new(file))
	}
}

impl<B: Backend> Codec<B> {
	pub fn new(inner: B) -> Self {
		Self {
			inner,
		}
	}

	pub fn inner(&self) -> &B {
		&self.inner
	}

	pub fn inner_mut(&mut self) -> &mut B {
		&mut self.inner
	}

	pub fn seek(&mut self, pos: u64) -> Result<()> {
		self.inner.seek(SeekFrom::Start(pos))?;
		Ok(())
	}

	pub fn decode<T: Decode<()>>(&mut self) -> Result<T> {
		Ok(bincode::decode_from_std_read(&mut self.inner, CONFIG)?)
	}

	pub fn encode<T: Encode>(&mut self, v: &T) -> Result<()> {
		bincode::encode_into_std_write(v, &mut self.inner, CONFIG)?;
		Ok(())
	}

	pub fn decode_at<T: Decode<()>>(&mut self, pos: u64) -> Result<T> {
		self.seek(pos)?;
		self.decode()
	}

	pub fn encode_at<T: Encode>(&mut self, pos: u64, v: &T) -> Result<()> {
		self.seek(pos)?;
		self.encode(v)
	}

	pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
		self.seek(pos)?;
		self.inner.read_exact(buf)?;
		Ok(())
	}

	pub fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
		self.seek(pos)?;
		self.inner.write_all(buf)?;
		Ok(())
	}

	/// Write `len` copies of `byte` starting at `pos`.
	pub fn fill_at(&mut self, pos: u64, byte: u8, len: usize) -> Result<()> {
		const CHUNK: usize = 4096;
		self.seek(pos)?;
		let chunk = [byte; CHUNK];
		let mut left = len;
		while left > 0 {
			let n = left.min(CHUNK);
			self.inner.write_all(&chunk[..n])?;
			left -= n;
		}
		Ok(())
	}

	pub fn flush(&mut self) -> Result<()> {
		self.inner.flush()?;
		Ok(())
	}
}

#[cfg(test)]
mod t {
	use std::io::Cursor;

	use super::*;

	#[test]
	fn roundtrip_at_offset() {
		let mut c = Codec::new(Cursor::new(vec![0u8; 4096]));
		c.encode_at(100, &0xDEAD_BEEFu32).unwrap();
		let v: u32 = c.decode_at(100).unwrap();
		assert_eq!(v, 0xDEAD_BEEF);

		// little-endian on disk
		let mut raw = [0u8; 4];
		c.read_at(100, &mut raw).unwrap();
		assert_eq!(raw, 0xDEAD_BEEFu32.to_le_bytes());
	}

	#[test]
	fn fill_spans_chunks() {
		let mut c = Codec::new(Cursor::new(vec![0u8; 16384]));
		c.fill_at(10, 0xAB, 9000).unwrap();
		let mut buf = vec![0u8; 9000];
		c.read_at(10, &mut buf).unwrap();
		assert!(buf.iter().all(|b| *b == 0xAB));
		let mut edge = [0u8; 1];
		c.read_at(9, &mut edge).unwrap();
		assert_eq!(edge[0], 0);
	}
}

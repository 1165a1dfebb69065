use super::{ClusterOp, Sofs};
use crate::{
	codec::Backend,
	data::*,
	error::{Error, Result},
};

impl<B: Backend> Sofs<B> {
	/// Read the target path stored in a symbolic link.
	#[doc(alias = "readlink")]
	pub fn symlink_read(&mut self, inr: u32) -> Result<String> {
		let ino = self.read_inode(inr, InodeStatus::InUse)?;
		if ino.kind() != Some(InodeKind::Symlink) {
			return Err(Error::InvalidMode);
		}

		let mut buf = vec![0u8; ino.size as usize];
		self.read_file(inr, 0, &mut buf)?;
		String::from_utf8(buf).map_err(|_| Error::InconsistentDirectory)
	}

	/// Store the target path of a symbolic link, replacing any previous
	/// one. The target must fit in a single cluster payload.
	#[doc(alias = "symlink")]
	pub fn symlink_write(&mut self, inr: u32, target: &str) -> Result<()> {
		log::trace!("symlink_write({inr}, {target:?});");
		if target.is_empty() || target.len() > BSLPC {
			return Err(Error::NameTooLong);
		}

		let mut ino = self.read_inode(inr, InodeStatus::InUse)?;
		if ino.kind() != Some(InodeKind::Symlink) {
			return Err(Error::InvalidMode);
		}

		if ino.size > 0 {
			self.handle_file_clusters(inr, 0, ClusterOp::FreeClean)?;
			ino = self.read_inode(inr, InodeStatus::InUse)?;
			ino.size = 0;
			self.write_inode(ino, inr, InodeStatus::InUse)?;
		}

		self.write_file(inr, 0, target.as_bytes())?;
		Ok(())
	}
}

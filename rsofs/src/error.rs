use std::{fmt, io};

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Every way a core operation can fail.
///
/// Consistency kinds are kept distinct so fsck and mount can report a
/// specific diagnostic; host adaptors collapse the enum to an errno via
/// [`Error::errno`].
#[derive(Debug)]
pub enum Error {
	/// Inode number out of range, or an operation aimed at inode 0.
	InvalidInode,
	/// Cluster number out of range, or an operation aimed at cluster 0.
	InvalidCluster,
	/// Unknown inode status requested.
	InvalidStatus,
	/// The mode word does not carry a legal file type.
	InvalidMode,
	/// Path does not start with '/'.
	NotAbsolutePath,
	/// A path component or entry name exceeds `MAX_NAME` bytes.
	NameTooLong,

	/// No free inode or no free data cluster.
	NoSpace,
	/// The file would exceed `MAX_FILE_CLUSTERS`.
	FileTooBig,
	/// The directory would exceed its maximum entry count.
	DirectoryFull,
	/// The reference count would overflow.
	TooManyLinks,

	/// No directory entry by that name.
	NotFound,
	/// A directory entry by that name already exists.
	AlreadyExists,
	/// The directory still has entries besides `.` and `..`.
	NotEmpty,
	/// A directory was required.
	NotADirectory,
	/// The target is a directory.
	IsADirectory,
	/// Too many symbolic-link expansions.
	Loop,

	/// Execute permission missing on a path component.
	ExecDenied,
	/// Read or write permission missing on the target.
	AccessDenied,

	/// The object is free when it was expected to be allocated.
	NotAllocated,
	/// The slot or object is already allocated.
	AlreadyAllocated,
	/// The inode still has directory references.
	RefsOutstanding,
	/// A cluster's owner stamp does not match the cleaning inode.
	WrongInodeStamp,

	/// The superblock failed header or arithmetic validation.
	InvalidSuperblock,
	/// An in-use inode fails its consistency predicate.
	InconsistentInodeInUse,
	/// A free-clean inode fails its consistency predicate.
	InconsistentFreeCleanInode,
	/// A free-dirty inode fails its consistency predicate.
	InconsistentFreeDirtyInode,
	/// A reference cluster carries an out-of-range reference.
	InconsistentRefList,
	/// A data-cluster header does not match its expected state.
	InconsistentClusterHeader,
	/// Directory payload is malformed.
	InconsistentDirectory,
	/// A cluster or inode is already a member of a free structure.
	AlreadyOnList,
	/// A cluster or inode is missing from every free structure.
	NotOnList,

	/// The backing device is not open.
	DeviceNotOpen,
	/// Lower-level I/O failure.
	Io(io::Error),
}

impl Error {
	/// The errno a POSIX host adaptor reports for this error.
	pub fn errno(&self) -> i32 {
		match self {
			Self::InvalidInode
			| Self::InvalidCluster
			| Self::InvalidStatus
			| Self::InvalidMode
			| Self::NotAbsolutePath => libc::EINVAL,
			Self::NameTooLong => libc::ENAMETOOLONG,
			Self::NoSpace => libc::ENOSPC,
			Self::FileTooBig => libc::EFBIG,
			Self::DirectoryFull => libc::ENOSPC,
			Self::TooManyLinks => libc::EMLINK,
			Self::NotFound => libc::ENOENT,
			Self::AlreadyExists => libc::EEXIST,
			Self::NotEmpty => libc::ENOTEMPTY,
			Self::NotADirectory => libc::ENOTDIR,
			Self::IsADirectory => libc::EISDIR,
			Self::Loop => libc::ELOOP,
			Self::ExecDenied => libc::EACCES,
			Self::AccessDenied => libc::EPERM,
			Self::NotAllocated
			| Self::AlreadyAllocated
			| Self::RefsOutstanding
			| Self::WrongInodeStamp
			| Self::InvalidSuperblock
			| Self::InconsistentInodeInUse
			| Self::InconsistentFreeCleanInode
			| Self::InconsistentFreeDirtyInode
			| Self::InconsistentRefList
			| Self::InconsistentClusterHeader
			| Self::InconsistentDirectory
			| Self::AlreadyOnList
			| Self::NotOnList => libc::EIO,
			Self::DeviceNotOpen => libc::EBADF,
			Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
		}
	}

	/// True for the consistency category, the jurisdiction of fsck.
	pub fn is_consistency(&self) -> bool {
		matches!(
			self,
			Self::InvalidSuperblock
				| Self::InconsistentInodeInUse
				| Self::InconsistentFreeCleanInode
				| Self::InconsistentFreeDirtyInode
				| Self::InconsistentRefList
				| Self::InconsistentClusterHeader
				| Self::InconsistentDirectory
				| Self::WrongInodeStamp
				| Self::AlreadyOnList
				| Self::NotOnList
		)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::InvalidInode => "invalid inode number",
			Self::InvalidCluster => "invalid cluster number",
			Self::InvalidStatus => "invalid inode status",
			Self::InvalidMode => "invalid mode",
			Self::NotAbsolutePath => "path is not absolute",
			Self::NameTooLong => "name too long",
			Self::NoSpace => "no space left on volume",
			Self::FileTooBig => "file too big",
			Self::DirectoryFull => "directory full",
			Self::TooManyLinks => "too many links",
			Self::NotFound => "no such entry",
			Self::AlreadyExists => "entry already exists",
			Self::NotEmpty => "directory not empty",
			Self::NotADirectory => "not a directory",
			Self::IsADirectory => "is a directory",
			Self::Loop => "too many levels of symbolic links",
			Self::ExecDenied => "execute permission denied",
			Self::AccessDenied => "access denied",
			Self::NotAllocated => "object is not allocated",
			Self::AlreadyAllocated => "object is already allocated",
			Self::RefsOutstanding => "inode still referenced",
			Self::WrongInodeStamp => "wrong inode stamp on cluster",
			Self::InvalidSuperblock => "invalid superblock",
			Self::InconsistentInodeInUse => "inconsistent in-use inode",
			Self::InconsistentFreeCleanInode => "inconsistent free clean inode",
			Self::InconsistentFreeDirtyInode => "inconsistent free dirty inode",
			Self::InconsistentRefList => "inconsistent reference list",
			Self::InconsistentClusterHeader => "inconsistent data-cluster header",
			Self::InconsistentDirectory => "inconsistent directory contents",
			Self::AlreadyOnList => "reference already on a free list",
			Self::NotOnList => "reference not on any free list",
			Self::DeviceNotOpen => "device not open",
			Self::Io(e) => return write!(f, "i/o error: {e}"),
		};
		f.write_str(s)
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Self::Io(e)
	}
}

impl From<bincode::error::DecodeError> for Error {
	fn from(e: bincode::error::DecodeError) -> Self {
		Self::Io(io::Error::new(io::ErrorKind::InvalidData, e))
	}
}

impl From<bincode::error::EncodeError> for Error {
	fn from(e: bincode::error::EncodeError) -> Self {
		Self::Io(io::Error::new(io::ErrorKind::InvalidData, e))
	}
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn errno_mapping() {
		assert_eq!(Error::NotFound.errno(), libc::ENOENT);
		assert_eq!(Error::ExecDenied.errno(), libc::EACCES);
		assert_eq!(Error::AccessDenied.errno(), libc::EPERM);
		assert_eq!(Error::InconsistentDirectory.errno(), libc::EIO);
	}

	#[test]
	fn consistency_category() {
		assert!(Error::WrongInodeStamp.is_consistency());
		assert!(!Error::NotFound.is_consistency());
	}
}

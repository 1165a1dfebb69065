//! Core library of SOFS11, a UNIX-style file system hosted inside a single
//! backing file treated as an array of fixed-size blocks.
//!
//! The on-disk layer is built as four ascending levels: the inode and
//! data-cluster allocators, inode read/write/clean and access checks, the
//! file-cluster reference trees, and directory entries. [`format`] builds a
//! fresh volume, [`check`] is the offline consistency pass, and [`Sofs`] is
//! a mounted volume exposing the operation surface host adaptors build on.

mod cache;
mod codec;
pub mod data;
mod error;
mod sofs;

pub use crate::{
	cache::Cache,
	codec::{Backend, Codec},
	data::{Cred, DirEntry, Inode, InodeKind, InodeStatus, Superblock},
	error::{Error, Result},
	sofs::{
		check, format, CheckOpts, CheckReport, ClusterOp, FormatOpts, Geometry, PathEntry, Sofs,
		Stats,
	},
};

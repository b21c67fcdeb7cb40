//! The union filesystem: QID identity, branch resolution, fid state and the
//! request handlers built on them.

pub mod fid;
pub mod file;
pub mod handlers;
pub mod hash;
pub mod nameset;
pub mod pivot;
pub mod qid;
pub mod union;

pub use fid::{DirSnapshot, Fid, ReadData};
pub use file::File;
pub use handlers::{UnionFs, Walked, DEFAULT_IOUNIT};
pub use nameset::NameSet;
pub use qid::{FileKey, QidLease, QidMap};
pub use union::{Branch, Union};

//! Static analysis and differential comparison toolkit for 16-bit
//! real-mode DOS executables in the MZ format.
//!
//! The crate recovers routine boundaries from machine code by following
//! control flow from a seed entrypoint, keeps the result in an editable
//! code map, and can compare a rebuilt executable against a reference
//! binary instruction by instruction, tolerating relocation and limited
//! layout differences. The `mzmap`, `mzdiff`, `mzsig`, `mzdup`, `mzhdr`
//! and `mzptr` binaries are thin drivers over this library.

pub mod addr;
pub mod analysis;
pub mod codemap;
pub mod error;
pub mod executable;
pub mod instruction;
pub mod memory;
pub mod modrm;
pub mod mz;
pub mod opcodes;
pub mod registers;
pub mod routine;
pub mod scanq;
pub mod signature;

pub use crate::error::{Error, Result};

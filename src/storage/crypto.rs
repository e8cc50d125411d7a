//! Encryption seam.
//!
//! Ciphers live outside this crate; uploads and downloads only need to wrap
//! a writer or reader.

use std::io::{Read, Write};

use crate::Result;

pub trait Crypter: Send + Sync {
    /// Wrap `sink` so that bytes written through the result are encrypted.
    /// The returned writer must be dropped (after flushing) to finalize.
    fn encrypt<'a>(&self, sink: Box<dyn Write + Send + 'a>) -> Result<Box<dyn Write + Send + 'a>>;

    /// Wrap `source` so that bytes read through the result are decrypted.
    fn decrypt<'a>(&self, source: Box<dyn Read + Send + 'a>) -> Result<Box<dyn Read + Send + 'a>>;
}

//! Compression codecs keyed by file extension.

use std::{
    fmt,
    io::{self, Read, Write},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub trait Compressor: Send + Sync {
    fn file_extension(&self) -> &'static str;

    /// Wrap `sink`; bytes written through the result come out compressed
    /// once [`CompressWriter::finish`] is called.
    fn encoder<W: Write>(&self, sink: W) -> Result<CompressWriter<W>>
    where
        Self: Sized;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>
    where
        Self: Sized,
    {
        let mut encoder = self.encoder(Vec::new())?;
        encoder.write_all(data)?;
        encoder.finish()
    }
}

pub trait Decompressor: Send + Sync {
    fn file_extension(&self) -> &'static str;

    /// Wrap `src`; reading the result yields decompressed bytes.
    fn decoder<'a>(&self, src: Box<dyn Read + Send + 'a>) -> Result<Box<dyn Read + Send + 'a>>;

    fn decompress(&self, src: &mut dyn Read) -> Result<Vec<u8>>
    where
        Self: Sized,
    {
        let mut bytes = Vec::new();
        src.read_to_end(&mut bytes)?;
        let mut out = Vec::new();
        self.decoder(Box::new(bytes.as_slice()))?
            .read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Streaming compressor. Dropping it without [`finish`](Self::finish)
/// leaves the output truncated.
pub enum CompressWriter<W: Write> {
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Zlib(flate2::write::ZlibEncoder<W>),
}

impl<W: Write> CompressWriter<W> {
    /// Write the stream trailer and hand back the sink.
    pub fn finish(self) -> Result<W> {
        match self {
            Self::Lz4(encoder) => Ok(encoder.finish()?),
            Self::Zstd(encoder) => Ok(encoder.finish()?),
            Self::Zlib(encoder) => Ok(encoder.finish()?),
        }
    }
}

impl<W: Write> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Lz4(encoder) => encoder.write(buf),
            Self::Zstd(encoder) => encoder.write(buf),
            Self::Zlib(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Lz4(encoder) => encoder.flush(),
            Self::Zstd(encoder) => encoder.flush(),
            Self::Zlib(encoder) => encoder.flush(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    Lz4,
    Zstd,
    Zlib,
}

impl CompressionMethod {
    pub const ALL: [CompressionMethod; 3] = [Self::Lz4, Self::Zstd, Self::Zlib];

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| Compressor::file_extension(m) == ext)
    }
}

impl FromStr for CompressionMethod {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "lz4" => Ok(Self::Lz4),
            "zstd" | "zstandard" | "zst" => Ok(Self::Zstd),
            "zlib" | "zz" => Ok(Self::Zlib),
            other => Err(Error::UnsupportedCompression(other.to_string()).into()),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
            Self::Zlib => "zlib",
        };
        f.write_str(name)
    }
}

impl Compressor for CompressionMethod {
    fn file_extension(&self) -> &'static str {
        match self {
            Self::Lz4 => "lz4",
            Self::Zstd => "zst",
            Self::Zlib => "zz",
        }
    }

    fn encoder<W: Write>(&self, sink: W) -> Result<CompressWriter<W>> {
        Ok(match self {
            Self::Lz4 => CompressWriter::Lz4(lz4_flex::frame::FrameEncoder::new(sink)),
            Self::Zstd => CompressWriter::Zstd(zstd::stream::write::Encoder::new(sink, 0)?),
            Self::Zlib => CompressWriter::Zlib(flate2::write::ZlibEncoder::new(
                sink,
                flate2::Compression::default(),
            )),
        })
    }
}

impl Decompressor for CompressionMethod {
    fn file_extension(&self) -> &'static str {
        Compressor::file_extension(self)
    }

    fn decoder<'a>(&self, src: Box<dyn Read + Send + 'a>) -> Result<Box<dyn Read + Send + 'a>> {
        Ok(match self {
            Self::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(src)),
            Self::Zstd => Box::new(zstd::stream::read::Decoder::new(src)?),
            Self::Zlib => Box::new(flate2::read::ZlibDecoder::new(src)),
        })
    }
}

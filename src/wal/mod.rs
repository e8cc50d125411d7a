//! Boundary with the WAL record decoder.
//!
//! Record decoding is pluggable: a [`WalDecoder`] turns raw WAL pages into
//! block locations and can resume a half-read record from saved bytes.
//! Everything here only moves pages and continuation state around.

use std::io::{self, Read};

use crate::{relfile::BlockLocation, Error, Result};

/// WAL page size (`XLOG_BLCKSZ`).
pub const WAL_PAGE_SIZE: usize = 8192;

/// Bytes of the record that was still being assembled when parsing stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserState {
    pub current_record: Vec<u8>,
}

impl ParserState {
    pub fn new(current_record: Vec<u8>) -> Self {
        Self { current_record }
    }

    /// Whether a record started before this point and continues after it.
    pub fn has_beginning(&self) -> bool {
        !self.current_record.is_empty()
    }
}

/// Result of feeding one WAL page to a parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Continuation bytes the parser could not attach to a record start it
    /// has seen (the tail of a record begun in an earlier segment).
    pub prev_record_tail: Vec<u8>,
    /// Locations touched by records completed on this page.
    pub locations: Vec<BlockLocation>,
}

impl ParsedPage {
    pub fn is_empty(&self) -> bool {
        self.prev_record_tail.is_empty() && self.locations.is_empty()
    }
}

/// Stateful page-at-a-time record parser.
pub trait WalRecordParser: Send {
    /// Parse one page. Returns [`Error::ZeroWalPage`] for an all-zero page;
    /// any other error leaves the parser unusable until invalidated.
    fn parse_records_from_page(&mut self, page: &[u8]) -> Result<ParsedPage>;

    /// Unfinished record bytes accumulated so far.
    fn current_record_data(&self) -> Vec<u8>;

    /// Drop any partial state after a parse failure.
    fn invalidate(&mut self);

    fn state(&self) -> ParserState {
        ParserState::new(self.current_record_data())
    }
}

/// Factory for parsers plus a decoder for reassembled records.
pub trait WalDecoder: Send + Sync {
    /// A parser resuming in the middle of the record held by `state`.
    fn parser(&self, state: ParserState) -> Box<dyn WalRecordParser>;

    /// Locations touched by one complete record given as raw bytes.
    fn record_locations(&self, record: &[u8]) -> Result<Vec<BlockLocation>>;
}

/// Splits a WAL stream into fixed-size pages. A short final page is
/// returned as is.
#[derive(Debug)]
pub struct WalPageReader<R> {
    inner: R,
}

impl<R: Read> WalPageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next page, or `None` at end of stream.
    pub fn read_page(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut page = vec![0u8; WAL_PAGE_SIZE];
        let mut filled = 0;
        while filled < WAL_PAGE_SIZE {
            match self.inner.read(&mut page[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        page.truncate(filled);
        Ok(Some(page))
    }
}

/// Parse every page of a WAL segment and collect block locations.
/// All-zero pages (the unused tail of a segment) are skipped.
pub fn extract_locations_from_wal<R: Read>(
    parser: &mut dyn WalRecordParser,
    wal: R,
) -> Result<Vec<BlockLocation>> {
    let mut pages = WalPageReader::new(wal);
    let mut locations = Vec::new();
    while let Some(page) = pages.read_page()? {
        match parser.parse_records_from_page(&page) {
            Ok(parsed) => locations.extend(parsed.locations),
            Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::ZeroWalPage)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(locations)
}

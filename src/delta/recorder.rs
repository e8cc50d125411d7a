//! Change recording while WAL segments are archived.

use std::{
    io::{self, Read},
    sync::Arc,
};

use tracing::warn;

use crate::{
    relfile::BlockLocation,
    wal::{ParserState, WalPageReader, WalRecordParser},
    Error, Result,
};

use super::{
    manager::{DeltaFileManager, DeltaFileWriter},
    names::{delta_filename_for, next_wal_filename, parse_wal_filename, WAL_FILE_IN_DELTA},
};

/// Sends decoded locations to the delta group's writer.
#[derive(Debug, Clone)]
pub struct WalDeltaRecorder {
    writer: Arc<DeltaFileWriter>,
}

impl WalDeltaRecorder {
    pub fn new(writer: Arc<DeltaFileWriter>) -> Self {
        Self { writer }
    }

    pub fn record(&self, locations: Vec<BlockLocation>) -> Result<()> {
        self.writer.send_all(locations)
    }
}

/// Stores the record fragments of one WAL segment in its group's part file.
#[derive(Debug, Clone)]
pub struct WalPartRecorder {
    wal_filename: String,
    manager: Arc<DeltaFileManager>,
}

impl WalPartRecorder {
    pub fn new(wal_filename: &str, manager: Arc<DeltaFileManager>) -> Result<Self> {
        parse_wal_filename(wal_filename)?;
        Ok(Self {
            wal_filename: wal_filename.to_string(),
            manager,
        })
    }

    fn position(&self) -> Result<usize> {
        Ok(parse_wal_filename(&self.wal_filename)?.1.position_in_delta())
    }

    /// Unfinished record at the end of this segment. The last segment of a
    /// group also hands it to the next group as its previous head.
    pub fn save_next_wal_head(&self, head: Vec<u8>) -> Result<()> {
        let position = self.position()?;
        if position == WAL_FILE_IN_DELTA as usize - 1 {
            let next_delta = delta_filename_for(&next_wal_filename(&self.wal_filename)?)?;
            let next_part = self.manager.part_file(&next_delta)?;
            next_part.lock().previous_head = Some(head.clone());
        }
        let delta_filename = delta_filename_for(&self.wal_filename)?;
        let part = self.manager.part_file(&delta_filename)?;
        part.lock().heads[position] = Some(head);
        Ok(())
    }

    /// Continuation bytes found at the start of this segment.
    pub fn save_previous_wal_tail(&self, tail: Vec<u8>) -> Result<()> {
        let position = self.position()?;
        let delta_filename = delta_filename_for(&self.wal_filename)?;
        let part = self.manager.part_file(&delta_filename)?;
        part.lock().tails[position] = Some(tail);
        Ok(())
    }

    pub fn cancel_recording_with_err(&self, err: &anyhow::Error) {
        warn!(
            wal_filename = %self.wal_filename,
            error = %format!("{err:#}"),
            "canceled wal delta recording"
        );
        self.manager.cancel_recording(&self.wal_filename);
    }
}

/// Pass-through reader over a WAL segment that records the block locations
/// of every record it sees. Recording failures cancel recording for the
/// segment; the bytes read are never affected.
pub struct WalDeltaRecordingReader<R> {
    pages: WalPageReader<R>,
    parser: Box<dyn WalRecordParser>,
    leftover: Vec<u8>,
    leftover_pos: usize,
    recorder: WalDeltaRecorder,
    part_recorder: WalPartRecorder,
    can_save_previous_tail: bool,
    recording: bool,
}

impl<R> std::fmt::Debug for WalDeltaRecordingReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalDeltaRecordingReader")
            .field("part_recorder", &self.part_recorder.wal_filename)
            .field("recording", &self.recording)
            .finish()
    }
}

impl<R: Read> WalDeltaRecordingReader<R> {
    pub fn new(wal: R, wal_filename: &str, manager: Arc<DeltaFileManager>) -> Result<Self> {
        let delta_filename = delta_filename_for(wal_filename)?;
        let writer = manager.delta_file_writer(&delta_filename)?;
        let parser = manager.decoder().parser(ParserState::default());
        let part_recorder = WalPartRecorder::new(wal_filename, manager)?;
        Ok(Self {
            pages: WalPageReader::new(wal),
            parser,
            leftover: Vec::new(),
            leftover_pos: 0,
            recorder: WalDeltaRecorder::new(writer),
            part_recorder,
            can_save_previous_tail: true,
            recording: true,
        })
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Save the record left unfinished at the end of the segment.
    pub fn close(self) -> Result<()> {
        if !self.recording {
            return Ok(());
        }
        let head = self.parser.current_record_data();
        if let Err(err) = self.part_recorder.save_next_wal_head(head) {
            warn!(error = %format!("{err:#}"), "failed to save next wal head after recording");
            return Err(err);
        }
        Ok(())
    }

    fn cancel(&mut self, err: &anyhow::Error) {
        if self.recording {
            self.recording = false;
            self.part_recorder.cancel_recording_with_err(err);
        }
    }

    fn record_page(&mut self, page: &[u8]) -> Result<()> {
        let parsed = match self.parser.parse_records_from_page(page) {
            Ok(parsed) => parsed,
            Err(err) if matches!(err.downcast_ref::<Error>(), Some(Error::ZeroWalPage)) => {
                return Ok(())
            }
            Err(err) => {
                self.parser.invalidate();
                return Err(err);
            }
        };
        if !parsed.is_empty() {
            if self.can_save_previous_tail {
                self.can_save_previous_tail = false;
                self.part_recorder
                    .save_previous_wal_tail(parsed.prev_record_tail)?;
            } else if !parsed.prev_record_tail.is_empty() {
                return Err(Error::CantDiscardWalData.into());
            }
        }
        self.recorder.record(parsed.locations)
    }
}

impl<R: Read> Read for WalDeltaRecordingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.leftover_pos >= self.leftover.len() {
            let page = match self.pages.read_page() {
                Ok(Some(page)) => page,
                Ok(None) => return Ok(0),
                Err(e) => {
                    let err = anyhow::Error::new(io::Error::new(e.kind(), e.to_string()));
                    self.cancel(&err);
                    return Err(e);
                }
            };
            if self.recording {
                if let Err(err) = self.record_page(&page) {
                    self.cancel(&err);
                }
            }
            self.leftover = page;
            self.leftover_pos = 0;
        }
        let n = (self.leftover.len() - self.leftover_pos).min(out.len());
        out[..n].copy_from_slice(&self.leftover[self.leftover_pos..self.leftover_pos + n]);
        self.leftover_pos += n;
        Ok(n)
    }
}

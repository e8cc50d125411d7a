//! WAL archiving with change recording, followed by delta map assembly
//! from the uploaded delta files and WAL segments.
//!
//! The WAL here uses a toy page format understood by [`ToyDecoder`]:
//! `[0xAB][u32 tail length][tail][records..][zero padding]`, where every
//! record is `[u32 length][length bytes of encoded block locations]` and a
//! record that does not fit is cut at the page end and continued as the
//! next page's tail. Each test segment is a single page.

use std::{io, sync::Arc};

use pgdelta::{
    delta::{
        load_delta_map, names::WAL_SEGMENT_SIZE, DeltaFile, DeltaFileManager, DeltaMap, DeltaNo,
        Lsn, WalDeltaRecordingReader, WalSegmentNo, WalSource,
    },
    relfile::BlockLocation,
    storage::{read_decompressed, CompressionMethod, Folder, FsFolder, MemoryFolder, Uploader},
    wal::{ParsedPage, ParserState, WalDecoder, WalRecordParser, WAL_PAGE_SIZE},
    Error,
};
use tempfile::tempdir;

const PAGE_MARKER: u8 = 0xAB;
const TIMELINE: u32 = 1;
const SEGMENTS: u64 = 17;
/// Archiving starts here, as if a base backup had just started.
const FIRST_ARCHIVED: u64 = 3;

fn u32_at(bytes: &[u8], pos: usize) -> usize {
    u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize
}

fn decode_record(record: &[u8]) -> pgdelta::Result<Vec<BlockLocation>> {
    if record.len() < 4 {
        return Err(Error::WalParse("record shorter than its length".into()).into());
    }
    let len = u32_at(record, 0);
    if record.len() != 4 + len || len % BlockLocation::ENCODED_LEN != 0 {
        return Err(Error::WalParse(format!("bad record of {} bytes", record.len())).into());
    }
    Ok(record[4..]
        .chunks_exact(BlockLocation::ENCODED_LEN)
        .map(|c| BlockLocation::from_bytes(c.try_into().unwrap()))
        .collect())
}

struct ToyParser {
    current: Vec<u8>,
}

impl WalRecordParser for ToyParser {
    fn parse_records_from_page(&mut self, page: &[u8]) -> pgdelta::Result<ParsedPage> {
        if page.iter().all(|b| *b == 0) {
            return Err(Error::ZeroWalPage.into());
        }
        if page.len() < 5 || page[0] != PAGE_MARKER {
            return Err(Error::WalParse("bad page marker".into()).into());
        }
        let mut pos = 5 + u32_at(page, 1);
        if pos > page.len() {
            return Err(Error::WalParse("tail past page end".into()).into());
        }
        let tail = &page[5..pos];

        let mut parsed = ParsedPage::default();
        if self.current.is_empty() {
            parsed.prev_record_tail = tail.to_vec();
        } else {
            self.current.extend_from_slice(tail);
            let record = std::mem::take(&mut self.current);
            parsed.locations.extend(decode_record(&record)?);
        }

        while pos + 4 <= page.len() {
            let len = u32_at(page, pos);
            if len == 0 {
                break;
            }
            let end = pos + 4 + len;
            if end > page.len() {
                self.current = page[pos..].to_vec();
                break;
            }
            parsed.locations.extend(decode_record(&page[pos..end])?);
            pos = end;
        }
        Ok(parsed)
    }

    fn current_record_data(&self) -> Vec<u8> {
        self.current.clone()
    }

    fn invalidate(&mut self) {
        self.current.clear();
    }
}

struct ToyDecoder;

impl WalDecoder for ToyDecoder {
    fn parser(&self, state: ParserState) -> Box<dyn WalRecordParser> {
        Box::new(ToyParser {
            current: state.current_record,
        })
    }

    fn record_locations(&self, record: &[u8]) -> pgdelta::Result<Vec<BlockLocation>> {
        decode_record(record)
    }
}

struct Record {
    locations: Vec<BlockLocation>,
    first_page: usize,
    last_page: usize,
}

struct ToyWal {
    pages: Vec<Vec<u8>>,
    records: Vec<Record>,
}

fn start_page(tail: &[u8]) -> Vec<u8> {
    let mut page = vec![PAGE_MARKER];
    page.extend_from_slice(&(tail.len() as u32).to_le_bytes());
    page.extend_from_slice(tail);
    page
}

fn finish_page(pages: &mut Vec<Vec<u8>>, mut page: Vec<u8>) {
    page.resize(WAL_PAGE_SIZE, 0);
    pages.push(page);
}

/// Lay records of 1 to 5 locations out over `page_count` pages; every page
/// boundary with enough room cuts a record in two.
fn toy_wal(page_count: usize) -> ToyWal {
    let mut pages = Vec::new();
    let mut records = Vec::new();
    let mut page = start_page(&[]);
    let mut block = 0u32;

    while pages.len() < page_count {
        let count = (block % 5 + 1) as usize;
        let locations: Vec<BlockLocation> = (0..count)
            .map(|i| BlockLocation::new(1663, 5, 100 + (block % 3), block * 8 + i as u32))
            .collect();
        block += 1;

        let mut record = ((count * BlockLocation::ENCODED_LEN) as u32).to_le_bytes().to_vec();
        for location in &locations {
            record.extend_from_slice(&location.to_bytes());
        }

        let room = WAL_PAGE_SIZE - page.len();
        let first_page = pages.len();
        if record.len() <= room {
            page.extend_from_slice(&record);
            records.push(Record {
                locations,
                first_page,
                last_page: first_page,
            });
            continue;
        }
        if pages.len() + 1 == page_count {
            finish_page(&mut pages, page);
            break;
        }
        if room < 4 {
            finish_page(&mut pages, page);
            page = start_page(&[]);
            page.extend_from_slice(&record);
            records.push(Record {
                locations,
                first_page: first_page + 1,
                last_page: first_page + 1,
            });
            continue;
        }
        page.extend_from_slice(&record[..room]);
        finish_page(&mut pages, page);
        page = start_page(&record[room..]);
        records.push(Record {
            locations,
            first_page,
            last_page: first_page + 1,
        });
    }
    ToyWal { pages, records }
}

impl ToyWal {
    fn segment(&self, segment: u64) -> &[u8] {
        &self.pages[segment as usize]
    }

    /// Changes of records lying entirely within `first..=last`.
    fn expected(&self, first: usize, last: usize) -> DeltaMap {
        self.records
            .iter()
            .filter(|r| r.first_page >= first && r.last_page <= last)
            .flat_map(|r| r.locations.iter().copied())
            .collect()
    }
}

fn segment_name(segment: u64) -> String {
    WalSegmentNo(segment).filename(TIMELINE)
}

fn new_manager(dir: &std::path::Path) -> Arc<DeltaFileManager> {
    let folder = FsFolder::new(dir).unwrap();
    Arc::new(DeltaFileManager::new(folder, Arc::new(ToyDecoder), 8))
}

/// Archive one segment the way the archive command would: stream it
/// through the recording reader and upload what was read.
fn archive_segment(
    manager: &Arc<DeltaFileManager>,
    uploader: &Uploader,
    wal: &ToyWal,
    segment: u64,
) -> pgdelta::Result<()> {
    let name = segment_name(segment);
    let source = wal.segment(segment);
    let mut reader = WalDeltaRecordingReader::new(source, &name, Arc::clone(manager))?;
    let mut archived = Vec::new();
    io::copy(&mut reader, &mut archived)?;
    assert_eq!(archived, source);
    assert!(reader.is_recording(), "recording of {name} was canceled");
    reader.close()?;
    uploader.upload(&name, &archived)?;
    Ok(())
}

#[test]
fn recorded_changes_match_wal_contents() -> pgdelta::Result<()> {
    let wal = toy_wal(SEGMENTS as usize);
    let local = tempdir()?;
    let remote = Arc::new(MemoryFolder::new());
    let uploader = Uploader::new(remote.clone(), Some(CompressionMethod::Lz4));

    // Two archiver runs, each flushing its recording state on exit.
    {
        let manager = new_manager(local.path());
        for segment in FIRST_ARCHIVED..10 {
            archive_segment(&manager, &uploader, &wal, segment)?;
        }
        let snapshot = manager.flush_files(&uploader);
        assert_eq!(snapshot.part_files_saved, 1);
        assert_eq!(snapshot.delta_files_saved, 1);
        assert_eq!(snapshot.delta_files_uploaded, 0);
    }
    {
        let manager = new_manager(local.path());
        for segment in 10..SEGMENTS {
            archive_segment(&manager, &uploader, &wal, segment)?;
        }
        let history = format!("{}.00000028.backup", segment_name(FIRST_ARCHIVED));
        assert!(manager.handle_backup_history_file(&history)?);
        assert!(!manager.handle_backup_history_file(&segment_name(5))?);

        let snapshot = manager.flush_files(&uploader);
        assert_eq!(snapshot.failures, 0);
        assert_eq!(snapshot.canceled, 0);
        assert_eq!(snapshot.part_files_completed, 1);
        assert_eq!(snapshot.delta_files_uploaded, 1);
        assert_eq!(snapshot.part_files_saved, 1);
        assert_eq!(snapshot.delta_files_saved, 1);
    }

    let group = DeltaNo(0).filename(TIMELINE);
    let delta = DeltaFile::load(&mut read_decompressed(remote.as_ref(), &group, None)?.as_slice())?;
    let recorded: DeltaMap = delta.locations.iter().copied().collect();
    assert_eq!(recorded, wal.expected(FIRST_ARCHIVED as usize, 15));
    let straddles_group_end = wal
        .records
        .iter()
        .any(|r| r.first_page == 15 && r.last_page == 16);
    assert_eq!(delta.has_beginning(), straddles_group_end);

    let source = WalSource::new(remote.as_ref(), &ToyDecoder, TIMELINE);
    let map = load_delta_map(
        &source,
        Lsn(FIRST_ARCHIVED * WAL_SEGMENT_SIZE + 40),
        Lsn(16 * WAL_SEGMENT_SIZE + 100),
    )?;
    assert_eq!(map, wal.expected(FIRST_ARCHIVED as usize, 16));
    Ok(())
}

#[test]
fn missing_first_delta_file_is_replayed_from_wal() -> pgdelta::Result<()> {
    let wal = toy_wal(8);
    let remote = Arc::new(MemoryFolder::new());
    let uploader = Uploader::new(remote.clone(), Some(CompressionMethod::Zstd));
    for segment in 3..6 {
        uploader.upload(&segment_name(segment), wal.segment(segment))?;
    }

    let source = WalSource::new(remote.as_ref(), &ToyDecoder, TIMELINE);
    let map = load_delta_map(
        &source,
        Lsn(3 * WAL_SEGMENT_SIZE),
        Lsn(5 * WAL_SEGMENT_SIZE + 1),
    )?;
    // Replay stops before the segment holding the end of the range.
    assert_eq!(map, wal.expected(3, 4));
    Ok(())
}

#[test]
fn corrupt_page_cancels_recording_but_not_archiving() -> pgdelta::Result<()> {
    let wal = toy_wal(SEGMENTS as usize);
    let local = tempdir()?;
    let remote = Arc::new(MemoryFolder::new());
    let uploader = Uploader::new(remote.clone(), None);
    let manager = new_manager(local.path());

    archive_segment(&manager, &uploader, &wal, 14)?;

    let name = segment_name(15);
    let mut corrupt = wal.segment(15).to_vec();
    corrupt[0] = 0x01;
    let mut reader = WalDeltaRecordingReader::new(corrupt.as_slice(), &name, Arc::clone(&manager))?;
    let mut archived = Vec::new();
    io::copy(&mut reader, &mut archived)?;
    assert_eq!(archived, corrupt);
    assert!(!reader.is_recording());
    reader.close()?;

    let snapshot = manager.flush_files(&uploader);
    assert_eq!(snapshot.canceled, 2);
    assert_eq!(snapshot.delta_files_uploaded, 0);
    assert_eq!(snapshot.part_files_saved, 0);
    assert_eq!(snapshot.delta_files_saved, 0);

    let canceled = manager.canceled_delta_files();
    assert!(canceled.contains(&DeltaNo(0).filename(TIMELINE)));
    assert!(canceled.contains(&DeltaNo(16).filename(TIMELINE)));
    assert_eq!(remote.list()?, vec![segment_name(14)]);
    assert!(manager.data_folder().list()?.is_empty());
    Ok(())
}

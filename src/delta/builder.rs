//! Build a [`DeltaMap`] for an LSN range from stored delta files and WAL.
//!
//! Complete groups come from their delta files. WAL segments after the last
//! complete group are replayed, resuming the parser from the continuation
//! state stored in the preceding delta file.

use std::io::Cursor;

use anyhow::Context;
use tracing::info;

use crate::{
    storage::{read_decompressed, Crypter, Folder},
    wal::{extract_locations_from_wal, ParserState, WalDecoder, WalRecordParser},
    Result,
};

use super::{
    file::DeltaFile,
    map::DeltaMap,
    names::{DeltaNo, Lsn, WalSegmentNo, WAL_FILE_IN_DELTA},
};

/// Where delta files and WAL segments are read from.
pub struct WalSource<'a> {
    pub folder: &'a dyn Folder,
    pub decoder: &'a dyn WalDecoder,
    pub crypter: Option<&'a dyn Crypter>,
    pub timeline: u32,
}

impl<'a> WalSource<'a> {
    pub fn new(folder: &'a dyn Folder, decoder: &'a dyn WalDecoder, timeline: u32) -> Self {
        Self {
            folder,
            decoder,
            crypter: None,
            timeline,
        }
    }

    fn delta_file(&self, delta_no: DeltaNo) -> Result<DeltaFile> {
        let name = delta_no.filename(self.timeline);
        let raw = read_decompressed(self.folder, &name, self.crypter)
            .with_context(|| format!("downloading delta file {name}"))?;
        DeltaFile::load(&mut raw.as_slice()).with_context(|| format!("loading delta file {name}"))
    }

    fn add_from_deltas(&self, map: &mut DeltaMap, first: DeltaNo, last: DeltaNo) -> Result<()> {
        let mut delta_no = first;
        while delta_no < last {
            let delta_file = self.delta_file(delta_no)?;
            map.add_locations(delta_file.locations);
            info!(delta = %delta_no.filename(self.timeline), "loaded delta file");
            delta_no = delta_no.next();
        }
        Ok(())
    }

    fn add_from_wals(
        &self,
        map: &mut DeltaMap,
        first: WalSegmentNo,
        last: WalSegmentNo,
        parser: &mut dyn WalRecordParser,
    ) -> Result<()> {
        let mut segment = first;
        while segment < last {
            let name = segment.filename(self.timeline);
            let raw = read_decompressed(self.folder, &name, self.crypter)
                .with_context(|| format!("downloading wal segment {name}"))?;
            let locations = extract_locations_from_wal(parser, Cursor::new(raw))
                .with_context(|| format!("extracting locations from wal segment {name}"))?;
            map.add_locations(locations);
            info!(segment = %name, "replayed wal segment");
            segment = segment.next();
        }
        Ok(())
    }
}

/// Changes made in `[first_used, first_not_used)`.
pub fn load_delta_map(source: &WalSource<'_>, first_used: Lsn, first_not_used: Lsn) -> Result<DeltaMap> {
    let first_used_segment = WalSegmentNo::from_lsn(first_used);
    let first_not_used_segment = WalSegmentNo::from_lsn(first_not_used);
    let first_used_delta = DeltaNo::from_lsn(first_used);
    let first_not_used_delta = DeltaNo::from_lsn(first_not_used);
    info!(
        timeline = source.timeline,
        first_used = %first_used,
        first_not_used = %first_not_used,
        first_delta = %first_used_delta.filename(source.timeline),
        last_delta = %first_not_used_delta.filename(source.timeline),
        "building delta map"
    );

    let mut map = DeltaMap::new();
    let mut parser = match source.delta_file(first_used_delta) {
        Ok(first) => {
            map.add_locations(first.locations);
            source.decoder.parser(first.parser_state)
        }
        Err(err) => {
            // Archiving can start mid-group; replay that group from WAL.
            info!(error = %format!("{err:#}"), "first delta file is missing, replaying wal");
            let mut last = first_used_delta.first_wal_segment_no().add(WAL_FILE_IN_DELTA);
            if last > first_not_used_segment {
                last = first_not_used_segment;
            }
            let mut parser = source.decoder.parser(ParserState::default());
            source
                .add_from_wals(&mut map, first_used_segment, last, parser.as_mut())
                .context("replaying first delta group")?;
            parser
        }
    };

    if first_used_delta == first_not_used_delta {
        return Ok(map);
    }

    if first_used_delta != first_not_used_delta.previous() {
        source
            .add_from_deltas(&mut map, first_used_delta.next(), first_not_used_delta.previous())
            .context("fetching locations from delta files")?;
        let last = source
            .delta_file(first_not_used_delta.previous())
            .context("downloading last delta file")?;
        map.add_locations(last.locations);
        parser = source.decoder.parser(last.parser_state);
    }

    // The group containing `first_not_used` has no delta file yet.
    let last_used_segment = WalSegmentNo::from_lsn(Lsn(first_not_used.0.saturating_sub(1)));
    source
        .add_from_wals(
            &mut map,
            first_not_used_delta.first_wal_segment_no(),
            last_used_segment.next(),
            parser.as_mut(),
        )
        .context("fetching locations from wal segments")?;
    Ok(map)
}

use std::{
    collections::HashSet,
    io::Read,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use pgdelta::{
    archive::{StorageTarBallMaker, TarBall, TarBallQueue},
    storage::{read_decompressed, CompressionMethod, Folder, MemoryFolder, Uploader},
    Error,
};
use tar::{Archive, Header};

/// Memory store with slow writes that tracks how many overlap.
#[derive(Default)]
struct SlowFolder {
    inner: MemoryFolder,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Folder for SlowFolder {
    fn exists(&self, path: &str) -> pgdelta::Result<bool> {
        self.inner.exists(path)
    }

    fn read(&self, path: &str) -> pgdelta::Result<Box<dyn Read + Send>> {
        self.inner.read(path)
    }

    fn write(&self, path: &str, content: &mut dyn Read) -> pgdelta::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(10));
        let written = self.inner.write(path, content);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        written
    }

    fn list(&self) -> pgdelta::Result<Vec<String>> {
        self.inner.list()
    }

    fn delete(&self, path: &str) -> pgdelta::Result<()> {
        self.inner.delete(path)
    }
}

fn queue(
    folder: Arc<MemoryFolder>,
    compression: Option<CompressionMethod>,
    threshold: u64,
    parallelism: usize,
) -> TarBallQueue {
    let uploader = Uploader::new(folder, compression);
    let maker = Arc::new(StorageTarBallMaker::new(uploader, "base_000/"));
    TarBallQueue::new(maker, threshold, parallelism, 1)
}

fn append(part: &mut dyn TarBall, name: &str, data: &[u8]) -> pgdelta::Result<u64> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o600);
    let mut contents = data;
    part.append(name, &mut header, &mut contents)
}

fn members(folder: &MemoryFolder, part: &str) -> Vec<(String, Vec<u8>)> {
    let bytes = read_decompressed(folder, part, None).unwrap();
    let mut archive = Archive::new(bytes.as_slice());
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (name, data)
        })
        .collect()
}

#[test]
fn queue_must_be_started_once() {
    let queue = queue(Arc::new(MemoryFolder::new()), None, 1024, 1);
    let err = queue.deque().err().unwrap();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::QueueNotStarted)));

    queue.start().unwrap();
    let err = queue.start().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::QueueAlreadyStarted)
    ));
}

#[test]
fn oversized_part_is_rotated() -> pgdelta::Result<()> {
    let folder = Arc::new(MemoryFolder::new());
    let queue = queue(folder.clone(), None, 10, 1);
    queue.start()?;

    let mut first = queue.deque()?;
    assert_eq!(first.name(), "base_000/part_001.tar");
    assert_eq!(append(first.as_mut(), "base/1/100", &[1u8; 20])?, 20);
    queue.check_size_and_enqueue_back(first)?;

    let mut second = queue.deque()?;
    assert_eq!(second.name(), "base_000/part_002.tar");
    append(second.as_mut(), "base/1/101", &[2u8; 5])?;
    queue.check_size_and_enqueue_back(second)?;

    let mut uploaded = queue.finish_queue()?;
    uploaded.sort();
    assert_eq!(
        uploaded,
        vec![
            "base_000/part_001.tar".to_string(),
            "base_000/part_002.tar".to_string()
        ]
    );
    assert_eq!(queue.closed_size(), 25);

    assert_eq!(
        members(&folder, "base_000/part_001.tar"),
        vec![("base/1/100".to_string(), vec![1u8; 20])]
    );
    assert_eq!(
        members(&folder, "base_000/part_002.tar"),
        vec![("base/1/101".to_string(), vec![2u8; 5])]
    );
    Ok(())
}

#[test]
fn small_part_stays_in_pool() -> pgdelta::Result<()> {
    let folder = Arc::new(MemoryFolder::new());
    let queue = queue(folder.clone(), None, 1024, 1);
    queue.start()?;

    for i in 0..3u8 {
        let mut part = queue.deque()?;
        append(part.as_mut(), &format!("global/{i}"), &[i; 8])?;
        queue.check_size_and_enqueue_back(part)?;
    }
    assert!(folder.is_empty());

    let uploaded = queue.finish_queue()?;
    assert_eq!(uploaded, vec!["base_000/part_001.tar".to_string()]);
    let names: Vec<String> = members(&folder, "base_000/part_001.tar")
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names, vec!["global/0", "global/1", "global/2"]);
    Ok(())
}

#[test]
fn unstarted_parts_are_not_uploaded() -> pgdelta::Result<()> {
    let folder = Arc::new(MemoryFolder::new());
    let queue = queue(folder.clone(), Some(CompressionMethod::Lz4), 1024, 3);
    queue.start()?;

    let mut part = queue.deque()?;
    append(part.as_mut(), "PG_VERSION", b"16\n")?;
    let name = part.name().to_string();
    queue.enqueue_back(part);

    let uploaded = queue.finish_queue()?;
    assert_eq!(uploaded, vec![name.clone()]);
    assert!(name.ends_with(".tar.lz4"));
    assert_eq!(folder.list()?, vec![name]);
    Ok(())
}

#[test]
fn finished_queue_rejects_writers() -> pgdelta::Result<()> {
    let queue = queue(Arc::new(MemoryFolder::new()), None, 1024, 2);
    queue.start()?;
    assert!(queue.finish_queue()?.is_empty());
    let err = queue.deque().err().unwrap();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::QueueNotStarted)));
    Ok(())
}

#[test]
fn writers_share_an_exhausted_pool() -> pgdelta::Result<()> {
    const WRITERS: usize = 4;
    const FILES_PER_WRITER: usize = 6;
    const POOL: usize = 2;
    const UPLOAD_QUEUE: usize = 1;

    let folder = Arc::new(SlowFolder::default());
    let uploader = Uploader::new(folder.clone(), None);
    let maker = Arc::new(StorageTarBallMaker::new(uploader, "base_000/"));
    let queue = Arc::new(TarBallQueue::new(maker, 10, POOL, UPLOAD_QUEUE));
    queue.start()?;

    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || -> pgdelta::Result<()> {
                for file in 0..FILES_PER_WRITER {
                    let mut part = queue.deque()?;
                    append(part.as_mut(), &format!("base/{writer}/{file}"), &[writer as u8; 20])?;
                    queue.check_size_and_enqueue_back(part)?;
                }
                Ok(())
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer panicked")?;
    }
    let uploaded = queue.finish_queue()?;

    // Every file pushes its part over the threshold.
    assert_eq!(uploaded.len(), WRITERS * FILES_PER_WRITER);
    let mut seen = HashSet::new();
    for part in &uploaded {
        let members = members(&folder.inner, part);
        assert_eq!(members.len(), 1, "{part}");
        for (name, data) in members {
            assert_eq!(data.len(), 20);
            assert!(seen.insert(name), "member packed twice");
        }
    }
    assert_eq!(seen.len(), WRITERS * FILES_PER_WRITER);
    assert_eq!(queue.closed_size(), (WRITERS * FILES_PER_WRITER * 20) as u64);

    // Each writer waits on at most one upload beyond the queue bound.
    let max = folder.max_in_flight.load(Ordering::SeqCst);
    assert!(max >= 1);
    assert!(max <= UPLOAD_QUEUE + WRITERS, "{max} uploads overlapped");
    assert_eq!(folder.in_flight.load(Ordering::SeqCst), 0);
    Ok(())
}

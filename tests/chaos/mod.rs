//! Chaos testing for treearchive
//!
//! Injects read failures, vanishing files, full devices and worker panics at
//! seeded random points and checks that every archive that is produced is
//! still consistent with its status trailer.

use ::treearchive::codec::select_codec;
use ::treearchive::supplier::{EntryStream, InputSupplier};
use ::treearchive::*;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::integration::{BackupTestHarness, FileGenerator};

/// Seeded source of chaos decisions
#[derive(Debug, Clone)]
pub struct ChaosEngine {
    state: u64,
}

impl ChaosEngine {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1,
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound.max(1)
    }

    pub fn chance(&mut self, percent: u64) -> bool {
        self.below(100) < percent
    }
}

/// What a [`ChaosCodec`] does to the entries it picks
#[derive(Debug, Clone)]
pub enum Fault {
    /// The entry's stream fails after a random number of bytes
    ReadError,
    /// The entry's source file is deleted just before it is written
    Vanish { source_root: PathBuf },
    /// Opening the entry panics
    Panic,
}

/// Codec wrapper that sabotages a random subset of entries
#[derive(Debug)]
pub struct ChaosCodec {
    inner: Arc<dyn Codec>,
    fault: Fault,
    percent: u64,
    seed: u64,
    sabotaged: Arc<Mutex<BTreeSet<String>>>,
}

impl ChaosCodec {
    pub fn new(inner: Arc<dyn Codec>, fault: Fault, percent: u64, seed: u64) -> Self {
        Self {
            inner,
            fault,
            percent,
            seed,
            sabotaged: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    pub fn sabotaged(&self) -> BTreeSet<String> {
        self.sabotaged.lock().clone()
    }
}

impl Codec for ChaosCodec {
    fn format(&self) -> ArchiveFormat {
        self.inner.format()
    }

    fn is_parallel(&self) -> bool {
        self.inner.is_parallel()
    }

    fn open_archive_stream(
        &self,
        sink: Box<dyn ArchiveSink>,
        ctx: &BackupContext,
        core_limit: usize,
    ) -> Result<Box<dyn ArchiveOutput>> {
        Ok(Box::new(ChaosOutput {
            inner: self.inner.open_archive_stream(sink, ctx, core_limit)?,
            fault: self.fault.clone(),
            percent: self.percent,
            engine: ChaosEngine::new(self.seed),
            sabotaged: Arc::clone(&self.sabotaged),
        }))
    }
}

struct ChaosOutput {
    inner: Box<dyn ArchiveOutput>,
    fault: Fault,
    percent: u64,
    engine: ChaosEngine,
    sabotaged: Arc<Mutex<BTreeSet<String>>>,
}

impl ArchiveOutput for ChaosOutput {
    fn write_entry(&mut self, supplier: Box<dyn InputSupplier>) -> Result<()> {
        let path = supplier.path().to_string();
        if path == STATUS_FILENAME || !self.engine.chance(self.percent) {
            return self.inner.write_entry(supplier);
        }

        self.sabotaged.lock().insert(path.clone());
        let supplier: Box<dyn InputSupplier> = match &self.fault {
            Fault::ReadError => Box::new(FlakySupplier {
                inner: supplier,
                fail_after: self.engine.below(64 * 1024),
            }),
            Fault::Vanish { source_root } => {
                fs::remove_file(source_root.join(&path))?;
                supplier
            }
            Fault::Panic => Box::new(PanickingSupplier { inner: supplier }),
        };
        self.inner.write_entry(supplier)
    }

    fn await_entries(&mut self) -> Result<Vec<ArchiveError>> {
        self.inner.await_entries()
    }

    fn finish(&mut self) -> Result<()> {
        self.inner.finish()
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

/// Supplier whose stream errors out before reaching its end
struct FlakySupplier {
    inner: Box<dyn InputSupplier>,
    fail_after: u64,
}

impl InputSupplier for FlakySupplier {
    fn path(&self) -> &str {
        self.inner.path()
    }

    fn open(&mut self) -> io::Result<EntryStream> {
        let stream = self.inner.open()?;
        // Stop short of the end so the content hash is never reported
        let budget = match stream.metadata.size {
            0 => 0,
            size => self.fail_after % size,
        };
        Ok(EntryStream {
            metadata: stream.metadata,
            reader: Box::new(FlakyReader {
                inner: stream.reader,
                budget,
            }),
        })
    }
}

struct FlakyReader {
    inner: Box<dyn Read + Send>,
    budget: u64,
}

impl Read for FlakyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.budget == 0 {
            return Err(io::Error::other("injected read failure"));
        }
        let limit = (buf.len() as u64).min(self.budget) as usize;
        match self.inner.read(&mut buf[..limit])? {
            0 => Err(io::Error::other("injected read failure at end of stream")),
            n => {
                self.budget -= n as u64;
                Ok(n)
            }
        }
    }
}

struct PanickingSupplier {
    inner: Box<dyn InputSupplier>,
}

impl InputSupplier for PanickingSupplier {
    fn path(&self) -> &str {
        self.inner.path()
    }

    fn open(&mut self) -> io::Result<EntryStream> {
        panic!("injected panic while opening {}", self.inner.path());
    }
}

/// Sink that reports a full device once `capacity` bytes were written
pub struct CappedSink {
    file: File,
    written: u64,
    capacity: u64,
}

impl CappedSink {
    pub fn opener(capacity: u64) -> SinkOpener {
        Arc::new(move |path: &Path| -> io::Result<Box<dyn ArchiveSink>> {
            let file = File::options().write(true).truncate(true).create(true).open(path)?;
            Ok(Box::new(CappedSink {
                file,
                written: 0,
                capacity,
            }))
        })
    }
}

impl Write for CappedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = self.capacity.saturating_sub(self.written);
        if room == 0 {
            return Err(io::Error::from(io::ErrorKind::StorageFull));
        }
        let n = self.file.write(&buf[..(buf.len() as u64).min(room) as usize])?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for CappedSink {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

struct ChaosHost {
    source: PathBuf,
    root: PathBuf,
}

impl Host for ChaosHost {
    fn source_dir(&self) -> PathBuf {
        self.source.clone()
    }

    fn backup_root(&self) -> PathBuf {
        self.root.clone()
    }

    fn suspend_persistence(&self) -> Result<()> {
        Ok(())
    }

    fn resume_persistence(&self) {}
}

fn chaos_context(source: &Path, root: &Path) -> BackupContext {
    BackupContext::builder()
        .initiator(ActionInitiator::Scheduled)
        .host(Arc::new(ChaosHost {
            source: source.to_path_buf(),
            root: root.to_path_buf(),
        }))
        .build()
        .unwrap()
}

fn populate(root: &Path, seed: u64, count: usize) -> usize {
    FileGenerator::new(seed).tree(root, count).len()
}

/// Archive `source` through `codec` and check the result against the faults
fn archive_with_faults(source: &Path, dest_dir: &Path, codec: Arc<ChaosCodec>, cores: usize) -> ArchiveReport {
    let format = codec.format();
    let dest = dest_dir.join(format!("chaos-{}-{}{}", format, cores, format.extension()));
    let ctx = chaos_context(source, dest_dir);
    ArchivePipeline::new(codec, Blacklist::empty())
        .create_archive(source, &dest, &ctx, cores)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_failures_are_contained() {
        let source = tempfile::TempDir::new().unwrap();
        let dest = tempfile::TempDir::new().unwrap();
        let total = populate(source.path(), 7, 60);

        for (seed, format) in ArchiveFormat::ALL.into_iter().enumerate() {
            for cores in [1, 3] {
                let codec = Arc::new(ChaosCodec::new(
                    select_codec(format, cores, false),
                    Fault::ReadError,
                    30,
                    seed as u64 + 100 * cores as u64,
                ));
                let report = archive_with_faults(source.path(), dest.path(), Arc::clone(&codec), cores);
                let sabotaged = codec.sabotaged();
                info!("{} x{}: {} entries sabotaged", format, cores, sabotaged.len());

                let broken: BTreeSet<String> = report.status.broken_files.keys().cloned().collect();
                assert_eq!(broken, sabotaged, "{} x{}", format, cores);
                assert_eq!(report.status.file_count, (total - sabotaged.len()) as u64);

                let verified = verify_archive(&report.archive, format).unwrap();
                assert!(verified.is_valid(), "{} x{}", format, cores);
            }
        }
    }

    #[test]
    fn test_vanishing_files_are_listed() {
        for format in [ArchiveFormat::Zip, ArchiveFormat::Bzip2, ArchiveFormat::Tar] {
            let source = tempfile::TempDir::new().unwrap();
            let dest = tempfile::TempDir::new().unwrap();
            let total = populate(source.path(), 21, 40);

            let codec = Arc::new(ChaosCodec::new(
                select_codec(format, 2, false),
                Fault::Vanish {
                    source_root: source.path().to_path_buf(),
                },
                25,
                3,
            ));
            let report = archive_with_faults(source.path(), dest.path(), Arc::clone(&codec), 2);

            let broken: BTreeSet<String> = report.status.broken_files.keys().cloned().collect();
            assert_eq!(broken, codec.sabotaged());
            assert_eq!(report.status.file_count as usize, total - broken.len());
            assert!(verify_archive(&report.archive, format).unwrap().is_valid());
        }
    }

    #[test]
    fn test_device_full_at_random_offsets() {
        let mut engine = ChaosEngine::new(0xD15C);
        let mut harness = BackupTestHarness::new();
        harness.files.tree(harness.source.path(), 30);

        for round in 0..10 {
            let format = ArchiveFormat::ALL[round % ArchiveFormat::ALL.len()];
            let capacity = engine.below(200 * 1024);
            let mut config = BackupTestHarness::config(format);
            config.compression_core_count_limit = 2;

            let comment = format!("full{}", round);
            let job = BackupJob::new(harness.context(ActionInitiator::InteractiveUser, Some(comment.as_str())), config)
                .with_sink_opener(CappedSink::opener(capacity))
                .with_available_cores(2);
            let archive = job.archive_path();

            match job.run() {
                Err(err) => {
                    assert!(err.is_known_issue(), "{} at {} bytes: {}", format, capacity, err);
                    assert!(!archive.exists(), "STRICT mode must remove {:?}", archive);
                }
                Ok(outcome) => {
                    // Small LZMA archives can fit under the cap
                    warn!("{} fit in {} bytes", format, capacity);
                    assert!(verify_archive(&outcome.report.archive, format).unwrap().is_valid());
                }
            }
            assert!(!harness.host.is_quiesced());
        }
    }

    #[test]
    fn test_worker_panic_fails_the_job() {
        let source = tempfile::TempDir::new().unwrap();
        let dest = tempfile::TempDir::new().unwrap();
        populate(source.path(), 5, 20);

        for format in [ArchiveFormat::Zip, ArchiveFormat::Tar] {
            let codec = Arc::new(ChaosCodec::new(select_codec(format, 2, false), Fault::Panic, 100, 1));
            let dest_file = dest.path().join(format!("panic{}", format.extension()));
            let ctx = chaos_context(source.path(), dest.path());

            let pipeline = ArchivePipeline::new(codec, Blacklist::empty());
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                pipeline.create_archive(source.path(), &dest_file, &ctx, 2)
            }));

            match result {
                // Parallel ZIP opens entries on its workers
                Ok(outcome) => {
                    let err = outcome.unwrap_err();
                    assert!(matches!(err, ArchiveError::Execution(_)), "{}", err);
                    assert!(!err.is_known_issue());
                }
                // TAR opens entries on the calling thread
                Err(_) => assert_eq!(format, ArchiveFormat::Tar),
            }
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_unreadable_files_are_listed() {
        use std::os::unix::fs::PermissionsExt;

        if nix::unistd::geteuid().is_root() {
            eprintln!("Skipping permission test as root");
            return;
        }

        let harness = BackupTestHarness::new();
        harness.write("ok.txt", b"fine");
        harness.write("locked/secret.txt", b"hidden");
        harness.write("denied.txt", b"nope");
        let source = harness.source.path();
        fs::set_permissions(source.join("denied.txt"), fs::Permissions::from_mode(0o000)).unwrap();
        fs::set_permissions(source.join("locked"), fs::Permissions::from_mode(0o000)).unwrap();

        let outcome = harness.run(BackupTestHarness::config(ArchiveFormat::Zip), "denied");
        fs::set_permissions(source.join("locked"), fs::Permissions::from_mode(0o755)).unwrap();
        let outcome = outcome.unwrap();

        let broken = &outcome.report.status.broken_files;
        assert!(broken.contains_key("denied.txt"));
        assert!(broken.contains_key("locked"));
        assert_eq!(outcome.report.status.file_count, 1);
        assert!(verify_archive(&outcome.report.archive, ArchiveFormat::Zip).unwrap().is_valid());
        assert_eq!(harness.notifier.errors.lock().len(), 2);
    }
}

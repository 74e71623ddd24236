//! External merge sort over variable-length byte records.
//!
//! Records accumulate in memory up to a bounded run size, get stable-sorted
//! and optionally merged, and spill to length-prefixed run files in a
//! private temp directory. Spilled runs cascade through level slots: two
//! runs meeting at a level are 2-way merged into the next, so at most
//! log₂(total / run size) runs exist at any time. A reader collapses the
//! survivors into one file and iterates it in order.
//!
//! The caller supplies the ordering; records comparing equal are merged (or
//! kept, in input order) by the optional merge function.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;

/// In-memory run size, in records.
const RUN_LIMIT: usize = 2048;

/// Level slots for spilled runs; level `i` holds a run of roughly
/// `RUN_LIMIT * 2^i` records, so 64 slots outlast any conceivable input.
const MAX_LEVELS: usize = 64;

/// Attempts at creating a private temp directory before giving up.
const MAX_DIR_RETRIES: u32 = 100;

pub type CompareFn = dyn Fn(&[u8], &[u8]) -> Ordering;

/// What to emit for two records that compare equal.
pub enum MergeOutcome {
    /// Keep the earlier record.
    KeepFirst,
    /// Keep the later record.
    KeepSecond,
    /// Keep whatever the merge function left in the pad.
    UsePad,
    /// Emit neither.
    Discard,
}

/// Collapse two equal records; `pad` is scratch space for [`MergeOutcome::UsePad`].
pub type MergeFn = dyn Fn(&[u8], &[u8], &mut Vec<u8>) -> MergeOutcome;

#[derive(Debug, thiserror::Error)]
pub enum SorterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A run file ended in the middle of a record.
    #[error("truncated record in run file")]
    TruncatedRecord,

    /// No private temp directory could be created.
    #[error("could not create a working directory")]
    TempDir,

    /// An earlier spill or merge failed; the sort is unusable.
    #[error("sorter poisoned by an earlier I/O failure")]
    Poisoned,
}

pub struct ExternalSorter {
    dir: PathBuf,
    /// Spilled run file ids by level; `None` slots are free.
    level_files: [Option<u64>; MAX_LEVELS],
    /// In-memory run, in insertion order.
    run: Vec<Vec<u8>>,
    next_file_id: u64,
    compare: Box<CompareFn>,
    merge: Option<Box<MergeFn>>,
    pad: Vec<u8>,
    poisoned: bool,
}

impl ExternalSorter {
    /// Create a sorter with the given ordering and optional merge of equal
    /// records. Allocates a private directory under the system temp path.
    pub fn new(
        compare: impl Fn(&[u8], &[u8]) -> Ordering + 'static,
        merge: Option<Box<MergeFn>>,
    ) -> Result<Self, SorterError> {
        let dir = create_working_dir()?;
        Ok(ExternalSorter {
            dir,
            level_files: [None; MAX_LEVELS],
            run: Vec::new(),
            next_file_id: 1,
            compare: Box::new(compare),
            merge,
            pad: Vec::new(),
            poisoned: false,
        })
    }

    /// Add one record. Spills a sorted run to disk when the in-memory run
    /// fills.
    pub fn add(&mut self, record: &[u8]) -> Result<(), SorterError> {
        if self.poisoned {
            return Err(SorterError::Poisoned);
        }
        self.run.push(record.to_vec());
        if self.run.len() == RUN_LIMIT {
            self.guard(Self::flush_run)?;
        }
        Ok(())
    }

    /// Collapse everything added so far into one sorted, merged sequence.
    /// The sorter remains usable; records added afterwards appear in the
    /// next reader.
    pub fn reader(&mut self) -> Result<SortReader, SorterError> {
        if self.poisoned {
            return Err(SorterError::Poisoned);
        }
        self.guard(|sorter| {
            sorter.flush_run()?;
            let mut last: Option<(u64, usize)> = None;
            for level in 0..MAX_LEVELS {
                let Some(id) = sorter.level_files[level].take() else {
                    continue;
                };
                last = Some(match last {
                    None => (id, level),
                    Some((prior, _)) => {
                        let merged = sorter.merge_files(id, prior)?;
                        sorter.unlink_file(id);
                        sorter.unlink_file(prior);
                        (merged, level)
                    }
                });
            }
            let file = match last {
                None => None,
                Some((id, level)) => {
                    // The collapsed run keeps a level slot (sized like the
                    // largest input run) so drop still cleans it up and
                    // later spills cascade into it normally.
                    sorter.level_files[level] = Some(id);
                    Some(BufReader::new(File::open(sorter.file_path(id))?))
                }
            };
            Ok(SortReader { file })
        })
    }

    fn guard<T>(
        &mut self,
        operation: impl FnOnce(&mut Self) -> Result<T, SorterError>,
    ) -> Result<T, SorterError> {
        match operation(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    fn file_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id:x}"))
    }

    fn unlink_file(&self, id: u64) {
        if let Err(err) = std::fs::remove_file(self.file_path(id)) {
            log::debug!("could not unlink run file {id:x}: {err}");
        }
    }

    /// Sort and merge the in-memory run, write it out, and cascade it
    /// through the level slots.
    fn flush_run(&mut self) -> Result<(), SorterError> {
        if self.run.is_empty() {
            return Ok(());
        }
        let mut records = std::mem::take(&mut self.run);
        // Stable, so equal records stay in insertion order for the merge.
        records.sort_by(|a, b| (self.compare)(a, b));

        if let Some(merge) = &self.merge {
            let mut output: Vec<Vec<u8>> = Vec::with_capacity(records.len());
            for record in records {
                let equal_to_last = output
                    .last()
                    .is_some_and(|last| (self.compare)(last, &record) == Ordering::Equal);
                if !equal_to_last {
                    output.push(record);
                    continue;
                }
                let last = output.last().expect("nonempty output");
                self.pad.clear();
                match merge(last, &record, &mut self.pad) {
                    MergeOutcome::KeepFirst => {}
                    MergeOutcome::KeepSecond => {
                        *output.last_mut().expect("nonempty output") = record;
                    }
                    MergeOutcome::UsePad => {
                        *output.last_mut().expect("nonempty output") =
                            std::mem::take(&mut self.pad);
                    }
                    MergeOutcome::Discard => {
                        output.pop();
                    }
                }
            }
            records = output;
            if records.is_empty() {
                return Ok(());
            }
        }

        let mut file_id = self.next_file_id;
        self.next_file_id += 1;
        {
            let mut writer = BufWriter::new(File::create(self.file_path(file_id))?);
            for record in &records {
                write_record(&mut writer, record)?;
            }
            writer.flush()?;
        }

        for level in 0..MAX_LEVELS {
            let Some(old_id) = self.level_files[level].take() else {
                self.level_files[level] = Some(file_id);
                return Ok(());
            };
            let merged = self.merge_files(old_id, file_id)?;
            self.unlink_file(old_id);
            self.unlink_file(file_id);
            file_id = merged;
        }
        // 2^64 records would be needed to get here.
        unreachable!("run cascade exceeded {MAX_LEVELS} levels");
    }

    /// 2-way merge of two sorted run files into a new one.
    fn merge_files(&mut self, a_id: u64, b_id: u64) -> Result<u64, SorterError> {
        let mut reader_a = BufReader::new(File::open(self.file_path(a_id))?);
        let mut reader_b = BufReader::new(File::open(self.file_path(b_id))?);
        let out_id = self.next_file_id;
        self.next_file_id += 1;
        let mut writer = BufWriter::new(File::create(self.file_path(out_id))?);

        let mut a = read_record(&mut reader_a)?;
        let mut b = read_record(&mut reader_b)?;
        while let (Some(a_rec), Some(b_rec)) = (&a, &b) {
            match (self.compare)(a_rec, b_rec) {
                Ordering::Less => {
                    write_record(&mut writer, a_rec)?;
                    a = read_record(&mut reader_a)?;
                }
                Ordering::Greater => {
                    write_record(&mut writer, b_rec)?;
                    b = read_record(&mut reader_b)?;
                }
                Ordering::Equal => {
                    match &self.merge {
                        None => {
                            write_record(&mut writer, a_rec)?;
                            write_record(&mut writer, b_rec)?;
                        }
                        Some(merge) => {
                            self.pad.clear();
                            match merge(a_rec, b_rec, &mut self.pad) {
                                MergeOutcome::KeepFirst => write_record(&mut writer, a_rec)?,
                                MergeOutcome::KeepSecond => write_record(&mut writer, b_rec)?,
                                MergeOutcome::UsePad => write_record(&mut writer, &self.pad)?,
                                MergeOutcome::Discard => {}
                            }
                        }
                    }
                    a = read_record(&mut reader_a)?;
                    b = read_record(&mut reader_b)?;
                }
            }
        }
        while let Some(record) = &a {
            write_record(&mut writer, record)?;
            a = read_record(&mut reader_a)?;
        }
        while let Some(record) = &b {
            write_record(&mut writer, record)?;
            b = read_record(&mut reader_b)?;
        }
        writer.flush()?;
        Ok(out_id)
    }
}

impl Drop for ExternalSorter {
    fn drop(&mut self) {
        for id in self.level_files.into_iter().flatten() {
            self.unlink_file(id);
        }
        if let Err(err) = std::fs::remove_dir(&self.dir) {
            log::debug!("could not remove sorter directory: {err}");
        }
    }
}

/// Iterator over the collapsed, sorted output of an [`ExternalSorter`].
///
/// The underlying file closes at end-of-iteration.
pub struct SortReader {
    file: Option<BufReader<File>>,
}

impl Iterator for SortReader {
    type Item = Result<Vec<u8>, SorterError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.file.as_mut()?;
        match read_record(reader) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.file = None;
                None
            }
            Err(err) => {
                self.file = None;
                Some(Err(err))
            }
        }
    }
}

/// Record framing: a host-byte-order `u32` length, then the bytes. End of
/// file on the length read means end of run; anywhere else it is a
/// truncated record.
fn read_record<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, SorterError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_ne_bytes(len_bytes) as usize;
    let mut record = vec![0u8; len];
    reader.read_exact(&mut record).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            SorterError::TruncatedRecord
        } else {
            SorterError::Io(err)
        }
    })?;
    Ok(Some(record))
}

fn write_record<W: Write>(writer: &mut W, record: &[u8]) -> Result<(), SorterError> {
    writer.write_all(&(record.len() as u32).to_ne_bytes())?;
    writer.write_all(record)?;
    Ok(())
}

/// Make a private working directory, mode 0755, named after the process so
/// stale ones are attributable.
fn create_working_dir() -> Result<PathBuf, SorterError> {
    use std::os::unix::fs::DirBuilderExt;
    let pid = std::process::id();
    for attempt in 1..MAX_DIR_RETRIES {
        let dir = std::env::temp_dir().join(format!("mainspring-idx-{pid}-{attempt:05}"));
        match std::fs::DirBuilder::new().mode(0o755).create(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(SorterError::TempDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn lexicographic() -> impl Fn(&[u8], &[u8]) -> Ordering {
        |a: &[u8], b: &[u8]| a.cmp(b)
    }

    fn discard_duplicates() -> Box<MergeFn> {
        Box::new(|_a, _b, _pad| MergeOutcome::KeepFirst)
    }

    fn collect(reader: SortReader) -> Vec<Vec<u8>> {
        reader.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn empty_sorter_yields_nothing() {
        let mut sorter = ExternalSorter::new(lexicographic(), None).unwrap();
        let reader = sorter.reader().unwrap();
        assert!(collect(reader).is_empty());
    }

    #[test]
    fn small_input_sorts_in_memory() {
        let mut sorter = ExternalSorter::new(lexicographic(), None).unwrap();
        for record in [&b"pear"[..], b"apple", b"quince", b"banana"] {
            sorter.add(record).unwrap();
        }
        let records = collect(sorter.reader().unwrap());
        assert_eq!(records, vec![b"apple".to_vec(), b"banana".to_vec(), b"pear".to_vec(), b"quince".to_vec()]);
    }

    #[test]
    fn duplicates_survive_without_merge() {
        let mut sorter = ExternalSorter::new(lexicographic(), None).unwrap();
        for record in [&b"b"[..], b"a", b"b", b"a"] {
            sorter.add(record).unwrap();
        }
        let records = collect(sorter.reader().unwrap());
        assert_eq!(records, vec![b"a".to_vec(), b"a".to_vec(), b"b".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn large_random_input_sorted_and_deduplicated() {
        let mut rng = rand::rng();
        let mut sorter = ExternalSorter::new(lexicographic(), Some(discard_duplicates())).unwrap();
        let mut expected: Vec<Vec<u8>> = Vec::new();
        for _ in 0..10_000 {
            let len = rng.random_range(0..=64);
            let record: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            sorter.add(&record).unwrap();
            expected.push(record);
        }
        expected.sort();
        expected.dedup();

        let records = collect(sorter.reader().unwrap());
        assert_eq!(records.len(), expected.len());
        assert_eq!(records, expected);
    }

    #[test]
    fn spilled_runs_merge_across_levels() {
        // Enough records for several spills, descending so every run is
        // fully reordered.
        let mut sorter = ExternalSorter::new(lexicographic(), None).unwrap();
        let total = RUN_LIMIT * 3 + 17;
        for i in (0..total).rev() {
            sorter.add(format!("{i:08}").as_bytes()).unwrap();
        }
        let records = collect(sorter.reader().unwrap());
        assert_eq!(records.len(), total);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record, format!("{i:08}").as_bytes());
        }
    }

    #[test]
    fn merge_can_synthesize_and_discard() {
        // Records are key:value; equal keys sum their values, zero sums
        // disappear.
        let compare = |a: &[u8], b: &[u8]| a.split(|&c| c == b':').next().cmp(&b.split(|&c| c == b':').next());
        let merge: Box<MergeFn> = Box::new(|a, b, pad| {
            let value = |r: &[u8]| -> i32 {
                std::str::from_utf8(r.split(|&c| c == b':').nth(1).unwrap())
                    .unwrap()
                    .parse()
                    .unwrap()
            };
            let key = a.split(|&c| c == b':').next().unwrap();
            let sum = value(a) + value(b);
            if sum == 0 {
                return MergeOutcome::Discard;
            }
            pad.extend_from_slice(key);
            pad.push(b':');
            pad.extend_from_slice(sum.to_string().as_bytes());
            MergeOutcome::UsePad
        });
        let mut sorter = ExternalSorter::new(compare, Some(merge)).unwrap();
        for record in [&b"b:2"[..], b"a:5", b"b:3", b"c:1", b"c:-1"] {
            sorter.add(record).unwrap();
        }
        let records = collect(sorter.reader().unwrap());
        assert_eq!(records, vec![b"a:5".to_vec(), b"b:5".to_vec()]);
    }

    #[test]
    fn stability_prefers_first_inserted_on_keepfirst() {
        // Same key, different payloads; KeepFirst must keep insertion order's
        // first record.
        let compare = |a: &[u8], b: &[u8]| a[0].cmp(&b[0]);
        let mut sorter = ExternalSorter::new(compare, Some(discard_duplicates())).unwrap();
        sorter.add(b"k-first").unwrap();
        sorter.add(b"k-second").unwrap();
        let records = collect(sorter.reader().unwrap());
        assert_eq!(records, vec![b"k-first".to_vec()]);
    }

    #[test]
    fn end_of_file_on_length_read_ends_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        let mut bytes = 5u32.to_ne_bytes().to_vec();
        bytes.extend_from_slice(b"hello");
        std::fs::write(&path, bytes).unwrap();

        let mut reader = BufReader::new(File::open(&path).unwrap());
        assert_eq!(read_record(&mut reader).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_record(&mut reader).unwrap(), None);
    }

    #[test]
    fn partial_record_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run");
        // The length prefix promises 8 bytes; only 3 follow.
        let mut bytes = 8u32.to_ne_bytes().to_vec();
        bytes.extend_from_slice(b"abc");
        std::fs::write(&path, bytes).unwrap();

        let mut reader = BufReader::new(File::open(&path).unwrap());
        assert!(matches!(
            read_record(&mut reader),
            Err(SorterError::TruncatedRecord)
        ));
    }

    #[test]
    fn working_directory_removed_on_drop() {
        let dir = {
            let mut sorter = ExternalSorter::new(lexicographic(), None).unwrap();
            for i in 0..(RUN_LIMIT + 1) {
                sorter.add(format!("{i}").as_bytes()).unwrap();
            }
            sorter.dir.clone()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn reader_reflects_records_added_after_previous_reader() {
        let mut sorter = ExternalSorter::new(lexicographic(), None).unwrap();
        sorter.add(b"m").unwrap();
        let first = collect(sorter.reader().unwrap());
        assert_eq!(first, vec![b"m".to_vec()]);
        sorter.add(b"a").unwrap();
        let second = collect(sorter.reader().unwrap());
        assert_eq!(second, vec![b"a".to_vec(), b"m".to_vec()]);
    }
}

//! Binary container for alignment records.
//!
//! Layout: the magic bytes, the aligner parameters (JSON text stored as a
//! byte vector), the list of alleles referenced by the records, the records
//! themselves, an end-of-records marker and an optional big-endian footer
//! with the number of processed reads. Everything except the magic and the
//! footer is bincode encoded.

use crate::error::{Error, Result};
use crate::parameters::AlignerParameters;
use crate::record::{AlignmentRecord, Hit};

use bincode::{Decode, Encode};
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use vdjlib::{Alignment, Allele, AlleleCatalog, GeneType, Locus, SequenceQuality};

pub const MAGIC: &[u8; 8] = b"VDJCAv01";

const MAX_ITEM_SIZE: usize = 1 << 30;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_ITEM_SIZE>()
}

#[derive(Encode, Decode, Debug, Clone)]
struct AlleleReference {
    name: String,
    gene_type: GeneType,
    locus: Locus,
}

#[derive(Encode, Decode, Debug)]
struct HitEntry {
    allele: u32, // Index into the allele list of the header
    score: f32,
    alignments: Vec<Option<Alignment>>,
}

#[derive(Encode, Decode, Debug)]
struct RecordEntry {
    read_id: u64,
    targets: Vec<SequenceQuality>,
    hits: Vec<(GeneType, Vec<HitEntry>)>,
}

pub struct AlignmentWriter<W: Write> {
    writer: W,
    allele_index: HashMap<String, u32>,
    header_written: bool,
    records_written: u64,
    processed_reads: Option<u64>,
}

impl AlignmentWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> AlignmentWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            allele_index: HashMap::new(),
            header_written: false,
            records_written: 0,
            processed_reads: None,
        }
    }

    fn encode<E: Encode>(&mut self, value: E) -> Result<()> {
        bincode::encode_into_std_write(value, &mut self.writer, config())
            .map_err(|e| Error::format(format!("cannot encode: {}", e)))?;
        Ok(())
    }

    /// Write the magic bytes, the parameters and the alleles records may refer to.
    pub fn write_header(&mut self, parameters: &AlignerParameters, alleles: &[Arc<Allele>]) -> Result<()> {
        if self.header_written {
            return Err(Error::format("header already written"));
        }
        self.writer.write_all(MAGIC)?;
        self.encode(parameters.to_json()?.into_bytes())?;

        let references = alleles
            .iter()
            .map(|a| AlleleReference {
                name: a.name().to_string(),
                gene_type: a.gene_type(),
                locus: a.locus(),
            })
            .collect::<Vec<_>>();
        self.allele_index = references
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i as u32))
            .collect();
        self.encode(references)?;
        self.header_written = true;
        Ok(())
    }

    pub fn write(&mut self, record: &AlignmentRecord) -> Result<()> {
        if !self.header_written {
            return Err(Error::format("records written before the header"));
        }
        let mut hits = Vec::new();
        for (gene_type, list) in record.all_hits() {
            let mut entries = Vec::with_capacity(list.len());
            for hit in list {
                let name = hit.allele().name();
                let allele = *self
                    .allele_index
                    .get(name)
                    .ok_or_else(|| Error::UnknownAllele(name.to_string()))?;
                entries.push(HitEntry {
                    allele,
                    score: hit.score(),
                    alignments: hit.alignments().to_vec(),
                });
            }
            hits.push((gene_type, entries));
        }
        let entry = RecordEntry {
            read_id: record.read_id(),
            targets: record.targets().to_vec(),
            hits,
        };
        self.encode(Some(entry))?;
        self.records_written += 1;
        Ok(())
    }

    /// Number of input reads, including those that produced no record.
    pub fn set_processed_reads(&mut self, n: u64) {
        self.processed_reads = Some(n);
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Terminate the record stream and write the footer.
    pub fn finish(mut self) -> Result<W> {
        let n = self.processed_reads.unwrap_or(self.records_written);
        self.encode(None::<RecordEntry>)?;
        self.writer.write_all(&n.to_be_bytes())?;
        self.writer.flush()?;
        debug!("Wrote {} records, {} processed reads", self.records_written, n);
        Ok(self.writer)
    }

    /// Terminate the record stream without a footer.
    pub fn close(mut self) -> Result<W> {
        self.encode(None::<RecordEntry>)?;
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Counts the bytes consumed from the underlying reader.
struct CountingReader<R> {
    inner: BufReader<R>,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

impl<R: Read> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.count += amt as u64;
        self.inner.consume(amt);
    }
}

struct Header {
    parameters: AlignerParameters,
    alleles: Vec<Arc<Allele>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Open,
    Finished,
    Failed,
}

/// Reads alignment records. The header is parsed on first access; alleles
/// are resolved through the catalog.
pub struct AlignmentReader<'a, R> {
    input: CountingReader<R>,
    size: Option<u64>,
    catalog: &'a AlleleCatalog,
    header: Option<Header>,
    state: State,
    counter: u64,
    number_of_reads: Option<u64>,
}

impl<'a> AlignmentReader<'a, File> {
    pub fn open<P: AsRef<Path>>(path: P, catalog: &'a AlleleCatalog) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self::new(file, catalog).with_size(size))
    }
}

impl<'a, R: Read> AlignmentReader<'a, R> {
    pub fn new(reader: R, catalog: &'a AlleleCatalog) -> Self {
        Self {
            input: CountingReader {
                inner: BufReader::new(reader),
                count: 0,
            },
            size: None,
            catalog,
            header: None,
            state: State::Open,
            counter: 0,
            number_of_reads: None,
        }
    }

    /// Total length of the input in bytes, used for progress reporting.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    fn fail(&mut self, msg: String) -> Error {
        self.state = State::Failed;
        Error::Format(msg)
    }

    fn decode<D: Decode<()>>(&mut self) -> std::result::Result<D, bincode::error::DecodeError> {
        bincode::decode_from_std_read(&mut self.input, config())
    }

    fn header(&mut self) -> Result<&Header> {
        if self.header.is_none() {
            let header = self.read_header().inspect_err(|_| self.state = State::Failed)?;
            self.header = Some(header);
        }
        self.header
            .as_ref()
            .ok_or_else(|| Error::format("missing header"))
    }

    fn read_header(&mut self) -> Result<Header> {
        let mut magic = [0u8; 8];
        if self.input.read_exact(&mut magic).is_err() || &magic != MAGIC {
            return Err(Error::format("Wrong file format"));
        }
        let json: Vec<u8> = self
            .decode()
            .map_err(|e| Error::format(format!("cannot read parameters: {}", e)))?;
        let json = String::from_utf8(json)
            .map_err(|e| Error::format(format!("cannot read parameters: {}", e)))?;
        let parameters = AlignerParameters::from_json(&json)
            .map_err(|e| Error::format(format!("cannot read parameters: {}", e)))?;

        let references: Vec<AlleleReference> = self
            .decode()
            .map_err(|e| Error::format(format!("cannot read allele list: {}", e)))?;
        let mut alleles = Vec::with_capacity(references.len());
        for r in references {
            let allele = self
                .catalog
                .resolve(&r.name)
                .ok_or_else(|| Error::UnknownAllele(r.name.clone()))?;
            if allele.gene_type() != r.gene_type || allele.locus() != r.locus {
                return Err(Error::format(format!(
                    "allele {} is {} {} in the file but {} {} in the library",
                    r.name,
                    r.locus,
                    r.gene_type,
                    allele.locus(),
                    allele.gene_type()
                )));
            }
            alleles.push(allele);
        }
        debug!("Read header with {} alleles", alleles.len());
        Ok(Header { parameters, alleles })
    }

    pub fn parameters(&mut self) -> Result<&AlignerParameters> {
        Ok(&self.header()?.parameters)
    }

    pub fn used_alleles(&mut self) -> Result<&[Arc<Allele>]> {
        Ok(&self.header()?.alleles)
    }

    /// Next record, or `None` at the end of the stream.
    pub fn next_record(&mut self) -> Result<Option<AlignmentRecord>> {
        if self.state != State::Open {
            return Ok(None);
        }
        self.header()?;

        if self.input.fill_buf()?.is_empty() {
            // Truncated after a complete record; the number of reads is unknown
            self.state = State::Finished;
            return Ok(None);
        }

        let entry: Option<RecordEntry> = match self.decode() {
            Ok(entry) => entry,
            Err(e) => return Err(self.fail(format!("corrupt record {}: {}", self.counter, e))),
        };
        match entry {
            None => {
                self.state = State::Finished;
                self.number_of_reads = self.read_footer()?;
                Ok(None)
            }
            Some(entry) => {
                let record = self.to_record(entry).inspect_err(|_| self.state = State::Failed)?;
                self.counter += 1;
                Ok(Some(record))
            }
        }
    }

    fn read_footer(&mut self) -> Result<Option<u64>> {
        let mut buf = [0u8; 8];
        match self.input.read_exact(&mut buf) {
            Ok(()) => Ok(Some(u64::from_be_bytes(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn to_record(&self, entry: RecordEntry) -> Result<AlignmentRecord> {
        let alleles = &self
            .header
            .as_ref()
            .ok_or_else(|| Error::format("missing header"))?
            .alleles;
        let targets = entry
            .targets
            .into_iter()
            .map(|t| SequenceQuality::new(t.sequence().to_vec(), t.quality().to_vec()))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(|e| Error::format(format!("record {}: {}", self.counter, e)))?;
        let hits = entry
            .hits
            .into_iter()
            .map(|(gene_type, list)| {
                let list = list
                    .into_iter()
                    .map(|h| {
                        let allele = alleles.get(h.allele as usize).ok_or_else(|| {
                            Error::format(format!("allele index {} out of range", h.allele))
                        })?;
                        if h.alignments.len() != targets.len() {
                            return Err(Error::format(format!(
                                "record {}: {} alignments for {} targets",
                                self.counter,
                                h.alignments.len(),
                                targets.len()
                            )));
                        }
                        let alignments = h
                            .alignments
                            .into_iter()
                            .zip(targets.iter())
                            .map(|(a, target)| {
                                a.map(|a| checked_alignment(a, allele, target)).transpose()
                            })
                            .collect::<Result<Vec<_>>>()?;
                        Ok(Hit::new(allele.clone(), alignments, h.score))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((gene_type, list))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(AlignmentRecord::new(entry.read_id, targets, hits)?.with_index(self.counter))
    }

    /// Number of processed reads stored in the footer. Known only once the
    /// end of the stream was reached and the footer was present.
    pub fn number_of_reads(&self) -> Option<u64> {
        self.number_of_reads
    }

    pub fn records_read(&self) -> u64 {
        self.counter
    }

    /// Fraction of the input consumed, NaN if the input size is unknown.
    pub fn progress(&self) -> f64 {
        if self.state == State::Finished {
            return 1.0;
        }
        match self.size {
            Some(size) if size > 0 => self.input.count as f64 / size as f64,
            _ => f64::NAN,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state != State::Open
    }
}

/// Rebuild a decoded alignment so the consistency checks of `Alignment::new`
/// apply, and bound it by the allele and the target.
fn checked_alignment(alignment: Alignment, allele: &Allele, target: &SequenceQuality) -> Result<Alignment> {
    let alignment = Alignment::new(
        alignment.reference_range(),
        alignment.target_range(),
        alignment.mutations().to_vec(),
        alignment.score(),
    )
    .map_err(|e| Error::format(e.to_string()))?;
    if alignment.reference_range().end as usize > allele.len() {
        return Err(Error::format(format!(
            "alignment {:?} exceeds allele {} of length {}",
            alignment.reference_range(),
            allele.name(),
            allele.len()
        )));
    }
    if alignment.target_range().end as usize > target.len() {
        return Err(Error::format(format!(
            "alignment {:?} exceeds target of length {}",
            alignment.target_range(),
            target.len()
        )));
    }
    Ok(alignment)
}

impl<R: Read> Iterator for AlignmentReader<'_, R> {
    type Item = Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::ops::Range;

    #[test]
    fn test_empty_stream() {
        let catalog = AlleleCatalog::new();
        let mut writer = AlignmentWriter::new(Vec::new());
        writer.write_header(&AlignerParameters::default(), &[]).unwrap();
        writer.set_processed_reads(12);
        let data = writer.finish().unwrap();
        assert_eq!(&data[..8], MAGIC);

        let mut reader = AlignmentReader::new(Cursor::new(&data), &catalog).with_size(data.len() as u64);
        assert!(reader.progress() < 1.0);
        assert_eq!(reader.parameters().unwrap(), &AlignerParameters::default());
        assert!(reader.next_record().unwrap().is_none());
        assert_eq!(reader.number_of_reads(), Some(12));
        assert_eq!(reader.progress(), 1.0);
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_wrong_magic() {
        let catalog = AlleleCatalog::new();
        let mut reader = AlignmentReader::new(Cursor::new(b"VDJCAv00........".to_vec()), &catalog);
        assert!(reader.progress().is_nan());
        assert!(matches!(reader.next_record(), Err(Error::Format(_))));
        assert!(reader.next().is_none());

        let mut reader = AlignmentReader::new(Cursor::new(b"VDJ".to_vec()), &catalog);
        assert!(matches!(reader.parameters(), Err(Error::Format(_))));
    }

    #[derive(Encode)]
    struct RawAlignment {
        reference_start: u32,
        reference_end: u32,
        target_start: u32,
        target_end: u32,
        mutations: Vec<vdjlib::Mutation>,
        score: f32,
    }

    #[derive(Encode)]
    struct RawHit {
        allele: u32,
        score: f32,
        alignments: Vec<Option<RawAlignment>>,
    }

    #[derive(Encode)]
    struct RawRecord {
        read_id: u64,
        targets: Vec<(Vec<u8>, Vec<u8>)>,
        hits: Vec<(GeneType, Vec<RawHit>)>,
    }

    fn raw_record(sequence: &[u8], quality: Vec<u8>, reference: Range<u32>, target: Range<u32>) -> RawRecord {
        let alignment = RawAlignment {
            reference_start: reference.start,
            reference_end: reference.end,
            target_start: target.start,
            target_end: target.end,
            mutations: Vec::new(),
            score: 40.0,
        };
        RawRecord {
            read_id: 3,
            targets: vec![(sequence.to_vec(), quality)],
            hits: vec![(
                GeneType::Variable,
                vec![RawHit { allele: 0, score: 40.0, alignments: vec![Some(alignment)] }],
            )],
        }
    }

    fn read_raw(record: RawRecord) -> (Result<Option<AlignmentRecord>>, Result<Option<AlignmentRecord>>) {
        let mut catalog = AlleleCatalog::new();
        let allele = catalog
            .insert(Allele::new("V1", GeneType::Variable, Locus::TRB, b"ACGTACGTAC"))
            .unwrap();
        let mut writer = AlignmentWriter::new(Vec::new());
        writer.write_header(&AlignerParameters::default(), &[allele]).unwrap();
        writer.encode(Some(record)).unwrap();
        let data = writer.finish().unwrap();

        let mut reader = AlignmentReader::new(Cursor::new(&data), &catalog);
        let first = reader.next_record();
        (first, reader.next_record())
    }

    #[test]
    fn test_decoded_records_are_validated() {
        let (first, _) = read_raw(raw_record(b"ACGTACGTAC", vec![30; 10], 0..10, 0..10));
        let record = first.unwrap().unwrap();
        assert_eq!(record.read_id(), 3);
        assert_eq!(record.targets()[0].quality().len(), 10);

        let corrupt = [
            // Fewer qualities than bases
            raw_record(b"ACGTACGTAC", vec![30, 30], 0..10, 0..10),
            // Alignment runs past the end of the target
            raw_record(b"ACGT", vec![30; 4], 0..10, 0..10),
            // Ranges disagree without mutations to explain it
            raw_record(b"ACGTACGTAC", vec![30; 10], 0..10, 0..8),
            // Alignment runs past the end of the allele
            raw_record(b"ACGTACGTACGT", vec![30; 12], 0..12, 0..12),
        ];
        for record in corrupt {
            let (first, second) = read_raw(record);
            assert!(matches!(first, Err(Error::Format(_))));
            assert!(matches!(second, Ok(None)));
        }
    }

    #[test]
    fn test_header_written_once() {
        let mut writer = AlignmentWriter::new(Vec::new());
        assert!(writer.write_header(&AlignerParameters::default(), &[]).is_ok());
        assert!(writer.write_header(&AlignerParameters::default(), &[]).is_err());
    }
}

use crate::error::{Error, Result};

use bstr::ByteSlice;
use noodles::fastq;
use std::io::BufRead;
use vdjlib::SequenceQuality;

/// A single-end read and its position in the input.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleRead {
    pub id: u64,
    pub name: String,
    pub sequence: SequenceQuality,
}

impl SingleRead {
    pub fn new(id: u64, sequence: SequenceQuality) -> Self {
        Self {
            id,
            name: String::new(),
            sequence,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairedRead {
    pub id: u64,
    pub name: String,
    pub mates: [SequenceQuality; 2],
}

impl PairedRead {
    pub fn new(id: u64, mate1: SequenceQuality, mate2: SequenceQuality) -> Self {
        Self {
            id,
            name: String::new(),
            mates: [mate1, mate2],
        }
    }

    pub fn mate1(&self) -> &SequenceQuality {
        &self.mates[0]
    }

    pub fn mate2(&self) -> &SequenceQuality {
        &self.mates[1]
    }
}

fn read_record<R: BufRead>(
    reader: &mut fastq::io::Reader<R>,
    record: &mut fastq::Record,
) -> Result<Option<(String, SequenceQuality)>> {
    if reader.read_record(record)? == 0 {
        return Ok(None);
    }
    let name = record.name().to_str_lossy().into_owned();
    Ok(Some((name, SequenceQuality::from_fastq(record)?)))
}

/// Single-end reads from a FASTQ stream, numbered from zero.
pub struct FastqReads<R> {
    reader: fastq::io::Reader<R>,
    buf: fastq::Record,
    next_id: u64,
}

impl<R: BufRead> FastqReads<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: fastq::io::Reader::new(reader),
            buf: fastq::Record::default(),
            next_id: 0,
        }
    }

    /// Number of reads returned so far.
    pub fn number_of_reads(&self) -> u64 {
        self.next_id
    }
}

impl<R: BufRead> Iterator for FastqReads<R> {
    type Item = Result<SingleRead>;

    fn next(&mut self) -> Option<Self::Item> {
        match read_record(&mut self.reader, &mut self.buf) {
            Ok(None) => None,
            Ok(Some((name, sequence))) => {
                let id = self.next_id;
                self.next_id += 1;
                Some(Ok(SingleRead { id, name, sequence }))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

/// Paired-end reads from two FASTQ streams read in lockstep.
pub struct PairedFastqReads<R1, R2> {
    reader1: fastq::io::Reader<R1>,
    reader2: fastq::io::Reader<R2>,
    buf1: fastq::Record,
    buf2: fastq::Record,
    next_id: u64,
}

impl<R1: BufRead, R2: BufRead> PairedFastqReads<R1, R2> {
    pub fn new(reader1: R1, reader2: R2) -> Self {
        Self {
            reader1: fastq::io::Reader::new(reader1),
            reader2: fastq::io::Reader::new(reader2),
            buf1: fastq::Record::default(),
            buf2: fastq::Record::default(),
            next_id: 0,
        }
    }

    pub fn number_of_reads(&self) -> u64 {
        self.next_id
    }

    fn read_pair(&mut self) -> Result<Option<PairedRead>> {
        let mate1 = read_record(&mut self.reader1, &mut self.buf1)?;
        let mate2 = read_record(&mut self.reader2, &mut self.buf2)?;
        match (mate1, mate2) {
            (None, None) => Ok(None),
            (Some((name, mate1)), Some((_, mate2))) => {
                let id = self.next_id;
                self.next_id += 1;
                Ok(Some(PairedRead {
                    id,
                    name,
                    mates: [mate1, mate2],
                }))
            }
            _ => Err(Error::format(format!(
                "paired FASTQ files have different numbers of records (after {} pairs)",
                self.next_id
            ))),
        }
    }
}

impl<R1: BufRead, R2: BufRead> Iterator for PairedFastqReads<R1, R2> {
    type Item = Result<PairedRead>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_pair().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fastq_reads() {
        let data = b"@r1\nACGT\n+\nIIII\n@r2\nGGCC\n+\n####\n";
        let reads = FastqReads::new(&data[..])
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[1].id, 1);
        assert_eq!(reads[1].name, "r2");
        assert_eq!(reads[1].sequence.quality(), &[2, 2, 2, 2]);
    }

    #[test]
    fn test_unbalanced_pairs() {
        let r1 = b"@r1\nACGT\n+\nIIII\n@r2\nGGCC\n+\n####\n";
        let r2 = b"@r1\nTTTT\n+\nIIII\n";
        let mut reads = PairedFastqReads::new(&r1[..], &r2[..]);
        let first = reads.next().unwrap().unwrap();
        assert_eq!(first.mate2().sequence(), b"TTTT");
        assert!(matches!(reads.next(), Some(Err(Error::Format(_)))));
    }
}

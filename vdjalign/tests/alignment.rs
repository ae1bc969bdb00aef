use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use vdjalign::{
    override_parameters, AlignerBuilder, AlignerParameters, AlignerReport, AlignmentPipeline,
    AlignmentReader, AlignmentRecord, AlignmentWriter, Error, FastqReads, PairedFastqReads,
    PairedRead, ParallelDispatcher, ParameterPresets, VdjcAligner,
};
use vdjlib::{
    rev_compl, Allele, AlleleCatalog, GeneFeature, GeneType, Locus, ReferencePoint,
    SequenceQuality,
};

const V1: &[u8] = b"GCTAAAGACAATTACATAACATACACGTCAGCACGAAACTTGTTGGCCCAGTGTGAATCG";
const V2: &[u8] = b"CTTAAGGGTTAAGTAAGTGTGATGCATACGCCTTTACTTGCTGTGTCCACCCCATCGGAC";
const J1: &[u8] = b"TGGCATTTTTATTACACTCAGAAACAGAACTCGGGT";
const J2: &[u8] = b"AATTTTGACAGGTCACGCAGAGGCGCGCCCTCCTGA";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// V1, a four base insertion and J1.
fn molecule() -> Vec<u8> {
    [V1, b"GGAT".as_slice(), J1].concat()
}

fn catalog() -> AlleleCatalog {
    let v = |name: &str, seq: &[u8]| {
        Allele::new(name, GeneType::Variable, Locus::TRB, seq)
            .with_anchor(ReferencePoint::FR1Begin, 0)
            .and_then(|a| a.with_anchor(ReferencePoint::CDR3Begin, 48))
            .and_then(|a| a.with_anchor(ReferencePoint::VEnd, 60))
            .unwrap()
    };
    let j = |name: &str, seq: &[u8]| {
        Allele::new(name, GeneType::Joining, Locus::TRB, seq)
            .with_anchor(ReferencePoint::JBegin, 0)
            .and_then(|a| a.with_anchor(ReferencePoint::CDR3End, 9))
            .and_then(|a| a.with_anchor(ReferencePoint::FR4End, 36))
            .unwrap()
    };
    AlleleCatalog::try_from(vec![
        v("TRBV1*01", V1),
        v("TRBV2*01", V2),
        j("TRBJ1*01", J1),
        j("TRBJ2*01", J2),
    ])
    .unwrap()
}

fn builder(catalog: &AlleleCatalog) -> AlignerBuilder {
    let mut builder = AlignerBuilder::new(AlignerParameters::default());
    assert_eq!(builder.register_from_catalog(catalog).unwrap(), 4);
    builder
}

fn seq(s: &[u8]) -> SequenceQuality {
    SequenceQuality::with_uniform_quality(s, 30)
}

fn fastq(reads: &[&[u8]]) -> Vec<u8> {
    let mut data = Vec::new();
    for (i, r) in reads.iter().enumerate() {
        data.extend_from_slice(format!("@read{}\n", i).as_bytes());
        data.extend_from_slice(r);
        data.extend_from_slice(b"\n+\n");
        data.extend(std::iter::repeat(b'?').take(r.len()));
        data.push(b'\n');
    }
    data
}

#[test]
fn test_single_end_features() {
    init();
    let catalog = catalog();
    let aligner = builder(&catalog).build_single().unwrap();
    let record = aligner.align(0, &seq(&molecule())).record.unwrap();

    assert_eq!(record.number_of_targets(), 1);
    let v = record.best_hit(GeneType::Variable).unwrap();
    assert_eq!(v.allele().name(), "TRBV1*01");
    assert_eq!(v.score(), 300.0);
    assert_eq!(record.hits(GeneType::Variable).len(), 1);
    let j = record.best_hit(GeneType::Joining).unwrap();
    assert_eq!(j.allele().name(), "TRBJ1*01");
    assert_eq!(j.alignment(0).unwrap().target_range(), 64..100);
    assert!(record.best_hit(GeneType::Diversity).is_none());

    assert_eq!(
        record.feature(&GeneFeature::CDR3).unwrap().sequence(),
        b"CAGTGTGAATCGGGATTGGCATTTT"
    );
    assert_eq!(record.feature(&GeneFeature::VJ_JUNCTION).unwrap().sequence(), b"GGAT");
    assert_eq!(
        record.relative_range(&GeneFeature::CDR3, &GeneFeature::VJ_JUNCTION),
        Some(12..16)
    );
    assert!(record.feature(&GeneFeature::CDR1).is_none());
}

#[test]
fn test_merging_policy() {
    init();
    let catalog = catalog();
    let report = Arc::new(AlignerReport::new());
    let aligner = builder(&catalog)
        .with_listener(report.clone())
        .build_merging()
        .unwrap();
    let mol = molecule();

    // 20 bases of overlap
    let read = PairedRead::new(0, seq(&mol[..60]), seq(&rev_compl(&mol[40..])));
    let record = aligner.process(&read).record.unwrap();
    assert_eq!(record.number_of_targets(), 1);
    assert_eq!(record.target(0).sequence(), mol.as_slice());
    assert_eq!(record.target(0).quality()[45], 60);
    assert_eq!(record.target(0).quality()[0], 30);

    // No overlap: both mates are kept
    let read = PairedRead::new(1, seq(&mol[..50]), seq(&rev_compl(&mol[55..])));
    let record = aligner.process(&read).record.unwrap();
    assert_eq!(record.number_of_targets(), 2);
    assert_eq!(record.target(1).sequence(), &mol[55..]);
    let v = record.best_hit(GeneType::Variable).unwrap();
    assert!(v.alignment(0).is_some() && v.alignment(1).is_none());
    let j = record.best_hit(GeneType::Joining).unwrap();
    assert_eq!(j.alignment(1).unwrap().target_range(), 9..45);

    let read = PairedRead::new(2, seq(&[b'N'; 60]), seq(&[b'N'; 60]));
    assert!(aligner.process(&read).record.is_none());

    assert_eq!(report.total(), 3);
    assert_eq!(report.aligned(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.overlapped(), 2);
    assert_eq!(report.with_hits(GeneType::Joining), 2);
    let metrics = report.metrics();
    assert_eq!(metrics["frac_paired_alignments"], 1.0 / 3.0);
}

#[test]
fn test_straddling_feature() {
    init();
    let catalog = catalog();
    let aligner = builder(&catalog).build_paired().unwrap();
    let mol = molecule();

    // Mates share 6 bases of V, too few to merge. CDR3 begins on mate 1 and
    // ends on mate 2.
    let read = PairedRead::new(0, seq(&mol[..56]), seq(&rev_compl(&mol[50..])));
    let record = aligner.process(&read).record.unwrap();
    assert_eq!(record.number_of_targets(), 2);
    let v = record.best_hit(GeneType::Variable).unwrap();
    assert_eq!(v.score(), 330.0);
    assert_eq!(v.alignment(1).unwrap().reference_range(), 50..60);

    let p0 = record.partitioned_target(0).unwrap();
    let p1 = record.partitioned_target(1).unwrap();
    assert_eq!(p0.position(ReferencePoint::CDR3Begin), Some(48));
    assert_eq!(p0.position(ReferencePoint::CDR3End), None);
    assert_eq!(p1.position(ReferencePoint::CDR3Begin), None);
    assert_eq!(p1.position(ReferencePoint::CDR3End), Some(23));

    let cdr3 = record.feature(&GeneFeature::CDR3).unwrap();
    assert_eq!(cdr3.sequence(), &mol[48..73]);
    assert_eq!(cdr3.len(), 25);
    assert!(record.relative_range(&GeneFeature::CDR3, &GeneFeature::VJ_JUNCTION).is_none());
}

#[test]
fn test_builder_validation() {
    let catalog = catalog();
    let mut parameters = AlignerParameters::default();
    parameters.j_parameters = None;
    let mut builder = AlignerBuilder::new(parameters);
    builder.register_from_catalog(&catalog).unwrap();
    assert!(matches!(builder.build_single(), Err(Error::Configuration(_))));

    // Alleles of other loci are not registered
    let parameters = override_parameters(&AlignerParameters::default(), &["loci=TRA"]).unwrap();
    let mut builder = AlignerBuilder::new(parameters);
    assert_eq!(builder.register_from_catalog(&catalog).unwrap(), 0);
    assert!(matches!(builder.build_single(), Err(Error::Configuration(_))));
}

fn run_single_end(catalog: &AlleleCatalog, reads: &[&[u8]]) -> Vec<u8> {
    let aligner = Arc::new(builder(catalog).build_single().unwrap());
    let input = FastqReads::new(Cursor::new(fastq(reads)));
    let (summary, data) = AlignmentPipeline::new()
        .with_threads(2)
        .with_batch_size(1)
        .run(aligner, input, AlignmentWriter::new(Vec::new()))
        .unwrap();
    assert_eq!(summary.processed_reads, reads.len() as u64);
    data
}

#[test]
fn test_pipeline_round_trip() {
    init();
    let catalog = catalog();
    let mol2 = [V2, b"CC".as_slice(), J2].concat();
    let reads: [&[u8]; 3] = [&molecule(), &[b'N'; 80], &mol2];
    let data = run_single_end(&catalog, &reads);

    let aligner = builder(&catalog).build_single().unwrap();
    let expected = [0u64, 2]
        .iter()
        .map(|i| aligner.align(*i, &seq(reads[*i as usize])).record.unwrap())
        .collect::<Vec<_>>();

    let mut reader = AlignmentReader::new(Cursor::new(&data), &catalog).with_size(data.len() as u64);
    assert_eq!(reader.used_alleles().unwrap().len(), 4);
    assert_eq!(reader.parameters().unwrap(), &AlignerParameters::default());
    let records = reader.by_ref().collect::<Result<Vec<AlignmentRecord>, _>>().unwrap();
    assert_eq!(records, expected);
    assert_eq!(records[1].read_id(), 2);
    assert_eq!(records[1].index(), Some(1));
    assert_eq!(records[1].best_hit(GeneType::Variable).unwrap().allele().name(), "TRBV2*01");
    assert_eq!(reader.number_of_reads(), Some(3));
    assert_eq!(reader.progress(), 1.0);
    assert!(reader.is_finished());

    // Alleles are shared with the catalog
    let allele = records[0].best_hit(GeneType::Joining).unwrap().allele();
    assert!(Arc::ptr_eq(allele, &catalog.resolve("TRBJ1*01").unwrap()));
}

#[test]
fn test_paired_pipeline_with_limit() {
    init();
    let catalog = catalog();
    let mol = molecule();
    let mate2 = rev_compl(&mol[40..]);
    let r1 = fastq(&[&mol[..60], &mol[..60], &mol[..60]]);
    let r2 = fastq(&[&mate2, &mate2, &mate2]);

    let aligner = builder(&catalog).build_paired_end(true).unwrap();
    let input = PairedFastqReads::new(Cursor::new(r1), Cursor::new(r2));
    let (summary, data) = AlignmentPipeline::new()
        .with_limit(2)
        .run(aligner, input, AlignmentWriter::new(Vec::new()))
        .unwrap();
    assert_eq!(summary.processed_reads, 2);
    assert_eq!(summary.records_written, 2);

    let mut reader = AlignmentReader::new(Cursor::new(&data), &catalog);
    let records = reader.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.number_of_targets() == 1));
    assert_eq!(reader.number_of_reads(), Some(2));
}

#[test]
fn test_closed_stream() {
    let catalog = catalog();
    let aligner = builder(&catalog).build_single().unwrap();
    let record = aligner.align(0, &seq(&molecule())).record.unwrap();

    let mut writer = AlignmentWriter::new(Vec::new());
    writer.write_header(aligner.parameters(), &aligner.used_alleles()).unwrap();
    writer.write(&record).unwrap();
    writer.write(&record).unwrap();
    let data = writer.close().unwrap();

    let mut reader = AlignmentReader::new(Cursor::new(&data), &catalog);
    assert_eq!(reader.by_ref().filter_map(Result::ok).count(), 2);
    assert_eq!(reader.records_read(), 2);
    assert_eq!(reader.number_of_reads(), None);
}

#[test]
fn test_truncated_record() {
    let catalog = catalog();
    let aligner = builder(&catalog).build_single().unwrap();
    let record = aligner.align(0, &seq(&molecule())).record.unwrap();
    let header = |writer: &mut AlignmentWriter<Vec<u8>>| {
        writer.write_header(aligner.parameters(), &aligner.used_alleles()).unwrap();
    };

    let mut writer = AlignmentWriter::new(Vec::new());
    header(&mut writer);
    // Header followed by the one byte end-of-records marker
    let header_len = writer.close().unwrap().len() - 1;

    let mut writer = AlignmentWriter::new(Vec::new());
    header(&mut writer);
    writer.write(&record).unwrap();
    let mut data = writer.finish().unwrap();
    data.truncate(header_len + 5);

    let mut reader = AlignmentReader::new(Cursor::new(&data), &catalog);
    assert!(matches!(reader.next_record(), Err(Error::Format(_))));
    assert!(reader.next_record().unwrap().is_none());
}

#[test]
fn test_unknown_allele() {
    let catalog = catalog();
    let aligner = builder(&catalog).build_single().unwrap();
    let mut writer = AlignmentWriter::new(Vec::new());
    writer.write_header(aligner.parameters(), &aligner.used_alleles()).unwrap();
    let data = writer.finish().unwrap();

    let empty = AlleleCatalog::new();
    let mut reader = AlignmentReader::new(Cursor::new(&data), &empty);
    assert!(matches!(reader.next_record(), Err(Error::UnknownAllele(_))));

    let record = aligner.align(0, &seq(&molecule())).record.unwrap();
    let mut writer = AlignmentWriter::new(Vec::new());
    writer.write_header(aligner.parameters(), &[]).unwrap();
    assert!(matches!(writer.write(&record), Err(Error::UnknownAllele(_))));
}

#[test]
fn test_dispatcher_order_with_latency() {
    init();
    for threads in [1, 3, 8] {
        let output = ParallelDispatcher::new()
            .with_threads(threads)
            .with_batch_size(5)
            .with_max_in_flight(2)
            .run(0..200u64, |x| {
                let delay = rand::rng().random_range(0..500);
                std::thread::sleep(Duration::from_micros(delay));
                x
            })
            .unwrap()
            .collect::<Vec<_>>();
        assert_eq!(output, (0..200).collect::<Vec<_>>());
    }
}

#[test]
fn test_stop_early() {
    let mut output = ParallelDispatcher::new()
        .with_batch_size(4)
        .run(0..u64::MAX, |x| x + 1)
        .unwrap();
    assert_eq!(output.by_ref().take(10).collect::<Vec<_>>(), (1..=10).collect::<Vec<_>>());
    drop(output);
}

#[test]
fn test_presets_and_overrides() {
    let presets = ParameterPresets::builtin();
    let strict = presets.get("strict").unwrap();
    assert!(strict.functional_only);
    assert!(matches!(presets.get("relaxed"), Err(Error::Parameters(_))));

    let params = override_parameters(
        &strict,
        &["merger.minOverlap=25", "jParameters.maxHits=1", "readsLayout=Collinear"],
    )
    .unwrap();
    assert_eq!(params.merger.min_overlap, 25);
    assert_eq!(params.j_parameters.as_ref().unwrap().max_hits, 1);
    assert_eq!(params.v_parameters, strict.v_parameters);
    assert!(override_parameters(&strict, &["merger.minOverlap=many"]).is_err());
    assert!(override_parameters(&strict, &["noSuchField=1"]).is_err());
}

mod alignment;
mod allele;
mod feature;
mod gene;
mod sequence;

pub use alignment::{format_mutations, intersect, Alignment, Mutation, MutationKind};
pub use allele::{Allele, AlleleCatalog};
pub use feature::{shift_position, GeneFeature, ReferencePoint};
pub use gene::{parse_loci, GeneType, Locus};
pub use sequence::{rev_compl, SequenceQuality, PHRED_OFFSET};

use crate::gene::GeneType;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Display;
use std::str::FromStr;

/// Named anchor positions on a receptor sequence.
///
/// Most points are defined by the reference allele. The `*Trimmed` points are
/// derived from where the alignment of the best hit starts or stops on a read.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferencePoint {
    FR1Begin,
    CDR1Begin,
    FR2Begin,
    CDR2Begin,
    FR3Begin,
    CDR3Begin,
    VEnd,
    VEndTrimmed,
    DBegin,
    DBeginTrimmed,
    DEndTrimmed,
    DEnd,
    JBegin,
    JBeginTrimmed,
    CDR3End,
    FR4End,
    CBegin,
    CEnd,
}

impl ReferencePoint {
    pub const ALL: [ReferencePoint; 18] = [
        ReferencePoint::FR1Begin,
        ReferencePoint::CDR1Begin,
        ReferencePoint::FR2Begin,
        ReferencePoint::CDR2Begin,
        ReferencePoint::FR3Begin,
        ReferencePoint::CDR3Begin,
        ReferencePoint::VEnd,
        ReferencePoint::VEndTrimmed,
        ReferencePoint::DBegin,
        ReferencePoint::DBeginTrimmed,
        ReferencePoint::DEndTrimmed,
        ReferencePoint::DEnd,
        ReferencePoint::JBegin,
        ReferencePoint::JBeginTrimmed,
        ReferencePoint::CDR3End,
        ReferencePoint::FR4End,
        ReferencePoint::CBegin,
        ReferencePoint::CEnd,
    ];

    /// The gene segment whose alignment resolves this point.
    pub fn gene_type(&self) -> GeneType {
        use ReferencePoint::*;
        match self {
            FR1Begin | CDR1Begin | FR2Begin | CDR2Begin | FR3Begin | CDR3Begin | VEnd
            | VEndTrimmed => GeneType::Variable,
            DBegin | DBeginTrimmed | DEndTrimmed | DEnd => GeneType::Diversity,
            JBegin | JBeginTrimmed | CDR3End | FR4End => GeneType::Joining,
            CBegin | CEnd => GeneType::Constant,
        }
    }

    /// Returns true if the point is taken from the alignment boundaries rather
    /// than from the allele annotation.
    pub fn is_alignment_derived(&self) -> bool {
        matches!(
            self,
            ReferencePoint::VEndTrimmed
                | ReferencePoint::DBeginTrimmed
                | ReferencePoint::DEndTrimmed
                | ReferencePoint::JBeginTrimmed
        )
    }

    pub fn name(&self) -> &'static str {
        use ReferencePoint::*;
        match self {
            FR1Begin => "FR1Begin",
            CDR1Begin => "CDR1Begin",
            FR2Begin => "FR2Begin",
            CDR2Begin => "CDR2Begin",
            FR3Begin => "FR3Begin",
            CDR3Begin => "CDR3Begin",
            VEnd => "VEnd",
            VEndTrimmed => "VEndTrimmed",
            DBegin => "DBegin",
            DBeginTrimmed => "DBeginTrimmed",
            DEndTrimmed => "DEndTrimmed",
            DEnd => "DEnd",
            JBegin => "JBegin",
            JBeginTrimmed => "JBeginTrimmed",
            CDR3End => "CDR3End",
            FR4End => "FR4End",
            CBegin => "CBegin",
            CEnd => "CEnd",
        }
    }
}

impl Display for ReferencePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ReferencePoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        ReferencePoint::ALL
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| anyhow!("Invalid reference point: {}", s))
    }
}

/// A region of the receptor sequence delimited by two anchor points. The
/// offsets shift the begin and end anchors, e.g. `CDR1(-5,+6)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GeneFeature {
    begin: ReferencePoint,
    end: ReferencePoint,
    begin_offset: i32,
    end_offset: i32,
}

const NAMED_FEATURES: [(&str, GeneFeature); 13] = [
    ("FR1", GeneFeature::FR1),
    ("CDR1", GeneFeature::CDR1),
    ("FR2", GeneFeature::FR2),
    ("CDR2", GeneFeature::CDR2),
    ("FR3", GeneFeature::FR3),
    ("CDR3", GeneFeature::CDR3),
    ("FR4", GeneFeature::FR4),
    ("VRegion", GeneFeature::V_REGION),
    ("DRegion", GeneFeature::D_REGION),
    ("JRegion", GeneFeature::J_REGION),
    ("CRegion", GeneFeature::C_REGION),
    ("VDJRegion", GeneFeature::VDJ_REGION),
    ("VJJunction", GeneFeature::VJ_JUNCTION),
];

impl GeneFeature {
    pub const FR1: Self = Self::new(ReferencePoint::FR1Begin, ReferencePoint::CDR1Begin);
    pub const CDR1: Self = Self::new(ReferencePoint::CDR1Begin, ReferencePoint::FR2Begin);
    pub const FR2: Self = Self::new(ReferencePoint::FR2Begin, ReferencePoint::CDR2Begin);
    pub const CDR2: Self = Self::new(ReferencePoint::CDR2Begin, ReferencePoint::FR3Begin);
    pub const FR3: Self = Self::new(ReferencePoint::FR3Begin, ReferencePoint::CDR3Begin);
    pub const CDR3: Self = Self::new(ReferencePoint::CDR3Begin, ReferencePoint::CDR3End);
    pub const FR4: Self = Self::new(ReferencePoint::CDR3End, ReferencePoint::FR4End);
    pub const V_REGION: Self = Self::new(ReferencePoint::FR1Begin, ReferencePoint::VEnd);
    pub const D_REGION: Self = Self::new(ReferencePoint::DBegin, ReferencePoint::DEnd);
    pub const J_REGION: Self = Self::new(ReferencePoint::JBegin, ReferencePoint::FR4End);
    pub const C_REGION: Self = Self::new(ReferencePoint::CBegin, ReferencePoint::CEnd);
    pub const VDJ_REGION: Self = Self::new(ReferencePoint::FR1Begin, ReferencePoint::FR4End);
    pub const VJ_JUNCTION: Self =
        Self::new(ReferencePoint::VEndTrimmed, ReferencePoint::JBeginTrimmed);

    pub const fn new(begin: ReferencePoint, end: ReferencePoint) -> Self {
        Self {
            begin,
            end,
            begin_offset: 0,
            end_offset: 0,
        }
    }

    pub fn with_offsets(mut self, begin_offset: i32, end_offset: i32) -> Self {
        self.begin_offset = begin_offset;
        self.end_offset = end_offset;
        self
    }

    pub fn begin(&self) -> ReferencePoint {
        self.begin
    }

    pub fn end(&self) -> ReferencePoint {
        self.end
    }

    pub fn begin_offset(&self) -> i32 {
        self.begin_offset
    }

    pub fn end_offset(&self) -> i32 {
        self.end_offset
    }

    /// The gene type of both anchors, if they agree.
    pub fn gene_type(&self) -> Option<GeneType> {
        let g = self.begin.gene_type();
        if g == self.end.gene_type() {
            Some(g)
        } else {
            None
        }
    }

    fn name(&self) -> Option<&'static str> {
        let base = Self::new(self.begin, self.end);
        NAMED_FEATURES
            .iter()
            .find(|(_, f)| *f == base)
            .map(|(name, _)| *name)
    }
}

/// Apply a signed offset to a position, returning `None` if it falls below zero.
pub fn shift_position(position: usize, offset: i32) -> Option<usize> {
    if offset >= 0 {
        position.checked_add(offset as usize)
    } else {
        position.checked_sub(offset.unsigned_abs() as usize)
    }
}

impl Display for GeneFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name)?,
            None => write!(f, "{{{}:{}}}", self.begin, self.end)?,
        }
        if self.begin_offset != 0 || self.end_offset != 0 {
            write!(f, "({:+},{:+})", self.begin_offset, self.end_offset)?;
        }
        Ok(())
    }
}

impl FromStr for GeneFeature {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (base, offsets) = match s.find('(') {
            Some(i) => {
                if !s.ends_with(')') {
                    bail!("Invalid gene feature: {}", s);
                }
                (&s[..i], Some(&s[i + 1..s.len() - 1]))
            }
            None => (s, None),
        };

        let feature = if base.starts_with('{') && base.ends_with('}') {
            let (b, e) = base[1..base.len() - 1]
                .split_once(':')
                .ok_or_else(|| anyhow!("Invalid gene feature: {}", s))?;
            GeneFeature::new(b.parse()?, e.parse()?)
        } else {
            NAMED_FEATURES
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(base))
                .map(|(_, f)| *f)
                .ok_or_else(|| anyhow!("Unknown gene feature: {}", base))?
        };

        match offsets {
            None => Ok(feature),
            Some(offsets) => {
                let (b, e) = offsets
                    .split_once(',')
                    .ok_or_else(|| anyhow!("Invalid gene feature offsets: {}", s))?;
                let b: i32 = b.trim().trim_start_matches('+').parse()?;
                let e: i32 = e.trim().trim_start_matches('+').parse()?;
                Ok(feature.with_offsets(b, e))
            }
        }
    }
}

impl Serialize for GeneFeature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GeneFeature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        GeneFeature::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_parsing() {
        assert_eq!("CDR3".parse::<GeneFeature>().unwrap(), GeneFeature::CDR3);
        assert_eq!(
            "cdr1(-5,+6)".parse::<GeneFeature>().unwrap(),
            GeneFeature::CDR1.with_offsets(-5, 6)
        );
        assert_eq!(
            "{CDR3Begin:VEnd}".parse::<GeneFeature>().unwrap(),
            GeneFeature::new(ReferencePoint::CDR3Begin, ReferencePoint::VEnd)
        );
        assert!("CDR9".parse::<GeneFeature>().is_err());
        assert!("CDR1(-5".parse::<GeneFeature>().is_err());
    }

    #[test]
    fn test_feature_display() {
        assert_eq!(GeneFeature::CDR3.to_string(), "CDR3");
        assert_eq!(GeneFeature::CDR1.with_offsets(-5, 6).to_string(), "CDR1(-5,+6)");
        let custom = GeneFeature::new(ReferencePoint::CDR3Begin, ReferencePoint::VEnd);
        assert_eq!(custom.to_string(), "{CDR3Begin:VEnd}");
        assert_eq!(custom.to_string().parse::<GeneFeature>().unwrap(), custom);
    }

    #[test]
    fn test_gene_type_of_feature() {
        assert_eq!(GeneFeature::V_REGION.gene_type(), Some(GeneType::Variable));
        assert_eq!(GeneFeature::CDR3.gene_type(), None);
        assert_eq!(shift_position(3, -5), None);
        assert_eq!(shift_position(3, 2), Some(5));
    }
}

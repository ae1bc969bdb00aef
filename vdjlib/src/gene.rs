use anyhow::{bail, Result};
use bincode::{Decode, Encode};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

/// Category of immune-receptor gene segment.
#[derive(Encode, Decode, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GeneType {
    #[serde(rename = "V")]
    Variable,
    #[serde(rename = "D")]
    Diversity,
    #[serde(rename = "J")]
    Joining,
    #[serde(rename = "C")]
    Constant,
}

impl GeneType {
    pub const ALL: [GeneType; 4] = [
        GeneType::Variable,
        GeneType::Diversity,
        GeneType::Joining,
        GeneType::Constant,
    ];

    pub fn letter(&self) -> char {
        match self {
            GeneType::Variable => 'V',
            GeneType::Diversity => 'D',
            GeneType::Joining => 'J',
            GeneType::Constant => 'C',
        }
    }
}

impl Display for GeneType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for GeneType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "v" | "variable" => Ok(GeneType::Variable),
            "d" | "diversity" => Ok(GeneType::Diversity),
            "j" | "joining" => Ok(GeneType::Joining),
            "c" | "constant" => Ok(GeneType::Constant),
            _ => bail!("Invalid gene type: {}", s),
        }
    }
}

impl<'de> Deserialize<'de> for GeneType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        GeneType::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Immunological locus an allele belongs to.
#[derive(Encode, Decode, Serialize, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Locus {
    TRA,
    TRB,
    TRG,
    TRD,
    IGH,
    IGK,
    IGL,
}

impl Locus {
    pub const ALL: [Locus; 7] = [
        Locus::TRA,
        Locus::TRB,
        Locus::TRG,
        Locus::TRD,
        Locus::IGH,
        Locus::IGK,
        Locus::IGL,
    ];

    pub fn is_tcr(&self) -> bool {
        matches!(self, Locus::TRA | Locus::TRB | Locus::TRG | Locus::TRD)
    }
}

impl Display for Locus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Locus::TRA => "TRA",
            Locus::TRB => "TRB",
            Locus::TRG => "TRG",
            Locus::TRD => "TRD",
            Locus::IGH => "IGH",
            Locus::IGK => "IGK",
            Locus::IGL => "IGL",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Locus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tra" => Ok(Locus::TRA),
            "trb" => Ok(Locus::TRB),
            "trg" => Ok(Locus::TRG),
            "trd" => Ok(Locus::TRD),
            "igh" => Ok(Locus::IGH),
            "igk" => Ok(Locus::IGK),
            "igl" => Ok(Locus::IGL),
            _ => bail!("Invalid locus: {}", s),
        }
    }
}

impl<'de> Deserialize<'de> for Locus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Locus::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a comma separated list of loci. Besides individual locus names, the
/// groups `tcr`, `ig` and `all` are recognized.
pub fn parse_loci(loci: &str) -> Result<BTreeSet<Locus>> {
    let mut result = BTreeSet::new();
    for item in loci.split(',') {
        match item.trim().to_lowercase().as_str() {
            "tcr" => result.extend(Locus::ALL.iter().filter(|l| l.is_tcr())),
            "ig" => result.extend(Locus::ALL.iter().filter(|l| !l.is_tcr())),
            "all" => result.extend(Locus::ALL),
            "" => {}
            other => {
                result.insert(Locus::from_str(other)?);
            }
        }
    }
    Ok(result)
}

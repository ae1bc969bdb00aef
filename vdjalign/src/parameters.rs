use crate::error::{Error, Result};
use crate::merger::{MergerParameters, ReadsLayout};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use vdjlib::{parse_loci, GeneFeature, GeneType, Locus};

/// Alignment settings for one gene type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneAlignerParameters {
    pub feature_to_align: GeneFeature, // Region of the allele the reads are aligned to
    pub required_feature: GeneFeature, // Alleles lacking this feature are not used
    pub kmer_size: usize,
    pub match_score: f32,
    pub mismatch_score: f32,
    pub min_score: f32,
    pub relative_min_score: f32, // Hits scoring below this fraction of the best hit are dropped
    pub max_hits: usize,
}

impl GeneAlignerParameters {
    pub fn new(feature: GeneFeature) -> Self {
        Self {
            feature_to_align: feature,
            required_feature: feature,
            kmer_size: 9,
            match_score: 5.0,
            mismatch_score: -4.0,
            min_score: 40.0,
            relative_min_score: 0.87,
            max_hits: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlignerParameters {
    pub v_parameters: Option<GeneAlignerParameters>,
    pub d_parameters: Option<GeneAlignerParameters>,
    pub j_parameters: Option<GeneAlignerParameters>,
    pub c_parameters: Option<GeneAlignerParameters>,
    #[serde(default)]
    pub merger: MergerParameters,
    #[serde(default)]
    pub reads_layout: ReadsLayout,
    #[serde(default)]
    pub functional_only: bool,
    #[serde(default = "default_loci")]
    pub loci: String,
}

fn default_loci() -> String {
    "all".to_string()
}

impl Default for AlignerParameters {
    fn default() -> Self {
        let d = GeneAlignerParameters {
            kmer_size: 5,
            min_score: 15.0,
            relative_min_score: 0.85,
            max_hits: 3,
            ..GeneAlignerParameters::new(GeneFeature::D_REGION)
        };
        let j = GeneAlignerParameters {
            kmer_size: 7,
            min_score: 25.0,
            relative_min_score: 0.8,
            max_hits: 3,
            ..GeneAlignerParameters::new(GeneFeature::J_REGION)
        };
        Self {
            v_parameters: Some(GeneAlignerParameters::new(GeneFeature::V_REGION)),
            d_parameters: Some(d),
            j_parameters: Some(j),
            c_parameters: Some(GeneAlignerParameters::new(GeneFeature::C_REGION)),
            merger: MergerParameters::default(),
            reads_layout: ReadsLayout::Opposite,
            functional_only: false,
            loci: default_loci(),
        }
    }
}

impl AlignerParameters {
    pub fn gene_parameters(&self, gene_type: GeneType) -> Option<&GeneAlignerParameters> {
        match gene_type {
            GeneType::Variable => self.v_parameters.as_ref(),
            GeneType::Diversity => self.d_parameters.as_ref(),
            GeneType::Joining => self.j_parameters.as_ref(),
            GeneType::Constant => self.c_parameters.as_ref(),
        }
    }

    pub fn gene_parameters_mut(
        &mut self,
        gene_type: GeneType,
    ) -> Option<&mut GeneAlignerParameters> {
        match gene_type {
            GeneType::Variable => self.v_parameters.as_mut(),
            GeneType::Diversity => self.d_parameters.as_mut(),
            GeneType::Joining => self.j_parameters.as_mut(),
            GeneType::Constant => self.c_parameters.as_mut(),
        }
    }

    /// Gene types that have an alignment configuration.
    pub fn gene_types(&self) -> impl Iterator<Item = GeneType> + '_ {
        GeneType::ALL
            .into_iter()
            .filter(|g| self.gene_parameters(*g).is_some())
    }

    pub fn loci(&self) -> Result<BTreeSet<Locus>> {
        parse_loci(&self.loci).map_err(|e| Error::Parameters(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Parameters(e.to_string()))
    }
}

/// Named parameter sets.
#[derive(Debug, Clone, Default)]
pub struct ParameterPresets(IndexMap<String, AlignerParameters>);

impl ParameterPresets {
    /// The presets shipped with the aligner: `default` and `strict`.
    pub fn builtin() -> Self {
        let mut presets = Self::default();
        presets.insert("default", AlignerParameters::default());

        let mut strict = AlignerParameters::default();
        strict.merger = MergerParameters {
            min_overlap: 20,
            max_mismatches: 2,
            max_mismatch_rate: 0.05,
        };
        strict.functional_only = true;
        for gene_type in GeneType::ALL {
            if let Some(p) = strict.gene_parameters_mut(gene_type) {
                p.min_score *= 1.5;
                p.relative_min_score = p.relative_min_score.max(0.9);
                p.max_hits = p.max_hits.min(3);
            }
        }
        presets.insert("strict", strict);
        presets
    }

    pub fn insert(&mut self, name: impl Into<String>, parameters: AlignerParameters) {
        self.0.insert(name.into(), parameters);
    }

    pub fn get(&self, name: &str) -> Result<AlignerParameters> {
        self.0
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Parameters(format!("Unknown aligner parameters: {}", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|x| x.as_str())
    }
}

/// Apply `path=value` overrides to any serializable parameter object.
///
/// The path is a dot separated list of field names of the JSON form. A name
/// that is not a field at the current level is looked up in nested objects,
/// and must be unique there. The value is read as JSON, or as a string when
/// it is not valid JSON. `[a,b]` lists of unquoted items become string arrays.
pub fn override_parameters<T, S>(parameters: &T, overrides: &[S]) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    S: AsRef<str>,
{
    let mut json = serde_json::to_value(parameters)?;
    for item in overrides {
        let item = item.as_ref();
        let (path, value) = item
            .split_once('=')
            .ok_or_else(|| Error::Parameters(format!("Invalid override: {}", item)))?;
        let mut node = &mut json;
        for key in path.trim().split('.') {
            node = locate(node, key)
                .ok_or_else(|| Error::Parameters(format!("Unknown parameter: {}", path)))?;
        }
        *node = parse_value(value.trim());
    }
    serde_json::from_value(json)
        .map_err(|e| Error::Parameters(format!("Invalid parameter value: {}", e)))
}

fn locate<'a>(node: &'a mut Value, key: &str) -> Option<&'a mut Value> {
    if node.get(key).is_some() {
        return node.get_mut(key);
    }
    let mut paths = Vec::new();
    find_nested(node, key, &mut Vec::new(), &mut paths);
    if paths.len() != 1 {
        return None;
    }
    paths
        .pop()?
        .into_iter()
        .try_fold(node, |n, k| n.get_mut(k.as_str()))
}

fn find_nested(node: &Value, key: &str, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    if let Value::Object(map) = node {
        for (k, v) in map {
            prefix.push(k.clone());
            if k == key {
                out.push(prefix.clone());
            }
            find_nested(v, key, prefix, out);
            prefix.pop();
        }
    }
}

fn parse_value(value: &str) -> Value {
    if let Ok(v) = serde_json::from_str(value) {
        return v;
    }
    if value.starts_with('[') && value.ends_with(']') {
        let inner = &value[1..value.len() - 1];
        return Value::Array(split_top_level(inner).into_iter().map(parse_value).collect());
    }
    Value::String(value.to_string())
}

/// Split on commas that are not enclosed in parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '{' => depth += 1,
            ')' | '}' => depth -= 1,
            ',' if depth == 0 => {
                result.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if !s[start..].trim().is_empty() {
        result.push(s[start..].trim());
    }
    result
}

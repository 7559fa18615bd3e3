//! Expansion of a compact sweep description into an ordered list of jobs.
//!
//! The outer axis is the batch size, the inner axis is a list of
//! (optimizer, max_steps) pairs. Expansion is outer-major, inner-minor and
//! keeps the literal order of both lists. Nothing here touches the
//! filesystem, every check runs before the first job is launched.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SweepError {
    #[error("run name '{name}' is produced by job #{first} and job #{second}")]
    DuplicateRunName {
        name: String,
        first: usize,
        second: usize,
    },
    #[error("pair list has {optimizers} optimizers but {max_steps} max_steps values")]
    PairLengthMismatch { optimizers: usize, max_steps: usize },
    #[error("batch size {batch_size} has no (optimizer, max_steps) pairs and no default pairs are set")]
    MissingPairs { batch_size: u32 },
    #[error("batch size must be positive")]
    ZeroBatchSize,
    #[error("invalid run name template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("run name '{0}' cannot be used as a file name")]
    InvalidRunName(String),
    #[error("sweep does not contain any job")]
    EmptySweep,
    #[error("unknown optimizer '{0}', expected one of sgd, adam, rms")]
    UnknownOptimizer(String),
}

// read from config files through FromStr, see PairList::resolve
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Optimizer {
    Sgd,
    Adam,
    Rms,
}

impl Optimizer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sgd => "sgd",
            Self::Adam => "adam",
            Self::Rms => "rms",
        }
    }
}

impl fmt::Display for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Optimizer {
    type Err = SweepError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            "rms" => Ok(Self::Rms),
            _ => Err(SweepError::UnknownOptimizer(value.to_owned())),
        }
    }
}

/// One entry of the inner axis, the step budget belongs to its optimizer
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepPair {
    pub optimizer: Optimizer,
    pub max_steps: u32,
}

impl StepPair {
    pub fn new(optimizer: Optimizer, max_steps: u32) -> Self {
        Self {
            optimizer,
            max_steps,
        }
    }
}

/// A pair as written in the config file, the optimizer is checked on resolve
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PairEntry {
    pub optimizer: String,
    pub max_steps: u32,
}

/// Inner pair list as written in the config file
///
/// Either explicit pairs or two parallel lists. The parallel form is only
/// accepted when both lists have the same length, pairing is positional.
/// Optimizer names stay plain strings until `resolve`, so an unknown name
/// is reported as such.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum PairList {
    Pairs(Vec<PairEntry>),
    Parallel {
        optimizers: Vec<String>,
        max_steps: Vec<u32>,
    },
}

impl PairList {
    pub fn resolve(&self) -> Result<Vec<StepPair>, SweepError> {
        match self {
            Self::Pairs(pairs) => pairs
                .iter()
                .map(|pair| {
                    pair.optimizer
                        .parse()
                        .map(|optimizer| StepPair::new(optimizer, pair.max_steps))
                })
                .collect(),
            Self::Parallel {
                optimizers,
                max_steps,
            } => {
                if optimizers.len() != max_steps.len() {
                    return Err(SweepError::PairLengthMismatch {
                        optimizers: optimizers.len(),
                        max_steps: max_steps.len(),
                    });
                }

                optimizers
                    .iter()
                    .zip(max_steps.iter())
                    .map(|(optimizer, steps)| {
                        optimizer
                            .parse()
                            .map(|optimizer| StepPair::new(optimizer, *steps))
                    })
                    .collect()
            }
        }
    }
}

/// One value of the outer axis, optionally with its own inner list
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum BatchEntry {
    Plain(u32),
    Grouped {
        batch_size: u32,
        #[serde(default)]
        pairs: Option<PairList>,
    },
}

impl BatchEntry {
    pub fn batch_size(&self) -> u32 {
        match self {
            Self::Plain(batch_size) | Self::Grouped { batch_size, .. } => *batch_size,
        }
    }
}

/// A resolved outer value together with the inner pairs it expands to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepGroup {
    pub batch_size: u32,
    pub pairs: Vec<StepPair>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Optimizer,
    BatchSize,
    MaxSteps,
    Mode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

pub const DEFAULT_RUN_NAME: &str = "{optimizer}_bs{batch_size}_base";

/// Pre-parsed run name template, e.g. `{optimizer}_bs{batch_size}_base`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct RunNameTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl RunNameTemplate {
    pub fn parse(template: &str) -> Result<Self, SweepError> {
        let invalid = |reason: &str| SweepError::InvalidTemplate {
            template: template.to_owned(),
            reason: reason.to_owned(),
        };

        let mut segments = Vec::new();
        let mut rest = template;

        while !rest.is_empty() {
            match rest.find(|c: char| c == '{' || c == '}') {
                None => {
                    segments.push(Segment::Literal(rest.to_owned()));
                    break;
                }
                Some(start) if rest[start..].starts_with('}') => {
                    return Err(invalid("'}' without matching '{'"));
                }
                Some(start) => {
                    if start > 0 {
                        segments.push(Segment::Literal(rest[..start].to_owned()));
                    }

                    let end = rest[start..]
                        .find('}')
                        .map(|offset| start + offset)
                        .ok_or_else(|| invalid("'{' is never closed"))?;

                    let field = match &rest[start + 1..end] {
                        "optimizer" => Field::Optimizer,
                        "batch_size" => Field::BatchSize,
                        "max_steps" => Field::MaxSteps,
                        "mode" => Field::Mode,
                        other => {
                            return Err(invalid(&format!("unknown placeholder '{{{other}}}'")))
                        }
                    };

                    segments.push(Segment::Field(field));
                    rest = &rest[end + 1..];
                }
            }
        }

        if segments.is_empty() {
            return Err(invalid("template is empty"));
        }

        Ok(Self {
            raw: template.to_owned(),
            segments,
        })
    }

    pub fn render(&self, pair: &StepPair, batch_size: u32, mode: &str) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(literal) => literal.clone(),
                Segment::Field(Field::Optimizer) => pair.optimizer.to_string(),
                Segment::Field(Field::BatchSize) => batch_size.to_string(),
                Segment::Field(Field::MaxSteps) => pair.max_steps.to_string(),
                Segment::Field(Field::Mode) => mode.to_owned(),
            })
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Default for RunNameTemplate {
    fn default() -> Self {
        // the default template is a constant and always parses
        Self {
            raw: DEFAULT_RUN_NAME.to_owned(),
            segments: vec![
                Segment::Field(Field::Optimizer),
                Segment::Literal("_bs".to_owned()),
                Segment::Field(Field::BatchSize),
                Segment::Literal("_base".to_owned()),
            ],
        }
    }
}

impl TryFrom<String> for RunNameTemplate {
    type Error = SweepError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunNameTemplate> for String {
    fn from(value: RunNameTemplate) -> Self {
        value.raw
    }
}

/// The `sweep` table of the config file
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SweepSpec {
    #[serde(default)]
    pub run_name: RunNameTemplate,
    // default inner list for batch sizes that don't carry their own
    #[serde(default)]
    pub pairs: Option<PairList>,
    pub batch_sizes: Vec<BatchEntry>,
}

impl SweepSpec {
    /// resolve every outer value into its explicit inner pair list
    pub fn groups(&self) -> Result<Vec<SweepGroup>, SweepError> {
        let default_pairs = self.pairs.as_ref().map(PairList::resolve).transpose()?;

        self.batch_sizes
            .iter()
            .map(|entry| {
                let batch_size = entry.batch_size();

                if batch_size == 0 {
                    return Err(SweepError::ZeroBatchSize);
                }

                let pairs = match entry {
                    BatchEntry::Grouped {
                        pairs: Some(pairs), ..
                    } => pairs.resolve()?,
                    _ => default_pairs
                        .clone()
                        .ok_or(SweepError::MissingPairs { batch_size })?,
                };

                Ok(SweepGroup { batch_size, pairs })
            })
            .collect()
    }
}

/// One fully materialised combination of the sweep
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct JobDescriptor {
    /// position in launch order, starting at 0
    pub index: usize,
    pub run_name: String,
    pub batch_size: u32,
    pub optimizer: Optimizer,
    pub max_steps: u32,
    pub workers: u32,
}

/// Expand a sweep section, see [`expand_groups`]
pub fn expand(
    spec: &SweepSpec,
    mode: &str,
    workers: u32,
) -> Result<Vec<JobDescriptor>, SweepError> {
    expand_groups(&spec.groups()?, &spec.run_name, mode, workers)
}

/// Expand resolved groups into descriptors, outer value slowest
///
/// Fails if any two descriptors share a run name, since launching the
/// second would wipe the state of the first.
pub fn expand_groups(
    groups: &[SweepGroup],
    template: &RunNameTemplate,
    mode: &str,
    workers: u32,
) -> Result<Vec<JobDescriptor>, SweepError> {
    let descriptors = groups
        .iter()
        .flat_map(|group| group.pairs.iter().map(move |pair| (group.batch_size, pair)))
        .enumerate()
        .map(|(index, (batch_size, pair))| JobDescriptor {
            index,
            run_name: template.render(pair, batch_size, mode),
            batch_size,
            optimizer: pair.optimizer,
            max_steps: pair.max_steps,
            workers,
        })
        .collect_vec();

    if descriptors.is_empty() {
        return Err(SweepError::EmptySweep);
    }

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();

    for descriptor in descriptors.iter() {
        if !is_valid_run_name(&descriptor.run_name) {
            return Err(SweepError::InvalidRunName(descriptor.run_name.clone()));
        }

        if let Some(first) = seen.insert(&descriptor.run_name, descriptor.index) {
            return Err(SweepError::DuplicateRunName {
                name: descriptor.run_name.clone(),
                first,
                second: descriptor.index,
            });
        }
    }

    Ok(descriptors)
}

// run names become file names directly below the scratch root
fn is_valid_run_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

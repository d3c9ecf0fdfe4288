//! Span orchestration: every configured index for every span, merged into one dataset.

use crate::grid::dataset::{GridDataset, GridError, Variable};
use crate::indices::distribution::Distribution;
use crate::indices::rolling::{pr, pret};
use crate::indices::standardize::{spei, spi};
use crate::shared::config::ConfigError;
use crate::shared::progress::{Stage, TaskProgress};
use crate::shared::tasks::{TaskError, TaskPool, await_all};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Rolling window must cover at least one time step")]
    EmptyWindow,
    #[error("Rolling window of {window} steps does not fit a time axis of {steps} steps")]
    WindowTooLarge { window: usize, steps: usize },
    #[error("Index '{index}' requires '{dependency}': dependency not computed for current span")]
    MissingDependency { index: IndexKind, dependency: IndexKind },
    #[error("Output variable '{0}' would be written more than once")]
    NameCollision(String),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Task(#[from] TaskError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IndexKind {
    Pr,
    Pret,
    Spi,
    Spei,
}

impl IndexKind {
    /// The rolling aggregate a standardized index is fitted to.
    pub fn dependency(self) -> Option<IndexKind> {
        match self {
            Self::Pr | Self::Pret => None,
            Self::Spi => Some(Self::Pr),
            Self::Spei => Some(Self::Pret),
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pr => "PR",
            Self::Pret => "PRET",
            Self::Spi => "SPI",
            Self::Spei => "SPEI",
        })
    }
}

fn default_precip() -> String {
    "ppt".to_string()
}

fn default_et() -> String {
    "pet".to_string()
}

fn default_time_dim() -> String {
    "year".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexParams {
    #[serde(default = "default_precip")]
    pub precip: String,
    #[serde(default = "default_et")]
    pub et: String,
    /// Family fitted by SPEI. SPI always uses a zero-inflated gamma.
    #[serde(default)]
    pub distribution: Distribution,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            precip: default_precip(),
            et: default_et(),
            distribution: Distribution::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexDefinition {
    pub name: IndexKind,
    #[serde(default)]
    pub params: IndexParams,
    /// Output variable name; `{span}` is replaced by the span length.
    pub name_format: String,
    pub long_name_format: String,
}

impl IndexDefinition {
    pub fn output_name(&self, span: usize) -> String {
        self.name_format.replace("{span}", &span.to_string())
    }

    pub fn long_name(&self, span: usize) -> String {
        self.long_name_format.replace("{span}", &span.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexConfig {
    pub reference_period: [i64; 2],
    pub focal_period: [i64; 2],
    pub spans: Vec<usize>,
    #[serde(default = "default_time_dim")]
    pub time_dim: String,
    pub indices: Vec<IndexDefinition>,
}

impl IndexConfig {
    /// Checks the configuration against the dataset it will run on.
    pub fn validate(&self, ds: &GridDataset) -> Result<(), IndexError> {
        if self.spans.is_empty() {
            return Err(ConfigError::Invalid("no spans configured".to_string()).into());
        }
        if self.indices.is_empty() {
            return Err(ConfigError::Invalid("no indices configured".to_string()).into());
        }
        if ds.time_dim != self.time_dim {
            return Err(GridError::TimeDimMismatch {
                expected: self.time_dim.clone(),
                found: ds.time_dim.clone(),
            }
            .into());
        }
        for period in [self.reference_period, self.focal_period] {
            ds.time_range(period[0], period[1])?;
        }
        let steps = ds.time.len();
        for &span in &self.spans {
            if span == 0 {
                return Err(IndexError::EmptyWindow);
            }
            if span >= steps {
                return Err(IndexError::WindowTooLarge { window: span, steps });
            }
        }

        let mut computed = HashSet::new();
        for def in &self.indices {
            if let Some(dependency) = def.name.dependency() {
                if !computed.contains(&dependency) {
                    return Err(IndexError::MissingDependency {
                        index: def.name,
                        dependency,
                    });
                }
            }
            match def.name {
                IndexKind::Pr => {
                    ds.variable(&def.params.precip)?;
                }
                IndexKind::Pret => {
                    ds.variable(&def.params.precip)?;
                    ds.variable(&def.params.et)?;
                }
                IndexKind::Spi | IndexKind::Spei => {}
            }
            computed.insert(def.name);
        }

        let mut names: BTreeSet<String> = ds.variables.keys().cloned().collect();
        for &span in &self.spans {
            for def in &self.indices {
                let name = def.output_name(span);
                if !names.insert(name.clone()) {
                    return Err(IndexError::NameCollision(name));
                }
            }
        }
        Ok(())
    }
}

/// Joins a reference-period store in front of the focal-period input.
pub fn with_reference(
    input: &GridDataset,
    reference: &GridDataset,
    config: &IndexConfig,
) -> Result<GridDataset, IndexError> {
    let [ref_start, ref_end] = config.reference_period;
    let [focal_start, focal_end] = config.focal_period;
    let earlier = reference.select_time(ref_start, ref_end)?;
    let later = input.select_time(focal_start, focal_end)?;
    Ok(GridDataset::concat_time(&earlier, &later)?)
}

/// Computes every configured index for one span.
///
/// Returns the outputs trimmed to the focal period and renamed for `span`, in
/// definition order.
pub fn make_indices(
    ds: &GridDataset,
    span: usize,
    config: &IndexConfig,
) -> Result<Vec<(String, Variable)>, IndexError> {
    let focal = ds.time_range(config.focal_period[0], config.focal_period[1])?;
    let reference = ds.time_range(config.reference_period[0], config.reference_period[1])?;
    let mut inputs: HashMap<IndexKind, Variable> = HashMap::new();
    let mut outputs = Vec::with_capacity(config.indices.len());

    for def in &config.indices {
        let params = &def.params;
        let focal_output = match def.name {
            IndexKind::Pr | IndexKind::Pret => {
                let full = if def.name == IndexKind::Pr {
                    pr(ds, span, &params.precip)?
                } else {
                    pret(ds, span, &params.precip, &params.et)?
                };
                let trimmed = full.slice_time(focal.clone());
                inputs.insert(def.name, full);
                trimmed
            }
            IndexKind::Spi | IndexKind::Spei => {
                let dependency = def.name.dependency().unwrap_or(def.name);
                let input = inputs.get(&dependency).ok_or(IndexError::MissingDependency {
                    index: def.name,
                    dependency,
                })?;
                let foc = input.slice_time(focal.clone());
                let refr = input.slice_time(reference.clone());
                if def.name == IndexKind::Spi {
                    spi(foc.data.view(), refr.data.view())
                } else {
                    spei(foc.data.view(), refr.data.view(), params.distribution)
                }
            }
        };
        let mut variable = focal_output;
        variable.attrs.long_name = Some(def.long_name(span));
        outputs.push((def.output_name(span), variable));
    }
    log::debug!("Span {span}: computed {} indices", outputs.len());
    Ok(outputs)
}

/// Computes all spans on `pool` and merges them with the focal slice of `ds`.
///
/// Span outputs are merged in span order, independent of completion order.
pub fn compute_indices<P: TaskPool>(
    ds: Arc<GridDataset>,
    config: Arc<IndexConfig>,
    pool: &P,
    progress: &mut dyn TaskProgress,
) -> Result<GridDataset, IndexError> {
    config.validate(&ds)?;
    log::info!(
        "Computing {} indices for spans {:?} (focal {:?}, reference {:?})",
        config.indices.len(),
        config.spans,
        config.focal_period,
        config.reference_period
    );
    let handles = config
        .spans
        .iter()
        .map(|&span| {
            let ds = Arc::clone(&ds);
            let config = Arc::clone(&config);
            pool.submit(move || make_indices(&ds, span, &config))
        })
        .collect();
    let per_span = await_all(handles, Stage::Spans, progress)?;

    let mut merged = ds.select_time(config.focal_period[0], config.focal_period[1])?;
    for outputs in per_span {
        for (name, variable) in outputs {
            merged.insert(name, variable).map_err(|e| match e {
                GridError::DuplicateVariable(name) => IndexError::NameCollision(name),
                other => other.into(),
            })?;
        }
    }
    Ok(merged)
}

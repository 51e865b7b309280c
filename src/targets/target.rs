use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use hashlink::LinkedHashMap;
use saphyr::{Scalar, Yaml};
use snafu::{ResultExt, Snafu, ensure};
use tracing::{debug, info, instrument};

use crate::ext::{PathDisplayExt, contains_path, normalize_lexically};
use crate::filesystem::{ScanError, scan};
use crate::materializer::{ChangeStats, MaterializationError, MaterializeOptions, Materializer};
use crate::merge::{MergeError, MergeInput, MergeOptions, merge};

/// The materializer a target reuses between runs, with the settings it was built for.
#[derive(Debug)]
struct MaterializerSlot {
    options: MaterializeOptions,
    materializer: Materializer,
}

/// A named output directory assembled from an ordered list of input directories.
///
/// Clones share one materializer, so repeated runs of the same target in a
/// process update the output incrementally.
#[derive(Debug, Clone)]
pub struct Target {
    name: String,
    output: PathBuf,
    inputs: Vec<PathBuf>,
    overwrite: bool,
    dependencies: Vec<String>,
    materializer: Arc<Mutex<Option<MaterializerSlot>>>,
}

/// What a finished target did.
#[derive(Debug, Clone)]
pub struct TargetReport {
    pub name: String,
    pub output: PathBuf,
    pub stats: ChangeStats,
}

fn key(name: &'static str) -> Yaml<'static> {
    Yaml::Value(Scalar::String(Cow::Borrowed(name)))
}

fn string_list(data: &LinkedHashMap<Yaml, Yaml>, name: &'static str) -> Vec<String> {
    data.get(&key(name))
        .and_then(|v| v.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

impl Target {
    pub fn new(name: impl Into<String>, output: impl Into<PathBuf>, inputs: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
            inputs,
            overwrite: false,
            dependencies: Vec::new(),
            materializer: Arc::default(),
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn from_target_yaml(
        target_name: &str,
        target_data: &LinkedHashMap<Yaml, Yaml>,
    ) -> Option<Self> {
        debug!("Parsing target '{}'", target_name);

        let Some(output) = target_data.get(&key("output")).and_then(|v| v.as_str()) else {
            debug!("Target '{}' has no output, skipping", target_name);
            return None;
        };

        let overwrite = target_data
            .get(&key("overwrite"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let inputs = string_list(target_data, "inputs")
            .into_iter()
            .map(PathBuf::from)
            .collect();

        Some(
            Target::new(target_name, output, inputs)
                .with_overwrite(overwrite)
                .with_dependencies(string_list(target_data, "dependsOn")),
        )
    }

    pub fn id(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Scans the inputs, merges them and materializes the result.
    ///
    /// Paths are resolved against `root`. The output must not contain the root
    /// or any input: the first run clears it.
    #[instrument(skip_all, fields(name = %self.name, overwrite = self.overwrite()))]
    pub fn run(
        &self,
        root: &Path,
        options: MaterializeOptions,
    ) -> Result<TargetReport, TargetError> {
        self.check_output(root)?;
        let output = root.join(&self.output);

        let inputs = self
            .inputs
            .iter()
            .map(|input| {
                let path = root.join(input);
                let tree = scan(&path).context(ScanSnafu {
                    target_name: self.name.clone(),
                })?;
                Ok(MergeInput::new(tree, path))
            })
            .collect::<Result<Vec<_>, TargetError>>()?;

        let merged = merge(
            &inputs,
            MergeOptions {
                overwrite: self.overwrite,
            },
        )
        .context(MergeSnafu {
            target_name: self.name.clone(),
        })?;

        let mut cached = self
            .materializer
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let reusable = cached
            .as_ref()
            .is_some_and(|slot| slot.options == options && slot.materializer.output() == output);
        if !reusable {
            debug!("Creating materializer for {}", output.display());
            *cached = None;
        }
        let slot = cached.get_or_insert_with(|| MaterializerSlot {
            options,
            materializer: Materializer::new(&output, options),
        });
        let stats = slot
            .materializer
            .update(merged)
            .context(MaterializeSnafu {
                target_name: self.name.clone(),
            })?;

        info!(%stats, "Target '{}' materialized", self.name);
        Ok(TargetReport {
            name: self.name.clone(),
            output,
            stats,
        })
    }

    fn check_output(&self, root: &Path) -> Result<(), TargetError> {
        let base = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
        let output = normalize_lexically(&base.join(&self.output));

        ensure!(
            !contains_path(&output, &base),
            OutputContainsRootSnafu {
                target_name: self.name.clone(),
                output: output.clone(),
            }
        );
        for input in &self.inputs {
            let input = normalize_lexically(&base.join(input));
            ensure!(
                !contains_path(&output, &input),
                OutputContainsInputSnafu {
                    target_name: self.name.clone(),
                    output: output.clone(),
                    input,
                }
            );
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum TargetError {
    #[snafu(display("Failed to scan inputs of target '{}'", target_name))]
    ScanError {
        target_name: String,
        source: ScanError,
    },
    #[snafu(display("Failed to merge inputs of target '{}'", target_name))]
    MergeError {
        target_name: String,
        source: MergeError,
    },
    #[snafu(display("Failed to materialize target '{}'", target_name))]
    MaterializeError {
        target_name: String,
        source: MaterializationError,
    },
    #[snafu(display(
        "Output {} of target '{}' would replace the project root",
        output.display_best_effort(),
        target_name
    ))]
    OutputContainsRoot { target_name: String, output: PathBuf },
    #[snafu(display(
        "Output {} of target '{}' would replace its input {}",
        output.display_best_effort(),
        target_name,
        input.display_best_effort()
    ))]
    OutputContainsInput {
        target_name: String,
        output: PathBuf,
        input: PathBuf,
    },
    #[snafu(display("Target '{}' got cancelled", target_name))]
    CanceledError {
        target_name: String,
        source: futures_channel::oneshot::Canceled,
    },
}

impl TargetError {
    pub fn target_name(&self) -> &str {
        match self {
            TargetError::ScanError { target_name, .. }
            | TargetError::MergeError { target_name, .. }
            | TargetError::MaterializeError { target_name, .. }
            | TargetError::OutputContainsRoot { target_name, .. }
            | TargetError::OutputContainsInput { target_name, .. }
            | TargetError::CanceledError { target_name, .. } => target_name,
        }
    }
}

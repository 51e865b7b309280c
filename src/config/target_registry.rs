use compio::{BufResult, fs::File, io::AsyncReadExt, io::BufReader};
use hashlink::LinkedHashMap;
use saphyr::{LoadableYamlNode, Scalar, Yaml};
use snafu::prelude::*;
use std::{
    borrow::Cow,
    io::Cursor,
    path::{Component, Path, PathBuf},
};
use tracing::debug;

use crate::{
    ext::{PathDisplayExt, contains_path, normalize_lexically},
    targets::Target,
};

const CONFIG_FILE_NAME: &str = "treesync.yaml";

fn get_config_file_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE_NAME)
}

fn key(name: &'static str) -> Yaml<'static> {
    Yaml::Value(Scalar::String(Cow::Borrowed(name)))
}

/// Every target declared in `treesync.yaml`, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: LinkedHashMap<String, Target>,
    force_copy: bool,
}

impl TargetRegistry {
    pub async fn read(root: &Path) -> Result<Self, TargetRegistryCreationError> {
        Self::from_path(get_config_file_path(root)).await
    }

    pub async fn from_path(path: PathBuf) -> Result<Self, TargetRegistryCreationError> {
        debug!("Opening config file: {}", path.display_best_effort());
        let file = File::open(&path).await.context(ReadSnafu {
            file_path: path.display_best_effort(),
        })?;

        let mut reader = BufReader::new(Cursor::new(file));
        let BufResult(result, contents) = reader.read_to_string(String::new()).await;
        let bytes = result.context(ReadSnafu {
            file_path: path.display_best_effort(),
        })?;
        debug!("Read config file: {bytes} bytes");

        contents.as_str().try_into()
    }

    pub fn get_target_by_id(&self, id: impl AsRef<str>) -> Option<&Target> {
        self.targets.get(id.as_ref())
    }

    pub fn get_targets_iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Top-level `copy: true` forces copy mode for every target.
    pub fn force_copy(&self) -> bool {
        self.force_copy
    }

    fn parse_targets_from_yaml(
        top_level: &LinkedHashMap<Yaml, Yaml>,
    ) -> Result<Vec<Target>, TargetRegistryCreationError> {
        let empty = Yaml::Mapping(LinkedHashMap::new());
        let targets = top_level
            .get(&key("targets"))
            .unwrap_or(&empty)
            .as_mapping()
            .ok_or(TargetRegistryCreationError::TargetsNotMap)?
            .iter()
            .filter_map(|(name_node, value)| match (name_node, value) {
                (Yaml::Value(Scalar::String(name)), Yaml::Mapping(data)) => Some((name, data)),
                _ => {
                    debug!("Skipping invalid target entry: {:?}", name_node);
                    None
                }
            })
            .filter_map(|(name, data)| Target::from_target_yaml(name, data))
            .collect();

        Ok(targets)
    }

    fn validate(&self) -> Result<(), TargetRegistryCreationError> {
        let outputs = self
            .targets
            .values()
            .map(|target| (target, normalize_lexically(target.output())))
            .collect::<Vec<_>>();

        for (index, (target, output)) in outputs.iter().enumerate() {
            Self::validate_output(target, output)?;

            for (earlier, earlier_output) in &outputs[..index] {
                ensure!(
                    earlier_output != output,
                    DuplicateOutputSnafu {
                        output: output.display().to_string(),
                        first_target: earlier.id(),
                        second_target: target.id(),
                    }
                );
                let nested = if contains_path(earlier_output, output) {
                    Some((earlier, target))
                } else if contains_path(output, earlier_output) {
                    Some((target, earlier))
                } else {
                    None
                };
                if let Some((outer, inner)) = nested {
                    return NestedOutputSnafu {
                        outer_target: outer.id(),
                        outer_output: outer.output().display().to_string(),
                        inner_target: inner.id(),
                        inner_output: inner.output().display().to_string(),
                    }
                    .fail();
                }
            }
        }

        for target in self.targets.values() {
            if let Some(dependency) = target
                .dependencies()
                .iter()
                .find(|dependency| !self.targets.contains_key(dependency.as_str()))
            {
                return UnknownDependencySnafu {
                    target_name: target.id(),
                    dependency: dependency.as_str(),
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Lexical checks only; `Target::run` repeats them against the real root.
    fn validate_output(target: &Target, output: &Path) -> Result<(), TargetRegistryCreationError> {
        // Empty or made of `..` only: the output is the root or one of its ancestors.
        ensure!(
            !output
                .components()
                .all(|component| component == Component::ParentDir),
            OutputContainsRootSnafu {
                target_name: target.id(),
                output: target.output().display().to_string(),
            }
        );

        if let Some(input) = target
            .inputs()
            .iter()
            .find(|input| contains_path(output, input))
        {
            return OutputContainsInputSnafu {
                target_name: target.id(),
                output: target.output().display().to_string(),
                input: input.display().to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

impl TryFrom<&str> for TargetRegistry {
    type Error = TargetRegistryCreationError;

    fn try_from(contents: &str) -> Result<Self, Self::Error> {
        let documents = Yaml::load_from_str(contents).context(ParseSnafu)?;
        let document = documents
            .first()
            .ok_or(TargetRegistryCreationError::MalformedConfig)?;

        let top_level = document
            .as_mapping()
            .ok_or(TargetRegistryCreationError::TopLevelNotMap)?;

        let force_copy = top_level
            .get(&key("copy"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let targets = Self::parse_targets_from_yaml(top_level)?
            .into_iter()
            .map(|target| (target.id().to_string(), target))
            .collect();

        let registry = TargetRegistry {
            targets,
            force_copy,
        };
        registry.validate()?;
        debug!("Loaded {} targets", registry.len());
        Ok(registry)
    }
}

#[derive(Debug, Snafu)]
pub enum TargetRegistryCreationError {
    #[snafu(display("Failed to read the config file: {}", file_path))]
    ReadError {
        file_path: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to parse the config file"))]
    ParseError { source: saphyr::ScanError },
    #[snafu(display("Improperly formatted config file"))]
    MalformedConfig,
    #[snafu(display("Top level of config should be a map"))]
    TopLevelNotMap,
    #[snafu(display("Targets section should be a map"))]
    TargetsNotMap,
    #[snafu(display(
        "Targets '{}' and '{}' both write to {}",
        first_target,
        second_target,
        output
    ))]
    DuplicateOutput {
        output: String,
        first_target: String,
        second_target: String,
    },
    #[snafu(display(
        "Output {} of target '{}' lies inside output {} of target '{}'",
        inner_output,
        inner_target,
        outer_output,
        outer_target
    ))]
    NestedOutput {
        outer_target: String,
        outer_output: String,
        inner_target: String,
        inner_output: String,
    },
    #[snafu(display("Output {} of target '{}' contains the root directory", output, target_name))]
    OutputContainsRoot { target_name: String, output: String },
    #[snafu(display(
        "Output {} of target '{}' contains its input {}",
        output,
        target_name,
        input
    ))]
    OutputContainsInput {
        target_name: String,
        output: String,
        input: String,
    },
    #[snafu(display("Target '{}' depends on unknown target '{}'", target_name, dependency))]
    UnknownDependency {
        target_name: String,
        dependency: String,
    },
}

//! Operations offered to clients: transformations and allow-list reloads.
//!
//! Requests and responses carry the camelCase names clients already use.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::allowlist::AllowListSource;
use crate::config::Config;
use crate::container::JsonlContainer;
use crate::explain::Pretty;
use crate::formula::Compiler;
use crate::registry::{ConfigParseError, Registry};
use crate::transform::{CancelToken, TransformError, TransformRequest, TransformResponse, Transformer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResponse {
    pub message: String,
    /// Zero on success, otherwise the code of a configuration error.
    pub error_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_builtins: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_imports: Option<Vec<String>>,
}

impl ReloadResponse {
    fn failed(what: &str, error: ConfigParseError) -> Self {
        log::error!("reload of {what} failed, keeping the active allow-lists: {error}");
        Self {
            message: format!("reload of {what} failed: {error}"),
            error_code: TransformError::Config(error).code(),
            allowed_builtins: None,
            allowed_imports: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub formula: String,
    pub valid: bool,
    /// One rendered explanation per error.
    pub errors: Vec<String>,
}

pub struct Service {
    config: Config,
    registry: Registry,
    transformer: Transformer,
}

impl Service {
    /// Load the allow-lists named by the configuration. Fails if either of them does not load.
    pub fn open(config: Config) -> Result<Self, ConfigParseError> {
        let registry = Registry::open(
            AllowListSource::file(&config.builtins),
            AllowListSource::file(&config.imports),
        )?;
        let container = Arc::new(JsonlContainer::new(&config.data_dir, config.codec));
        let transformer = Transformer::new(container)
            .sample_limit(config.sample_limit)
            .limits(config.limits());
        Ok(Self {
            config,
            registry,
            transformer,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run one batch against the allow-lists active when it starts.
    pub fn transform(&self, request: &TransformRequest, cancel: &CancelToken) -> TransformResponse {
        log::info!(
            "transform {} -> {} with {} calc columns",
            request.input_file_name,
            request.output_file_name,
            request.calc_columns.len()
        );
        let capabilities = self.registry.current();
        self.transformer.run(request, &capabilities, cancel)
    }

    pub fn reload_builtins(&self) -> ReloadResponse {
        match self.registry.reload_builtins() {
            Ok(capabilities) => ReloadResponse {
                message: "Allowed builtins reloaded".to_string(),
                error_code: 0,
                allowed_builtins: Some(capabilities.builtin_names()),
                allowed_imports: None,
            },
            Err(error) => ReloadResponse::failed("builtins", error),
        }
    }

    pub fn reload_imports(&self) -> ReloadResponse {
        match self.registry.reload_imports() {
            Ok(capabilities) => ReloadResponse {
                message: "Allowed imports reloaded".to_string(),
                error_code: 0,
                allowed_builtins: None,
                allowed_imports: Some(capabilities.import_names()),
            },
            Err(error) => ReloadResponse::failed("imports", error),
        }
    }

    /// Compile a formula without running it. Field names are not checked.
    pub fn check(&self, formula: &str) -> CheckResponse {
        let capabilities = self.registry.current();
        let result = Compiler::new(&capabilities)
            .limits(self.config.limits())
            .compile(formula);
        let errors = match result {
            Ok(_) => vec![],
            Err(errors) => {
                let pretty = Pretty::new(formula);
                errors
                    .iter()
                    .map(|error| match pretty.explain(error) {
                        Ok(explained) => explained.to_string(),
                        Err(_) => error.to_string(),
                    })
                    .collect()
            }
        };
        CheckResponse {
            formula: formula.to_string(),
            valid: errors.is_empty(),
            errors,
        }
    }
}

//! Hands resource identifiers to other pipelines through the parameter store.
//!
//! Entries live under `/terraform/{environment}/`. Writes overwrite whatever
//! is there. A failed write never fails the run, but it is recorded because
//! readers may keep seeing the previous value.

use crate::context::EnvironmentContext;
use crate::locator::{parameter_key, StateBackendHandle, LOCK_TABLE_NAME, STATE_BUCKET_NAME};
use crate::outcome::FailureRecord;
use cloud::{ParameterKind, ParameterStore};
use std::collections::BTreeMap;
use std::fmt;
use terraform::OutputValue;
use tracing::{debug, info, warn};

pub const REGION_NAME: &str = "region";

/// Terraform outputs published by default, keyed by output name.
pub fn default_output_mapping() -> BTreeMap<String, String> {
    ["cluster_name", "domain", "ecr_repository_url", "image_tag"]
        .into_iter()
        .map(|name| {
            (
                name.to_string(),
                format!("/terraform/{{environment}}/{}", name),
            )
        })
        .collect()
}

#[derive(Clone, PartialEq, Eq)]
pub struct PublishedEntry {
    pub key: String,
    pub value: String,
    pub kind: ParameterKind,
}

impl PublishedEntry {
    pub fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind: ParameterKind::String,
        }
    }
}

// Secure values never reach the logs
impl fmt::Debug for PublishedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self.kind {
            ParameterKind::SecureString => "<redacted>",
            ParameterKind::String => self.value.as_str(),
        };
        f.debug_struct("PublishedEntry")
            .field("key", &self.key)
            .field("value", &value)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub written: Vec<String>,
    pub failures: Vec<FailureRecord>,
}

pub struct OutputPublisher<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> OutputPublisher<'a, S>
where
    S: ParameterStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// The backend names and region every later workflow needs to find the
    /// state.
    pub fn backend_entries(
        context: &EnvironmentContext,
        backend: &StateBackendHandle,
    ) -> Vec<PublishedEntry> {
        let env = context.environment();
        vec![
            PublishedEntry::plain(parameter_key(env, STATE_BUCKET_NAME), &backend.bucket),
            PublishedEntry::plain(parameter_key(env, LOCK_TABLE_NAME), &backend.lock_table),
            PublishedEntry::plain(parameter_key(env, REGION_NAME), &backend.region),
        ]
    }

    /// Maps Terraform outputs to parameter keys. Sensitive outputs become
    /// secure strings; mapped outputs Terraform did not produce are skipped.
    pub fn output_entries(
        context: &EnvironmentContext,
        mapping: &BTreeMap<String, String>,
        outputs: &BTreeMap<String, OutputValue>,
    ) -> Vec<PublishedEntry> {
        let mut entries = Vec::new();
        for (name, key_template) in mapping {
            let Some(output) = outputs.get(name) else {
                warn!("Output {} not produced by terraform, not publishing it", name);
                continue;
            };
            entries.push(PublishedEntry {
                key: context.expand(key_template),
                value: output.as_plain_string(),
                kind: if output.sensitive {
                    ParameterKind::SecureString
                } else {
                    ParameterKind::String
                },
            });
        }
        entries
    }

    pub async fn publish(&self, entries: &[PublishedEntry]) -> PublishReport {
        let mut report = PublishReport::default();

        for entry in entries {
            match self
                .store
                .put_parameter(&entry.key, &entry.value, entry.kind)
                .await
            {
                Ok(()) => {
                    debug!("Published {} ({})", entry.key, entry.kind.as_str());
                    report.written.push(entry.key.clone());
                }
                Err(e) => {
                    warn!(
                        "Failed to publish {}: {}. Downstream consumers may read a stale value",
                        entry.key, e
                    );
                    report
                        .failures
                        .push(FailureRecord::publish(entry.key.clone(), e));
                }
            }
        }

        info!(
            "Published {}/{} parameters",
            report.written.len(),
            entries.len()
        );
        report
    }

    /// Reads back what a downstream pipeline would see for each key.
    /// Lookup errors read as absent and are logged.
    pub async fn read_back(&self, keys: &[String]) -> BTreeMap<String, Option<String>> {
        let mut values = BTreeMap::new();
        for key in keys {
            let value = match self.store.get_parameter(key).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("Could not read {}: {}", key, e);
                    None
                }
            };
            values.insert(key.clone(), value);
        }
        values
    }
}

/// Every key the publisher writes for an environment, backend keys first.
pub fn published_keys(
    context: &EnvironmentContext,
    mapping: &BTreeMap<String, String>,
) -> Vec<String> {
    let env = context.environment();
    let mut keys = vec![
        parameter_key(env, STATE_BUCKET_NAME),
        parameter_key(env, LOCK_TABLE_NAME),
        parameter_key(env, REGION_NAME),
    ];
    keys.extend(mapping.values().map(|template| context.expand(template)));
    keys
}

//! Publishing models and uploaded definition files as versioned deployments.

use crate::authoring::{graph_to_bpmn_xml, validate_graph, EditorGraph};
use crate::engine::DefinitionFilter;
use crate::engine_client::EngineClient;
use crate::error::{EntityKind, OrchestratorError};
use crate::models::ModelStore;
use crate::types::*;
use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;
use uuid::Uuid;

type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadKind {
    Definition,
    Archive,
}

/// Longest suffix first so `.bpmn20.xml` wins over `.xml`.
const UPLOAD_SUFFIXES: [(&str, UploadKind); 5] = [
    (".bpmn20.xml", UploadKind::Definition),
    (".tar.gz", UploadKind::Archive),
    (".tgz", UploadKind::Archive),
    (".bpmn", UploadKind::Definition),
    (".xml", UploadKind::Definition),
];

/// Classify an upload by extension and return the file stem.
fn classify_upload(file_name: &str) -> Option<(UploadKind, &str)> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let lower = base.to_ascii_lowercase();
    UPLOAD_SUFFIXES
        .iter()
        .find(|(suffix, _)| lower.ends_with(suffix) && lower.len() > suffix.len())
        .map(|(suffix, kind)| (*kind, &base[..base.len() - suffix.len()]))
}

fn is_archive_definition(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".bpmn") || lower.ends_with(".bpmn20.xml")
}

/// Every `.bpmn` / `.bpmn20.xml` entry of a gzip-compressed tar archive.
fn unpack_archive(file_name: &str, content: &[u8]) -> Result<Vec<DeploymentResource>> {
    let unreadable = |e: std::io::Error| {
        tracing::warn!(file_name, error = %e, "Unreadable deployment archive");
        OrchestratorError::UnsupportedFormat {
            file_name: file_name.to_string(),
        }
    };

    let gz = flate2::read::GzDecoder::new(content);
    let mut archive = tar::Archive::new(gz);
    let mut resources = Vec::new();
    for entry in archive.entries().map_err(unreadable)? {
        let mut entry = entry.map_err(unreadable)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(unreadable)?.to_string_lossy().into_owned();
        if !is_archive_definition(&path) {
            tracing::debug!(file_name, entry = %path, "Skipping non-definition archive entry");
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(unreadable)?;
        resources.push(DeploymentResource { name: path, bytes });
    }
    Ok(resources)
}

/// Process model keys become BPMN process ids.
fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

pub struct DeploymentManager {
    engine: EngineClient,
    models: Arc<dyn ModelStore>,
}

impl DeploymentManager {
    pub fn new(engine: EngineClient, models: Arc<dyn ModelStore>) -> Self {
        Self { engine, models }
    }

    // ── Models ──

    pub async fn list_models(&self) -> Result<Vec<ProcessModel>> {
        Ok(self.models.list().await?)
    }

    pub async fn get_model(&self, model_id: &str) -> Result<ProcessModel> {
        self.models
            .load(model_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Model, model_id))
    }

    pub async fn create_model(&self, name: &str, key: &str, description: &str) -> Result<ProcessModel> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::InvalidModelSource(
                "model name must not be blank".to_string(),
            ));
        }
        if !is_valid_key(key) {
            return Err(OrchestratorError::InvalidModelSource(format!(
                "model key '{}' must start with a letter or '_' and contain only letters, digits, '_', '-' or '.'",
                key
            )));
        }
        if self.models.list().await?.iter().any(|m| m.key == key) {
            return Err(OrchestratorError::InvalidModelSource(format!(
                "model key '{}' is already in use",
                key
            )));
        }

        let model = ProcessModel::new(name.trim(), key, description);
        self.models.create(&model).await?;
        tracing::info!(model_id = %model.id, key, "Model created");
        Ok(model)
    }

    /// Replace the editor source. The deployment pointer is left as is.
    pub async fn save_model_source(&self, model_id: &str, source: Vec<u8>) -> Result<ProcessModel> {
        let model = self
            .models
            .save_source(model_id, source)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Model, model_id))?;
        tracing::info!(model_id, revision = model.revision, "Model source saved");
        Ok(model)
    }

    // ── Publish / revoke ──

    /// Convert the model's editor source and deploy it as a new version.
    pub async fn publish(&self, model_id: &str, request_id: Uuid) -> Result<Deployment> {
        let model = self.get_model(model_id).await?;
        if !model.has_source() {
            tracing::warn!(model_id, "Publish rejected: no editor source");
            return Err(OrchestratorError::EmptyModelSource {
                model_id: model_id.to_string(),
            });
        }
        let source = model.editor_source.as_deref().unwrap_or_default();

        let graph = EditorGraph::from_slice(source).map_err(|e| {
            OrchestratorError::InvalidModelSource(format!("editor source is not a process graph: {e}"))
        })?;
        let errors = validate_graph(&graph);
        if !errors.is_empty() {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(model_id, violations = errors.len(), "Publish rejected: invalid model");
            return Err(OrchestratorError::InvalidModelSource(joined));
        }
        let xml = graph_to_bpmn_xml(&graph, &model.key, &model.name)?;

        let deployment = self
            .engine
            .deploy(&DeploymentSource {
                request_id,
                name: model.name.clone(),
                model_id: Some(model.id.clone()),
                resources: vec![DeploymentResource {
                    name: format!("{}.bpmn20.xml", model.key),
                    bytes: xml.into_bytes(),
                }],
            })
            .await?;

        if !self
            .models
            .set_deployment(model_id, Some(deployment.id.clone()))
            .await?
        {
            tracing::warn!(model_id, deployment_id = %deployment.id, "Model vanished during publish");
        }
        tracing::info!(
            model_id,
            deployment_id = %deployment.id,
            version = deployment.version().unwrap_or_default(),
            "Model published"
        );
        Ok(deployment)
    }

    /// Delete the model's linked deployment and clear the pointer.
    pub async fn revoke(&self, model_id: &str, cascade: bool) -> Result<()> {
        let model = self.get_model(model_id).await?;
        let deployment_id = model
            .deployment_id
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Deployment, model_id))?;

        match self.engine.delete_deployment(&deployment_id, cascade).await {
            Ok(()) => {}
            // Already gone (e.g. a previous attempt committed); only the pointer is stale.
            Err(e) if e.is_not_found(EntityKind::Deployment) => {
                tracing::debug!(model_id, deployment_id = %deployment_id, "Deployment already removed");
            }
            Err(e) => {
                if let OrchestratorError::ActiveInstancesExist { count, .. } = &e {
                    tracing::warn!(model_id, deployment_id = %deployment_id, count, "Revoke blocked by active instances");
                }
                return Err(e);
            }
        }

        self.models.set_deployment(model_id, None).await?;
        tracing::info!(model_id, deployment_id = %deployment_id, cascade, "Model revoked");
        Ok(())
    }

    // ── Upload ──

    /// Deploy an uploaded definition file or `.tar.gz` archive of definitions.
    pub async fn upload_and_deploy(
        &self,
        file_name: &str,
        content: &[u8],
        name: Option<&str>,
        request_id: Uuid,
    ) -> Result<Deployment> {
        let Some((kind, stem)) = classify_upload(file_name) else {
            tracing::warn!(file_name, "Upload rejected: unsupported extension");
            return Err(OrchestratorError::UnsupportedFormat {
                file_name: file_name.to_string(),
            });
        };

        let resources = match kind {
            UploadKind::Definition => vec![DeploymentResource {
                name: file_name.to_string(),
                bytes: content.to_vec(),
            }],
            UploadKind::Archive => unpack_archive(file_name, content)?,
        };
        if resources.is_empty() {
            tracing::warn!(file_name, "Upload rejected: archive holds no definitions");
            return Err(OrchestratorError::UnsupportedFormat {
                file_name: file_name.to_string(),
            });
        }

        let deployment_name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(stem)
            .to_string();
        let deployment = self
            .engine
            .deploy(&DeploymentSource {
                request_id,
                name: deployment_name,
                model_id: None,
                resources,
            })
            .await?;
        tracing::info!(
            file_name,
            deployment_id = %deployment.id,
            definitions = deployment.definitions.len(),
            "Upload deployed"
        );
        Ok(deployment)
    }

    // ── Definitions ──

    pub async fn list_definitions(&self, page: PageRequest) -> Result<Page<ProcessDefinition>> {
        let defs = self
            .engine
            .query_definitions(&DefinitionFilter::default(), page)
            .await?;
        tracing::debug!(total = defs.total, "Definitions listed");
        Ok(defs)
    }

    /// Cascade-delete every deployment, then clear every model pointer that no
    /// longer names a live deployment, including ones an interrupted earlier
    /// run removed.
    pub async fn delete_all_definitions(&self, page: PageRequest) -> Result<Page<ProcessDefinition>> {
        let deployments = self.engine.list_deployments().await?;
        for deployment in &deployments {
            self.engine.delete_deployment(&deployment.id, true).await?;
        }

        let live: HashSet<String> = self
            .engine
            .list_deployments()
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let mut cleared = 0;
        for model in self.models.list().await? {
            if model
                .deployment_id
                .as_deref()
                .is_some_and(|id| !live.contains(id))
            {
                self.models.set_deployment(&model.id, None).await?;
                cleared += 1;
            }
        }
        tracing::info!(
            deployments = deployments.len(),
            models_cleared = cleared,
            "All definitions deleted"
        );
        self.list_definitions(page).await
    }
}

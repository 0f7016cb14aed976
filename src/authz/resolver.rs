//! Effective permission of a user on the resource a request targets.

use sea_orm::DatabaseConnection;

use crate::authz::params::RequestParams;
use crate::authz::permissions::Permission;
use crate::authz::routes::Target;
use crate::errors::GateError;
use crate::storage;
use crate::tracking::ResourceStore;

/// The resource whose stored grant decides a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantKey {
    Experiment(String),
    RegisteredModel(String),
}

pub struct Resolver<'a> {
    db: &'a DatabaseConnection,
    store: &'a dyn ResourceStore,
    default_permission: Permission,
}

impl<'a> Resolver<'a> {
    pub fn new(
        db: &'a DatabaseConnection,
        store: &'a dyn ResourceStore,
        default_permission: Permission,
    ) -> Self {
        Self {
            db,
            store,
            default_permission,
        }
    }

    /// Translate a request target into the grant that governs it.
    ///
    /// Runs and logged models are looked up in the tracking store to find their
    /// experiment; a missing parent is an error. `Ok(None)` means no grant can
    /// apply and the default permission is used.
    pub async fn locate(
        &self,
        target: &Target,
        params: &RequestParams,
    ) -> Result<Option<GrantKey>, GateError> {
        match target {
            Target::ExperimentId => Ok(Some(GrantKey::Experiment(
                params.get("experiment_id")?,
            ))),
            Target::ExperimentName => self.experiment_by_name(params).await.map(Some),
            Target::RunId => {
                let run_id = params.get("run_id")?;
                let experiment_id = self.store.run_experiment_id(&run_id).await?;
                Ok(Some(GrantKey::Experiment(experiment_id)))
            }
            Target::LoggedModelId => {
                let model_id = params.get("model_id")?;
                let experiment_id = self.store.logged_model_experiment_id(&model_id).await?;
                Ok(Some(GrantKey::Experiment(experiment_id)))
            }
            Target::RegisteredModelName => {
                Ok(Some(GrantKey::RegisteredModel(params.get("name")?)))
            }
            Target::ArtifactExperiment(experiment_id) => {
                Ok(experiment_id.clone().map(GrantKey::Experiment))
            }
        }
    }

    // Unlike a missing grant, an unknown experiment name is reported to the
    // caller as not found.
    async fn experiment_by_name(&self, params: &RequestParams) -> Result<GrantKey, GateError> {
        let name = params.get("experiment_name")?;
        match self.store.experiment_id_by_name(&name).await? {
            Some(id) => Ok(GrantKey::Experiment(id)),
            None => Err(GateError::ResourceNotFound(format!(
                "Could not find experiment with name {name}"
            ))),
        }
    }

    /// Stored grant level for `username`, or the default when none exists.
    /// Store failures other than not-found propagate.
    pub async fn grant_or_default(
        &self,
        key: Option<&GrantKey>,
        username: &str,
    ) -> Result<Permission, GateError> {
        let lookup = match key {
            None => return Ok(self.default_permission),
            Some(GrantKey::Experiment(id)) => {
                storage::get_experiment_permission(self.db, id, username)
                    .await
                    .map(|p| p.permission)
            }
            Some(GrantKey::RegisteredModel(name)) => {
                storage::get_registered_model_permission(self.db, name, username)
                    .await
                    .map(|p| p.permission)
            }
        };

        match lookup {
            Ok(permission) => Ok(permission),
            Err(e) if e.is_not_found() => Ok(self.default_permission),
            Err(e) => Err(e),
        }
    }

    pub async fn effective_permission(
        &self,
        target: &Target,
        params: &RequestParams,
        username: &str,
    ) -> Result<Permission, GateError> {
        let key = self.locate(target, params).await?;
        self.grant_or_default(key.as_ref(), username).await
    }
}

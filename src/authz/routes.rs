//! Maps `(path, method)` to the operation being invoked and the check it needs.
//!
//! Three route families exist:
//! - exact routes, looked up by literal path;
//! - pattern routes (logged models), whose paths embed identifiers and are
//!   matched with a full-string regex;
//! - the artifact proxy, whose owning experiment id is the leading segment of
//!   the artifact path.

use std::collections::HashMap;

use axum::http::Method;
use percent_encoding::percent_decode_str;
use regex::Regex;

use crate::authz::permissions::Capability;
use crate::errors::GateError;

/// Prefixes every tracking API route is registered under.
pub const API_PREFIXES: [&str; 2] = ["/api/2.0", "/ajax-api/2.0"];

pub const ARTIFACT_PROXY_PREFIX: &str = "/api/2.0/mlflow-artifacts/artifacts";

const UNPROTECTED_PREFIXES: [&str; 3] = ["/static", "/favicon.ico", "/health"];

const LOGGED_MODELS_SEGMENT: &str = "/mlflow/logged-models";

pub fn is_unprotected(path: &str) -> bool {
    UNPROTECTED_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Percent-decode a request path segment by segment, the way the tracking
/// server does before routing. Classification only ever sees decoded paths.
///
/// Segments that decode to something containing `/`, and `.`/`..` segments,
/// are rejected.
pub fn decode_path(raw: &str) -> Result<String, GateError> {
    let mut decoded = String::with_capacity(raw.len());
    for (i, segment) in raw.split('/').enumerate() {
        let segment = percent_decode_str(segment)
            .decode_utf8()
            .map_err(|_| GateError::BadRequest(format!("Invalid path encoding in '{raw}'")))?;
        if segment.contains('/') || segment == "." || segment == ".." {
            return Err(GateError::BadRequest(format!("Invalid request path '{raw}'")));
        }
        if i > 0 {
            decoded.push('/');
        }
        decoded.push_str(&segment);
    }
    Ok(decoded)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    // Experiments
    CreateExperiment,
    GetExperiment,
    GetExperimentByName,
    DeleteExperiment,
    RestoreExperiment,
    UpdateExperiment,
    SetExperimentTag,
    DeleteExperimentTag,
    SearchExperiments,
    // Runs
    CreateRun,
    GetRun,
    DeleteRun,
    RestoreRun,
    UpdateRun,
    LogMetric,
    LogBatch,
    LogModel,
    SetTag,
    DeleteTag,
    LogParam,
    GetMetricHistory,
    ListArtifacts,
    // Model registry
    CreateRegisteredModel,
    GetRegisteredModel,
    DeleteRegisteredModel,
    UpdateRegisteredModel,
    RenameRegisteredModel,
    SearchRegisteredModels,
    GetLatestVersions,
    CreateModelVersion,
    GetModelVersion,
    DeleteModelVersion,
    UpdateModelVersion,
    TransitionModelVersionStage,
    GetModelVersionDownloadUri,
    SetRegisteredModelTag,
    DeleteRegisteredModelTag,
    SetModelVersionTag,
    DeleteModelVersionTag,
    SetRegisteredModelAlias,
    DeleteRegisteredModelAlias,
    GetModelVersionByAlias,
    // Logged models
    CreateLoggedModel,
    GetLoggedModel,
    DeleteLoggedModel,
    FinalizeLoggedModel,
    SetLoggedModelTags,
    DeleteLoggedModelTag,
    LogLoggedModelParams,
    SearchLoggedModels,
    // Users and grants, served by the gateway itself
    CreateUser,
    GetUser,
    UpdateUserPassword,
    UpdateUserAdmin,
    DeleteUser,
    CreateExperimentPermission,
    GetExperimentPermission,
    UpdateExperimentPermission,
    DeleteExperimentPermission,
    CreateRegisteredModelPermission,
    GetRegisteredModelPermission,
    UpdateRegisteredModelPermission,
    DeleteRegisteredModelPermission,
}

/// Where the resource identifier for a check comes from, and which resource
/// owns the grant that decides it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    ExperimentId,
    ExperimentName,
    /// Runs inherit from their experiment.
    RunId,
    /// Logged models inherit from their experiment.
    LoggedModelId,
    /// Registered models and their versions, keyed by model name.
    RegisteredModelName,
    /// Experiment id embedded in an artifact path; `None` for listings.
    ArtifactExperiment(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Resource {
        target: Target,
        capability: Capability,
    },
    /// The `username` parameter must name the caller.
    SenderIsUser,
    AdminOnly,
}

impl Check {
    fn resource(target: Target, capability: Capability) -> Self {
        Check::Resource { target, capability }
    }
}

/// Post-response work registered for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterHook {
    GrantExperimentManage,
    GrantRegisteredModelManage,
    DropRegisteredModelGrants,
    RenameRegisteredModelGrants,
    FilterExperiments,
    FilterLoggedModels,
    FilterRegisteredModels,
}

impl Operation {
    pub fn check(&self) -> Option<Check> {
        use Capability::*;
        use Operation::*;
        use Target::*;

        let check = match self {
            GetExperiment => Check::resource(ExperimentId, Read),
            GetExperimentByName => Check::resource(ExperimentName, Read),
            DeleteExperiment | RestoreExperiment => Check::resource(ExperimentId, Delete),
            UpdateExperiment | SetExperimentTag | DeleteExperimentTag => {
                Check::resource(ExperimentId, Update)
            }

            CreateRun => Check::resource(ExperimentId, Update),
            GetRun | GetMetricHistory | ListArtifacts => Check::resource(RunId, Read),
            DeleteRun | RestoreRun => Check::resource(RunId, Delete),
            UpdateRun | LogMetric | LogBatch | LogModel | SetTag | DeleteTag | LogParam => {
                Check::resource(RunId, Update)
            }

            GetRegisteredModel
            | GetLatestVersions
            | GetModelVersion
            | GetModelVersionDownloadUri
            | GetModelVersionByAlias => Check::resource(RegisteredModelName, Read),
            UpdateRegisteredModel
            | RenameRegisteredModel
            | CreateModelVersion
            | UpdateModelVersion
            | TransitionModelVersionStage
            | SetRegisteredModelTag
            | DeleteRegisteredModelTag
            | SetModelVersionTag
            | SetRegisteredModelAlias => Check::resource(RegisteredModelName, Update),
            DeleteRegisteredModel
            | DeleteModelVersion
            | DeleteModelVersionTag
            | DeleteRegisteredModelAlias => Check::resource(RegisteredModelName, Delete),

            CreateLoggedModel => Check::resource(ExperimentId, Update),
            GetLoggedModel => Check::resource(LoggedModelId, Read),
            DeleteLoggedModel | DeleteLoggedModelTag => Check::resource(LoggedModelId, Delete),
            FinalizeLoggedModel | SetLoggedModelTags | LogLoggedModelParams => {
                Check::resource(LoggedModelId, Update)
            }

            CreateUser | UpdateUserAdmin | DeleteUser => Check::AdminOnly,
            GetUser | UpdateUserPassword => Check::SenderIsUser,
            CreateExperimentPermission
            | GetExperimentPermission
            | UpdateExperimentPermission
            | DeleteExperimentPermission => Check::resource(ExperimentId, Manage),
            CreateRegisteredModelPermission
            | GetRegisteredModelPermission
            | UpdateRegisteredModelPermission
            | DeleteRegisteredModelPermission => Check::resource(RegisteredModelName, Manage),

            CreateExperiment | SearchExperiments | CreateRegisteredModel
            | SearchRegisteredModels | SearchLoggedModels => return None,
        };
        Some(check)
    }

    pub fn after_hook(&self) -> Option<AfterHook> {
        match self {
            Operation::CreateExperiment => Some(AfterHook::GrantExperimentManage),
            Operation::CreateRegisteredModel => Some(AfterHook::GrantRegisteredModelManage),
            Operation::DeleteRegisteredModel => Some(AfterHook::DropRegisteredModelGrants),
            Operation::RenameRegisteredModel => Some(AfterHook::RenameRegisteredModelGrants),
            Operation::SearchExperiments => Some(AfterHook::FilterExperiments),
            Operation::SearchLoggedModels => Some(AfterHook::FilterLoggedModels),
            Operation::SearchRegisteredModels => Some(AfterHook::FilterRegisteredModels),
            _ => None,
        }
    }
}

/// One registered route: an operation, its path below the API prefix, and the
/// methods it accepts.
struct Endpoint {
    operation: Operation,
    path: &'static str,
    methods: Vec<Method>,
}

fn ep(operation: Operation, path: &'static str, methods: &[Method]) -> Endpoint {
    Endpoint {
        operation,
        path,
        methods: methods.to_vec(),
    }
}

fn tracking_endpoints() -> Vec<Endpoint> {
    use Operation::*;
    const GET: Method = Method::GET;
    const POST: Method = Method::POST;
    const PATCH: Method = Method::PATCH;
    const DELETE: Method = Method::DELETE;

    vec![
        ep(CreateExperiment, "/mlflow/experiments/create", &[POST]),
        ep(GetExperiment, "/mlflow/experiments/get", &[GET]),
        ep(GetExperimentByName, "/mlflow/experiments/get-by-name", &[GET]),
        ep(DeleteExperiment, "/mlflow/experiments/delete", &[POST]),
        ep(RestoreExperiment, "/mlflow/experiments/restore", &[POST]),
        ep(UpdateExperiment, "/mlflow/experiments/update", &[POST]),
        ep(SetExperimentTag, "/mlflow/experiments/set-experiment-tag", &[POST]),
        ep(DeleteExperimentTag, "/mlflow/experiments/delete-experiment-tag", &[POST]),
        ep(SearchExperiments, "/mlflow/experiments/search", &[GET, POST]),
        ep(CreateRun, "/mlflow/runs/create", &[POST]),
        ep(GetRun, "/mlflow/runs/get", &[GET]),
        ep(DeleteRun, "/mlflow/runs/delete", &[POST]),
        ep(RestoreRun, "/mlflow/runs/restore", &[POST]),
        ep(UpdateRun, "/mlflow/runs/update", &[POST]),
        ep(LogMetric, "/mlflow/runs/log-metric", &[POST]),
        ep(LogBatch, "/mlflow/runs/log-batch", &[POST]),
        ep(LogModel, "/mlflow/runs/log-model", &[POST]),
        ep(SetTag, "/mlflow/runs/set-tag", &[POST]),
        ep(DeleteTag, "/mlflow/runs/delete-tag", &[POST]),
        ep(LogParam, "/mlflow/runs/log-parameter", &[POST]),
        ep(GetMetricHistory, "/mlflow/metrics/get-history", &[GET]),
        ep(ListArtifacts, "/mlflow/artifacts/list", &[GET]),
        ep(CreateRegisteredModel, "/mlflow/registered-models/create", &[POST]),
        ep(RenameRegisteredModel, "/mlflow/registered-models/rename", &[POST]),
        ep(UpdateRegisteredModel, "/mlflow/registered-models/update", &[PATCH]),
        ep(DeleteRegisteredModel, "/mlflow/registered-models/delete", &[DELETE]),
        ep(GetRegisteredModel, "/mlflow/registered-models/get", &[GET]),
        ep(SearchRegisteredModels, "/mlflow/registered-models/search", &[GET]),
        ep(
            GetLatestVersions,
            "/mlflow/registered-models/get-latest-versions",
            &[POST, GET],
        ),
        ep(CreateModelVersion, "/mlflow/model-versions/create", &[POST]),
        ep(UpdateModelVersion, "/mlflow/model-versions/update", &[PATCH]),
        ep(
            TransitionModelVersionStage,
            "/mlflow/model-versions/transition-stage",
            &[POST],
        ),
        ep(DeleteModelVersion, "/mlflow/model-versions/delete", &[DELETE]),
        ep(GetModelVersion, "/mlflow/model-versions/get", &[GET]),
        ep(
            GetModelVersionDownloadUri,
            "/mlflow/model-versions/get-download-uri",
            &[GET],
        ),
        ep(SetRegisteredModelTag, "/mlflow/registered-models/set-tag", &[POST]),
        ep(SetModelVersionTag, "/mlflow/model-versions/set-tag", &[POST]),
        ep(
            DeleteRegisteredModelTag,
            "/mlflow/registered-models/delete-tag",
            &[DELETE],
        ),
        ep(DeleteModelVersionTag, "/mlflow/model-versions/delete-tag", &[DELETE]),
        ep(SetRegisteredModelAlias, "/mlflow/registered-models/alias", &[POST]),
        ep(DeleteRegisteredModelAlias, "/mlflow/registered-models/alias", &[DELETE]),
        ep(GetModelVersionByAlias, "/mlflow/registered-models/alias", &[GET]),
        // Logged model routes carry identifiers in the path
        ep(CreateLoggedModel, "/mlflow/logged-models", &[POST]),
        ep(SearchLoggedModels, "/mlflow/logged-models/search", &[POST]),
        ep(GetLoggedModel, "/mlflow/logged-models/<model_id>", &[GET]),
        ep(DeleteLoggedModel, "/mlflow/logged-models/<model_id>", &[DELETE]),
        ep(FinalizeLoggedModel, "/mlflow/logged-models/<model_id>", &[PATCH]),
        ep(SetLoggedModelTags, "/mlflow/logged-models/<model_id>/tags", &[PATCH]),
        ep(
            DeleteLoggedModelTag,
            "/mlflow/logged-models/<model_id>/tags/<tag_key>",
            &[DELETE],
        ),
        ep(LogLoggedModelParams, "/mlflow/logged-models/<model_id>/params", &[POST]),
    ]
}

/// Management routes served by the gateway, registered under `/api/2.0` only.
pub mod management {
    pub const CREATE_USER: &str = "/api/2.0/mlflow/users/create";
    pub const GET_USER: &str = "/api/2.0/mlflow/users/get";
    pub const UPDATE_USER_PASSWORD: &str = "/api/2.0/mlflow/users/update-password";
    pub const UPDATE_USER_ADMIN: &str = "/api/2.0/mlflow/users/update-admin";
    pub const DELETE_USER: &str = "/api/2.0/mlflow/users/delete";
    pub const CREATE_EXPERIMENT_PERMISSION: &str = "/api/2.0/mlflow/experiments/permissions/create";
    pub const GET_EXPERIMENT_PERMISSION: &str = "/api/2.0/mlflow/experiments/permissions/get";
    pub const UPDATE_EXPERIMENT_PERMISSION: &str = "/api/2.0/mlflow/experiments/permissions/update";
    pub const DELETE_EXPERIMENT_PERMISSION: &str = "/api/2.0/mlflow/experiments/permissions/delete";
    pub const CREATE_REGISTERED_MODEL_PERMISSION: &str =
        "/api/2.0/mlflow/registered-models/permissions/create";
    pub const GET_REGISTERED_MODEL_PERMISSION: &str =
        "/api/2.0/mlflow/registered-models/permissions/get";
    pub const UPDATE_REGISTERED_MODEL_PERMISSION: &str =
        "/api/2.0/mlflow/registered-models/permissions/update";
    pub const DELETE_REGISTERED_MODEL_PERMISSION: &str =
        "/api/2.0/mlflow/registered-models/permissions/delete";
}

fn management_endpoints() -> Vec<(Operation, &'static str, Method)> {
    use management::*;
    use Operation::*;

    vec![
        (CreateUser, CREATE_USER, Method::POST),
        (GetUser, GET_USER, Method::GET),
        (UpdateUserPassword, UPDATE_USER_PASSWORD, Method::PATCH),
        (UpdateUserAdmin, UPDATE_USER_ADMIN, Method::PATCH),
        (DeleteUser, DELETE_USER, Method::DELETE),
        (CreateExperimentPermission, CREATE_EXPERIMENT_PERMISSION, Method::POST),
        (GetExperimentPermission, GET_EXPERIMENT_PERMISSION, Method::GET),
        (UpdateExperimentPermission, UPDATE_EXPERIMENT_PERMISSION, Method::PATCH),
        (DeleteExperimentPermission, DELETE_EXPERIMENT_PERMISSION, Method::DELETE),
        (CreateRegisteredModelPermission, CREATE_REGISTERED_MODEL_PERMISSION, Method::POST),
        (GetRegisteredModelPermission, GET_REGISTERED_MODEL_PERMISSION, Method::GET),
        (UpdateRegisteredModelPermission, UPDATE_REGISTERED_MODEL_PERMISSION, Method::PATCH),
        (DeleteRegisteredModelPermission, DELETE_REGISTERED_MODEL_PERMISSION, Method::DELETE),
    ]
}

/// Compile a route path into a full-match regex. Each `<name>` segment becomes
/// a single-segment named capture; every other segment matches literally.
fn compile_path(path: &str) -> Regex {
    let body = path
        .split('/')
        .map(|segment| match segment.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
            Some(name) => format!("(?P<{name}>[^/]+)"),
            None => regex::escape(segment),
        })
        .collect::<Vec<_>>()
        .join("/");
    Regex::new(&format!("^{body}$")).expect("route pattern built from static paths")
}

/// A classified request: the operation plus any identifiers captured from the
/// path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub operation: Operation,
    pub path_params: Vec<(String, String)>,
}

/// Immutable lookup tables, built once at startup.
pub struct RouteTable {
    exact: HashMap<(String, Method), Operation>,
    patterns: Vec<(Regex, Method, Operation)>,
    experiment_id_in_artifact: Regex,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        let mut exact = HashMap::new();
        let mut patterns = Vec::new();

        for endpoint in tracking_endpoints() {
            for prefix in API_PREFIXES {
                let full = format!("{prefix}{}", endpoint.path);
                for method in &endpoint.methods {
                    if endpoint.path.starts_with(LOGGED_MODELS_SEGMENT) {
                        patterns.push((compile_path(&full), method.clone(), endpoint.operation));
                    } else {
                        exact.insert((full.clone(), method.clone()), endpoint.operation);
                    }
                }
            }
        }
        for (operation, path, method) in management_endpoints() {
            exact.insert((path.to_string(), method), operation);
        }

        Self {
            exact,
            patterns,
            experiment_id_in_artifact: Regex::new(r"^(\d+)/").expect("static artifact regex"),
        }
    }

    /// Find the operation registered for `(path, method)`.
    pub fn find(&self, path: &str, method: &Method) -> Option<RouteMatch> {
        if path.contains(LOGGED_MODELS_SEGMENT) {
            return self.patterns.iter().find_map(|(re, m, op)| {
                if m != method {
                    return None;
                }
                let caps = re.captures(path)?;
                let path_params = re
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        caps.name(name)
                            .map(|v| (name.to_string(), v.as_str().to_string()))
                    })
                    .collect();
                Some(RouteMatch {
                    operation: *op,
                    path_params,
                })
            });
        }

        self.exact
            .get(&(path.to_string(), method.clone()))
            .map(|op| RouteMatch {
                operation: *op,
                path_params: Vec::new(),
            })
    }

    /// Check for an artifact proxy request, or `None` when the path is not an
    /// artifact path or the method has no check.
    pub fn artifact_check(&self, path: &str, method: &Method) -> Option<Check> {
        let rest = path.strip_prefix(ARTIFACT_PROXY_PREFIX)?;
        if !(rest.is_empty() || rest.starts_with('/')) {
            return None;
        }
        let artifact_path = rest.trim_start_matches('/');

        // Listing
        if artifact_path.is_empty() {
            return Some(Check::resource(
                Target::ArtifactExperiment(None),
                Capability::Read,
            ));
        }

        let capability = match *method {
            Method::GET => Capability::Read,
            Method::PUT => Capability::Update,
            Method::DELETE => Capability::Manage,
            _ => return None,
        };
        let experiment_id = self
            .experiment_id_in_artifact
            .captures(artifact_path)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        Some(Check::resource(
            Target::ArtifactExperiment(experiment_id),
            capability,
        ))
    }
}

use crate::authz::permissions::Permission;
use crate::entities;
use crate::errors::GateError;
use crate::settings::Database as DbCfg;
use migration::MigratorTrait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i32,
    pub username: String,
    #[serde(skip)]
    pub password_hash: String,
    pub is_admin: bool,
}

/// A user together with every grant they hold, as returned by the users API.
#[derive(Debug, Clone, Serialize)]
pub struct UserDetails {
    #[serde(flatten)]
    pub user: User,
    pub experiment_permissions: Vec<ExperimentPermission>,
    pub registered_model_permissions: Vec<RegisteredModelPermission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentPermission {
    pub experiment_id: String,
    pub user_id: i32,
    pub permission: Permission,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredModelPermission {
    pub name: String,
    pub user_id: i32,
    pub permission: Permission,
}

impl From<entities::user::Model> for User {
    fn from(model: entities::user::Model) -> Self {
        Self {
            id: model.id,
            username: model.username,
            password_hash: model.password_hash,
            is_admin: model.is_admin,
        }
    }
}

impl TryFrom<entities::experiment_permission::Model> for ExperimentPermission {
    type Error = GateError;

    fn try_from(model: entities::experiment_permission::Model) -> Result<Self, Self::Error> {
        Ok(Self {
            experiment_id: model.experiment_id,
            user_id: model.user_id,
            permission: Permission::from_name(&model.permission)?,
        })
    }
}

impl TryFrom<entities::registered_model_permission::Model> for RegisteredModelPermission {
    type Error = GateError;

    fn try_from(
        model: entities::registered_model_permission::Model,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            name: model.name,
            user_id: model.user_id,
            permission: Permission::from_name(&model.permission)?,
        })
    }
}

/// Connect and bring the schema up to date.
pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, GateError> {
    let db = Database::connect(&cfg.url).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

fn unique_violation(err: DbErr, message: impl FnOnce() -> String) -> GateError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => GateError::AlreadyExists(message()),
        _ => GateError::Db(err),
    }
}

fn hash_password(password: &str) -> Result<String, GateError> {
    use argon2::password_hash::{rand_core::OsRng, SaltString};
    use argon2::{Argon2, PasswordHasher};

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| GateError::Internal(format!("Password hashing failed: {}", e)))
}

// User management functions

pub async fn create_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
    is_admin: bool,
) -> Result<User, GateError> {
    if username.is_empty() || password.is_empty() {
        return Err(GateError::BadRequest(
            "Username and password cannot be empty.".to_string(),
        ));
    }

    let password_hash = hash_password(password)?;

    let user = entities::user::ActiveModel {
        username: Set(username.to_string()),
        password_hash: Set(password_hash),
        is_admin: Set(is_admin),
        ..Default::default()
    };

    let model = user
        .insert(db)
        .await
        .map_err(|e| unique_violation(e, || format!("User (username={}) already exists", username)))?;

    Ok(model.into())
}

async fn find_user<C: ConnectionTrait>(
    db: &C,
    username: &str,
) -> Result<entities::user::Model, GateError> {
    use entities::user::{Column, Entity};

    Entity::find()
        .filter(Column::Username.eq(username))
        .one(db)
        .await?
        .ok_or_else(|| {
            GateError::ResourceNotFound(format!("User with username={} not found", username))
        })
}

pub async fn has_user(db: &DatabaseConnection, username: &str) -> Result<bool, GateError> {
    match find_user(db, username).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn get_user(db: &DatabaseConnection, username: &str) -> Result<User, GateError> {
    Ok(find_user(db, username).await?.into())
}

pub async fn get_user_details(
    db: &DatabaseConnection,
    username: &str,
) -> Result<UserDetails, GateError> {
    let user = get_user(db, username).await?;
    let experiment_permissions = list_experiment_permissions(db, username).await?;
    let registered_model_permissions = list_registered_model_permissions(db, username).await?;
    Ok(UserDetails {
        user,
        experiment_permissions,
        registered_model_permissions,
    })
}

/// Verify a password against the stored hash. Unknown users fail verification.
pub async fn authenticate_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<bool, GateError> {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};

    let user = match find_user(db, username).await {
        Ok(u) => u,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e),
    };

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| GateError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Update password and/or admin flag
pub async fn update_user(
    db: &DatabaseConnection,
    username: &str,
    password: Option<&str>,
    is_admin: Option<bool>,
) -> Result<(), GateError> {
    let user = find_user(db, username).await?;

    let mut active: entities::user::ActiveModel = user.into();
    if let Some(password) = password {
        if password.is_empty() {
            return Err(GateError::BadRequest("Password cannot be empty.".to_string()));
        }
        active.password_hash = Set(hash_password(password)?);
    }
    if let Some(is_admin) = is_admin {
        active.is_admin = Set(is_admin);
    }
    active.update(db).await?;

    Ok(())
}

/// Delete a user and every grant they hold
pub async fn delete_user(db: &DatabaseConnection, username: &str) -> Result<(), GateError> {
    let txn = db.begin().await?;
    let user = find_user(&txn, username).await?;

    entities::ExperimentPermission::delete_many()
        .filter(entities::experiment_permission::Column::UserId.eq(user.id))
        .exec(&txn)
        .await?;
    entities::RegisteredModelPermission::delete_many()
        .filter(entities::registered_model_permission::Column::UserId.eq(user.id))
        .exec(&txn)
        .await?;
    entities::User::delete_by_id(user.id).exec(&txn).await?;

    txn.commit().await?;
    Ok(())
}

/// Create the bootstrap admin account.
///
/// Several processes may start at once against the same store; losing the race
/// on the unique username is not an error.
pub async fn create_admin_user(
    db: &DatabaseConnection,
    username: &str,
    password: &str,
) -> Result<(), GateError> {
    if has_user(db, username).await? {
        return Ok(());
    }
    match create_user(db, username, password, true).await {
        Ok(_) => {
            tracing::info!(
                username,
                "Created admin user; set a new password as soon as possible via users/update-password"
            );
            Ok(())
        }
        Err(GateError::AlreadyExists(_)) => {
            tracing::debug!(username, "Admin user was created concurrently");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// Experiment grants

pub async fn create_experiment_permission(
    db: &DatabaseConnection,
    experiment_id: &str,
    username: &str,
    permission: &str,
) -> Result<ExperimentPermission, GateError> {
    let permission = Permission::from_name(permission)?;
    let user = find_user(db, username).await?;

    let grant = entities::experiment_permission::ActiveModel {
        experiment_id: Set(experiment_id.to_string()),
        user_id: Set(user.id),
        permission: Set(permission.name().to_string()),
        ..Default::default()
    };
    let model = grant.insert(db).await.map_err(|e| {
        unique_violation(e, || {
            format!(
                "Experiment permission (experiment_id={}, username={}) already exists",
                experiment_id, username
            )
        })
    })?;

    model.try_into()
}

async fn find_experiment_permission(
    db: &DatabaseConnection,
    experiment_id: &str,
    username: &str,
) -> Result<entities::experiment_permission::Model, GateError> {
    use entities::experiment_permission::{Column, Entity};

    Entity::find()
        .inner_join(entities::User)
        .filter(Column::ExperimentId.eq(experiment_id))
        .filter(entities::user::Column::Username.eq(username))
        .one(db)
        .await?
        .ok_or_else(|| {
            GateError::ResourceNotFound(format!(
                "Experiment permission with experiment_id={} and username={} not found",
                experiment_id, username
            ))
        })
}

pub async fn get_experiment_permission(
    db: &DatabaseConnection,
    experiment_id: &str,
    username: &str,
) -> Result<ExperimentPermission, GateError> {
    find_experiment_permission(db, experiment_id, username)
        .await?
        .try_into()
}

pub async fn list_experiment_permissions(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Vec<ExperimentPermission>, GateError> {
    use entities::experiment_permission::{Column, Entity};

    Entity::find()
        .inner_join(entities::User)
        .filter(entities::user::Column::Username.eq(username))
        .order_by_asc(Column::Id)
        .all(db)
        .await?
        .into_iter()
        .map(ExperimentPermission::try_from)
        .collect()
}

pub async fn update_experiment_permission(
    db: &DatabaseConnection,
    experiment_id: &str,
    username: &str,
    permission: &str,
) -> Result<(), GateError> {
    let permission = Permission::from_name(permission)?;
    let grant = find_experiment_permission(db, experiment_id, username).await?;

    let mut active: entities::experiment_permission::ActiveModel = grant.into();
    active.permission = Set(permission.name().to_string());
    active.update(db).await?;
    Ok(())
}

pub async fn delete_experiment_permission(
    db: &DatabaseConnection,
    experiment_id: &str,
    username: &str,
) -> Result<(), GateError> {
    let grant = find_experiment_permission(db, experiment_id, username).await?;
    entities::ExperimentPermission::delete_by_id(grant.id)
        .exec(db)
        .await?;
    Ok(())
}

// Registered model grants

pub async fn create_registered_model_permission(
    db: &DatabaseConnection,
    name: &str,
    username: &str,
    permission: &str,
) -> Result<RegisteredModelPermission, GateError> {
    let permission = Permission::from_name(permission)?;
    let user = find_user(db, username).await?;

    let grant = entities::registered_model_permission::ActiveModel {
        name: Set(name.to_string()),
        user_id: Set(user.id),
        permission: Set(permission.name().to_string()),
        ..Default::default()
    };
    let model = grant.insert(db).await.map_err(|e| {
        unique_violation(e, || {
            format!(
                "Registered model permission (name={}, username={}) already exists",
                name, username
            )
        })
    })?;

    model.try_into()
}

async fn find_registered_model_permission(
    db: &DatabaseConnection,
    name: &str,
    username: &str,
) -> Result<entities::registered_model_permission::Model, GateError> {
    use entities::registered_model_permission::{Column, Entity};

    Entity::find()
        .inner_join(entities::User)
        .filter(Column::Name.eq(name))
        .filter(entities::user::Column::Username.eq(username))
        .one(db)
        .await?
        .ok_or_else(|| {
            GateError::ResourceNotFound(format!(
                "Registered model permission with name={} and username={} not found",
                name, username
            ))
        })
}

pub async fn get_registered_model_permission(
    db: &DatabaseConnection,
    name: &str,
    username: &str,
) -> Result<RegisteredModelPermission, GateError> {
    find_registered_model_permission(db, name, username)
        .await?
        .try_into()
}

pub async fn list_registered_model_permissions(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Vec<RegisteredModelPermission>, GateError> {
    use entities::registered_model_permission::{Column, Entity};

    Entity::find()
        .inner_join(entities::User)
        .filter(entities::user::Column::Username.eq(username))
        .order_by_asc(Column::Id)
        .all(db)
        .await?
        .into_iter()
        .map(RegisteredModelPermission::try_from)
        .collect()
}

pub async fn update_registered_model_permission(
    db: &DatabaseConnection,
    name: &str,
    username: &str,
    permission: &str,
) -> Result<(), GateError> {
    let permission = Permission::from_name(permission)?;
    let grant = find_registered_model_permission(db, name, username).await?;

    let mut active: entities::registered_model_permission::ActiveModel = grant.into();
    active.permission = Set(permission.name().to_string());
    active.update(db).await?;
    Ok(())
}

pub async fn delete_registered_model_permission(
    db: &DatabaseConnection,
    name: &str,
    username: &str,
) -> Result<(), GateError> {
    let grant = find_registered_model_permission(db, name, username).await?;
    entities::RegisteredModelPermission::delete_by_id(grant.id)
        .exec(db)
        .await?;
    Ok(())
}

/// Drop every user's grant on a registered model name.
pub async fn delete_registered_model_permissions(
    db: &DatabaseConnection,
    name: &str,
) -> Result<u64, GateError> {
    use entities::registered_model_permission::{Column, Entity};

    let res = Entity::delete_many()
        .filter(Column::Name.eq(name))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

/// Move every grant from `old_name` to `new_name` in a single statement.
pub async fn rename_registered_model_permissions(
    db: &DatabaseConnection,
    old_name: &str,
    new_name: &str,
) -> Result<u64, GateError> {
    use entities::registered_model_permission::{Column, Entity};

    let res = Entity::update_many()
        .col_expr(Column::Name, Expr::value(new_name))
        .filter(Column::Name.eq(old_name))
        .exec(db)
        .await
        .map_err(|e| {
            unique_violation(e, || {
                format!(
                    "Registered model permissions for name={} already exist",
                    new_name
                )
            })
        })?;
    Ok(res.rows_affected)
}

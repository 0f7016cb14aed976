use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::experiment_permission::Entity")]
    ExperimentPermission,
    #[sea_orm(has_many = "super::registered_model_permission::Entity")]
    RegisteredModelPermission,
}

impl Related<super::experiment_permission::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExperimentPermission.def()
    }
}

impl Related<super::registered_model_permission::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::RegisteredModelPermission.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

pub mod experiment_permission;
pub mod registered_model_permission;
pub mod user;

pub use experiment_permission::Entity as ExperimentPermission;
pub use registered_model_permission::Entity as RegisteredModelPermission;
pub use user::Entity as User;

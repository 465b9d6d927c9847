//! Agent entity: a tunnel client identified by an opaque auth token

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agents")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Human name shown in the admin surface
    pub name: String,

    /// Opaque high-entropy auth token presented in `control_handshake`
    #[sea_orm(unique)]
    pub token: String,

    /// Disabled agents cannot authenticate
    pub enabled: bool,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// An agent owns its port forwards
    #[sea_orm(has_many = "super::port_forward::Entity")]
    PortForward,
}

impl Related<super::port_forward::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PortForward.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

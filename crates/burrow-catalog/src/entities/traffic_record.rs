//! TrafficRecord entity: append-only byte-count deltas per forward

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "traffic_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Forward this delta belongs to
    #[sea_orm(indexed)]
    pub forward_id: i64,

    /// Bytes user -> agent-side service since the previous record
    pub bytes_in: i64,

    /// Bytes agent-side service -> user since the previous record
    pub bytes_out: i64,

    pub recorded_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// A record belongs to a forward
    #[sea_orm(
        belongs_to = "super::port_forward::Entity",
        from = "Column::ForwardId",
        to = "super::port_forward::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    PortForward,
}

impl Related<super::port_forward::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PortForward.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

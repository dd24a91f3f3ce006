//! The public record operations: one module per record shape, one
//! operation per verb. Each verb validates against the catalog, routes
//! through the insertion plans, and composes the pool with single-shard
//! queries or the cross-shard coordinator.

pub mod alias;
pub mod entity;
pub mod name;
pub mod node;
pub mod property;
pub mod relationship;

use serde::{Deserialize, Serialize};

use models::{Id, Value};
use warren_sql::Table;

use crate::catalog::FlagSet;
use crate::error::Error;
use crate::Ctx;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Id,
    pub ctx: Ctx,
    pub flags: FlagSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Id,
    pub ctx: Ctx,
    pub value: Value,
    pub flags: FlagSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub base_id: Id,
    pub ctx: Ctx,
    pub value: Value,
    pub flags: FlagSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    pub base_id: Id,
    pub ctx: Ctx,
    pub value: String,
    pub flags: FlagSet,
    pub pos: i32,
}

/// The owner of an alias value, as resolved through the lookup table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasOwner {
    pub base_id: Id,
    pub ctx: Ctx,
    pub value: String,
    pub flags: FlagSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Name {
    pub base_id: Id,
    pub ctx: Ctx,
    pub value: String,
    pub flags: FlagSet,
    pub pos: i32,
}

/// One hit of a name search, resolved from a lookup row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameMatch {
    pub base_id: Id,
    pub ctx: Ctx,
    pub value: String,
    pub flags: FlagSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub base_id: Id,
    pub rel_id: Id,
    pub ctx: Ctx,
    pub forward: bool,
    pub flags: FlagSet,
    pub pos: i32,
}

/// An opaque paging token for [`name::search`], carrying where the
/// previous page ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchCursor {
    Prefix { value: String },
    Phonetic { code: String, base_id: Id },
}

pub(crate) fn no_object(table: Table, ctx: Ctx, id: Id) -> Error {
    Error::NoObject(format!("{table}<{ctx}/{id}>"))
}

pub mod component;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod query;
pub mod rel;

pub use component::{Component, ComponentDef, Instance};
pub use config::Config;
pub use db::{Db, Row};
pub use engine::{Engine, EngineOptions, Relations};
pub use error::{CompgraphError, Result};
pub use query::{Aggregate, Filters, Group, OrderKey, SortDir, SqlExpr, DEFAULT_LIMIT, UNBOUNDED};
pub use rel::{Direction, Edge};

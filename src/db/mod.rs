pub mod compile;
pub mod constraints;
pub mod lifetime_split;
pub mod prod_db;
pub mod profile;
pub mod reconcile;
pub mod scale;
pub mod schema;

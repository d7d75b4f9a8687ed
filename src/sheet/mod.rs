pub mod dqi;
pub mod melt;
pub mod table;
pub mod vintage;

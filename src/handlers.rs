pub mod auth;
pub mod catalogs;
pub mod health;
pub mod import;

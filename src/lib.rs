pub mod auth;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod dialer;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod provisioner;
pub mod rbac;
pub mod registration;
pub mod registry;
pub mod settings;
pub mod store;

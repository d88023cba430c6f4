pub mod api;
pub mod config;
pub mod controllers;
pub mod registry;
pub mod storage;
pub mod util;
pub mod validator;

#[cfg(test)]
pub mod fixtures;

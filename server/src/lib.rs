pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod web;

mod integration_tests;

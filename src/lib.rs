pub mod audit;
pub mod board;
pub mod columns;
pub mod config;
pub mod db;
pub mod detect;
pub mod gateway;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod reconcile;
pub mod staging;
pub mod validate;

pub mod config;
pub mod corpus;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod textutil;
pub mod translate;
pub mod tsv;

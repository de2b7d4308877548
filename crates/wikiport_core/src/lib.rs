//! Core library for wikiport: reads pages out of a MediaWiki instance,
//! converts their rendered HTML to Confluence-ready markup, and writes the
//! result into a Confluence space, a local mirror, or both.

pub mod cache;
pub mod config;
pub mod confluence;
pub mod convert;
pub mod migrate;
pub mod mirror;
pub mod report;
pub mod retry;
pub mod sync;
pub mod titles;
pub mod tree;
pub mod wiki;

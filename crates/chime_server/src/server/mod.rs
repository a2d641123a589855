#![forbid(unsafe_code)]

pub mod auth;
pub mod cache;
pub mod errors;
pub mod file_cache;
pub mod params;
pub mod publish;
pub mod relay;
pub mod router;
pub mod server;
pub mod subscribe;
pub mod topic;
pub mod visitor;
pub mod ws;

#[cfg(test)]
mod testutil;

#[cfg(test)]
mod cache_tests;

#[cfg(test)]
mod publish_tests;




#[cfg(test)]
mod visitor_tests;
